//! Client for the local UI socket
//!
//! Used by the CLI subcommands that talk to a running daemon. tonic needs a
//! URI even for Unix sockets; the connector ignores it and dials the socket
//! path instead.

use std::path::{Path, PathBuf};

use hyper_util::rt::tokio::TokioIo;
use thiserror::Error;
use tonic::transport::Endpoint;
use tower::service_fn;

use super::server::proto::agent_service_client::AgentServiceClient;
use super::server::proto::{
    AskRequest, AskResponse, ClearRequest, ConversationSummary, DataRecord, DataRequest,
    DeleteConversationRequest, DeleteDataRecordRequest, HistoryRequest, StatusRequest,
    StatusResponse,
};

/// Error type for UI client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach agent at {}: {source}", .path.display())]
    Connection {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("{}", .0.message())]
    Grpc(#[from] tonic::Status),
}

pub struct AgentClient {
    client: AgentServiceClient<tonic::transport::Channel>,
}

impl AgentClient {
    /// Connect to the daemon's UI socket
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = socket_path.as_ref().to_path_buf();

        // Probe first: tonic's lazy connect hides the actual error
        tokio::net::UnixStream::connect(&path)
            .await
            .map_err(|source| ClientError::Connection {
                path: path.clone(),
                source,
            })?;

        let channel = Endpoint::try_from("http://[::1]:50051")?
            .connect_with_connector(service_fn(move |_| {
                let p = path.clone();
                async move {
                    let stream = tokio::net::UnixStream::connect(p).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        Ok(Self {
            client: AgentServiceClient::new(channel),
        })
    }

    pub async fn ask(&mut self, text: &str, conversation_id: Option<&str>) -> Result<AskResponse, ClientError> {
        let request = AskRequest {
            text: text.to_string(),
            conversation_id: conversation_id.unwrap_or_default().to_string(),
        };
        Ok(self.client.ask(request).await?.into_inner())
    }

    pub async fn status(&mut self) -> Result<StatusResponse, ClientError> {
        Ok(self.client.get_status(StatusRequest {}).await?.into_inner())
    }

    pub async fn history(&mut self, limit: u32) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self.client.get_history(HistoryRequest { limit }).await?;
        Ok(response.into_inner().conversations)
    }

    pub async fn delete_conversation(&mut self, conversation_id: &str) -> Result<bool, ClientError> {
        let request = DeleteConversationRequest {
            conversation_id: conversation_id.to_string(),
        };
        Ok(self.client.delete_conversation(request).await?.into_inner().deleted)
    }

    pub async fn clear_history(&mut self) -> Result<u64, ClientError> {
        Ok(self.client.clear_all_history(ClearRequest {}).await?.into_inner().removed)
    }

    pub async fn data(&mut self, limit: u32) -> Result<Vec<DataRecord>, ClientError> {
        Ok(self.client.get_data(DataRequest { limit }).await?.into_inner().records)
    }

    pub async fn delete_data_record(&mut self, id: i64) -> Result<bool, ClientError> {
        let request = DeleteDataRecordRequest { id };
        Ok(self.client.delete_data_record(request).await?.into_inner().deleted)
    }

    pub async fn clear_data(&mut self) -> Result<u64, ClientError> {
        Ok(self.client.clear_data(ClearRequest {}).await?.into_inner().removed)
    }
}
