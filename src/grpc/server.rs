use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::agent::{AgentController, AgentError, TurnReply};
use crate::history::{ConversationSummary, DataRecord, ToolCallRecord};
use crate::metrics::TRANSPORT_REQUESTS;

// Include the generated proto code
pub mod proto {
    tonic::include_proto!("chi.agent");
}

use proto::agent_service_server::{AgentService, AgentServiceServer};
use proto::{
    AskRequest, AskResponse, ClearRequest, ClearResponse, DataRequest, DataResponse,
    DeleteConversationRequest, DeleteConversationResponse, DeleteDataRecordRequest,
    DeleteDataRecordResponse, HistoryRequest, HistoryResponse, StatusRequest, StatusResponse,
};

/// History and data listings when the client sends `limit = 0`
pub const DEFAULT_LIST_LIMIT: usize = 30;

/// Map turn-level failures onto gRPC status codes
pub fn status_from_agent_error(err: AgentError) -> Status {
    match err {
        AgentError::AgentUnavailable(e) => Status::unavailable(format!("agent unavailable: {}", e)),
        AgentError::Model(e) => Status::internal(format!("model error: {}", e)),
        AgentError::NotFound(what) => Status::not_found(what),
        AgentError::InvalidRequest(msg) => Status::invalid_argument(msg),
        AgentError::Storage(e) => Status::internal(format!("storage error: {}", e)),
    }
}

fn limit_or_default(limit: u32) -> usize {
    if limit == 0 {
        DEFAULT_LIST_LIMIT
    } else {
        limit as usize
    }
}

impl From<&ToolCallRecord> for proto::ToolCallSummary {
    fn from(record: &ToolCallRecord) -> Self {
        Self {
            tool: record.tool.clone(),
            arguments_json: record.arguments.to_string(),
            result_json: record.result.to_string(),
            is_error: record.is_error,
            duration_ms: record.duration_ms,
        }
    }
}

impl From<TurnReply> for AskResponse {
    fn from(turn: TurnReply) -> Self {
        Self {
            tool_calls: turn.tool_calls.iter().map(Into::into).collect(),
            reply: turn.reply,
            conversation_id: turn.conversation_id,
            rounds: turn.rounds as u32,
            limit_reached: turn.limit_reached,
            trace_id: turn.trace_id,
        }
    }
}

impl From<ConversationSummary> for proto::ConversationSummary {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            id: summary.id,
            created_at: summary.created_at.to_rfc3339(),
            last_activity: summary.last_activity.to_rfc3339(),
            message_count: summary.message_count,
            preview: summary.preview,
        }
    }
}

impl From<DataRecord> for proto::DataRecord {
    fn from(record: DataRecord) -> Self {
        Self {
            id: record.id,
            conversation_id: record.conversation_id.unwrap_or_default(),
            tool: record.tool,
            data_json: record.data.to_string(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

/// gRPC front end for the desktop UI
pub struct AgentServer {
    controller: Arc<AgentController>,
}

impl AgentServer {
    pub fn new(controller: Arc<AgentController>) -> Self {
        Self { controller }
    }

    pub fn into_service(self) -> AgentServiceServer<Self> {
        AgentServiceServer::new(self)
    }
}

fn count(method: &str) {
    TRANSPORT_REQUESTS.with_label_values(&["grpc", method]).inc();
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    async fn ask(&self, request: Request<AskRequest>) -> Result<Response<AskResponse>, Status> {
        count("ask");
        let start = Instant::now();
        let req = request.into_inner();
        let conversation_id = (!req.conversation_id.is_empty()).then_some(req.conversation_id);

        // The turn runs on its own task so a client hanging up does not cancel it;
        // the reply is simply dropped in that case.
        let controller = Arc::clone(&self.controller);
        let turn = tokio::spawn(async move {
            controller
                .handle_turn(conversation_id.as_deref(), &req.text)
                .await
        });

        let reply = turn
            .await
            .map_err(|e| Status::internal(format!("turn task failed: {}", e)))?
            .map_err(status_from_agent_error)?;

        info!(
            conversation_id = %reply.conversation_id,
            trace_id = %reply.trace_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Ask completed"
        );
        Ok(Response::new(reply.into()))
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        count("get_status");
        Ok(Response::new(StatusResponse {
            status: self.controller.status().as_str().to_string(),
            turns_in_flight: self.controller.turns_in_flight() as u32,
        }))
    }

    async fn get_history(
        &self,
        request: Request<HistoryRequest>,
    ) -> Result<Response<HistoryResponse>, Status> {
        count("get_history");
        let limit = limit_or_default(request.into_inner().limit);
        let conversations = self
            .controller
            .list_conversations(limit)
            .map_err(status_from_agent_error)?;
        Ok(Response::new(HistoryResponse {
            conversations: conversations.into_iter().map(Into::into).collect(),
        }))
    }

    async fn delete_conversation(
        &self,
        request: Request<DeleteConversationRequest>,
    ) -> Result<Response<DeleteConversationResponse>, Status> {
        count("delete_conversation");
        let id = request.into_inner().conversation_id;
        match self.controller.delete_conversation(&id) {
            Ok(()) => Ok(Response::new(DeleteConversationResponse { deleted: true })),
            Err(AgentError::NotFound(_)) => Ok(Response::new(DeleteConversationResponse { deleted: false })),
            Err(e) => Err(status_from_agent_error(e)),
        }
    }

    async fn clear_all_history(
        &self,
        _request: Request<ClearRequest>,
    ) -> Result<Response<ClearResponse>, Status> {
        count("clear_all_history");
        let removed = self.controller.clear_history().map_err(status_from_agent_error)?;
        Ok(Response::new(ClearResponse { removed }))
    }

    async fn get_data(&self, request: Request<DataRequest>) -> Result<Response<DataResponse>, Status> {
        count("get_data");
        let limit = limit_or_default(request.into_inner().limit);
        let records = self.controller.data_records(limit).map_err(status_from_agent_error)?;
        Ok(Response::new(DataResponse {
            records: records.into_iter().map(Into::into).collect(),
        }))
    }

    async fn delete_data_record(
        &self,
        request: Request<DeleteDataRecordRequest>,
    ) -> Result<Response<DeleteDataRecordResponse>, Status> {
        count("delete_data_record");
        let id = request.into_inner().id;
        match self.controller.delete_data_record(id) {
            Ok(()) => Ok(Response::new(DeleteDataRecordResponse { deleted: true })),
            Err(AgentError::NotFound(_)) => Ok(Response::new(DeleteDataRecordResponse { deleted: false })),
            Err(e) => Err(status_from_agent_error(e)),
        }
    }

    async fn clear_data(&self, _request: Request<ClearRequest>) -> Result<Response<ClearResponse>, Status> {
        count("clear_data");
        let removed = self.controller.clear_data().map_err(status_from_agent_error)?;
        Ok(Response::new(ClearResponse { removed }))
    }
}

/// Bind the UI socket, owner-only
///
/// A stale socket file from a previous run is removed first.
pub fn bind_socket(socket_path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => warn!(path = %socket_path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Serve the UI transport until `shutdown` resolves
pub async fn serve(
    controller: Arc<AgentController>,
    listener: UnixListener,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    let incoming = UnixListenerStream::new(listener);
    tonic::transport::Server::builder()
        .add_service(AgentServer::new(controller).into_service())
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
}
