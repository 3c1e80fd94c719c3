//! First-start model provisioning
//!
//! On daemon start, before the marker exists, the local model list decides
//! which model the agent talks to. Missing models are pulled in the
//! background; the marker is written only once a usable model is present.
//! Nothing here is fatal to the daemon.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::client::{has_model, ChatClient};
use crate::config::ModelConfig;
use crate::history::ProvisioningMarker;

/// Outcome of [`select_model`]
#[derive(Debug)]
pub struct Provisioning {
    /// Model the agent should use from now on
    pub model: String,
    /// Background pull, when one was needed
    pub pull: Option<JoinHandle<()>>,
}

/// Pick the model to serve and start provisioning if needed
pub async fn select_model(
    client: &ChatClient,
    config: &ModelConfig,
    marker: &ProvisioningMarker,
) -> Provisioning {
    if marker.is_complete() {
        let model = match marker.read() {
            Ok(contents) => contents.model,
            Err(e) => {
                warn!(path = %marker.path().display(), error = %e, "Unreadable provisioning marker");
                config.model.clone()
            }
        };
        return Provisioning { model, pull: None };
    }

    let available = match client.list_models().await {
        Ok(models) => models,
        Err(e) => {
            warn!(error = %e, "Model endpoint unreachable, provisioning deferred to next start");
            return Provisioning {
                model: config.model.clone(),
                pull: None,
            };
        }
    };

    let model = if has_model(&available, &config.model) {
        config.model.clone()
    } else {
        config.fallback_model.clone()
    };

    if has_model(&available, &model) {
        write_marker(marker, &model);
        return Provisioning { model, pull: None };
    }

    info!(model = %model, "Model missing, pulling in the background");
    let client = client.clone().with_model(config.model.clone());
    let fallback = config.fallback_model.clone();
    let marker = marker.clone();
    let pull = tokio::spawn(async move {
        match client.ensure_model(&fallback).await {
            Ok(model) => write_marker(&marker, &model),
            Err(e) => warn!(model = %fallback, error = %e, "Model pull failed"),
        }
    });
    Provisioning {
        model,
        pull: Some(pull),
    }
}

fn write_marker(marker: &ProvisioningMarker, model: &str) {
    match marker.mark_complete(model) {
        Ok(()) => info!(model, path = %marker.path().display(), "Provisioning complete"),
        Err(e) => warn!(error = %e, "Failed to write provisioning marker"),
    }
}
