//! kctl public API façade (in-process).
//!
//! Turns update/delete requests into coordinator calls and shapes terminal outcomes
//! into response envelopes a transport can return as-is.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kctl_core::{
    CompletionMode, DeleteOutcome, DesiredState, ObjectState, RecreateConfig, ResourceDescriptor, ResourceGateway,
    ResourceKind, SweepResult, UpdateError, UpdateOutcome,
};
use kctl_ops::Coordinator;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

/// API errors: only malformed requests end here; protocol failures travel in responses.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KctlError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KctlResult<T> = Result<T, KctlError>;

/// Full desired state for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Used when the manifest carries no `kind`.
    pub kind: Option<ResourceKind>,
    pub manifest: Json,
    /// Overrides the configured deletion timeout.
    pub timeout: Option<Duration>,
}

impl UpdateRequest {
    pub fn from_yaml(yaml: &str) -> KctlResult<Self> {
        let manifest: Json = serde_yaml::from_str(yaml).map_err(|e| KctlError::Validation(format!("invalid manifest: {}", e)))?;
        Ok(Self { kind: None, manifest, timeout: None })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Created,
    Recreated,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateResponse {
    pub status: UpdateStatus,
    pub code: u16,
    pub message: String,
    /// Set when the previous object is gone and its replacement was not created.
    pub object_absent: bool,
    pub swept: Option<usize>,
    pub sweep_errors: Vec<String>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    NotFound,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResponse {
    pub status: DeleteStatus,
    pub code: u16,
    pub message: String,
    pub swept: Option<usize>,
    pub sweep_errors: Vec<String>,
}

fn failure_code(e: &UpdateError) -> u16 {
    match e {
        UpdateError::Mismatch(_) => 400,
        UpdateError::Validation(g) => g.code().filter(|c| *c >= 400).unwrap_or(422),
        UpdateError::Recreate(_) => 500,
        UpdateError::Subscription(_) => 502,
        other => other.gateway().and_then(|g| g.code()).unwrap_or(502),
    }
}

fn sweep_fields(sweep: Option<&SweepResult>) -> (Option<usize>, Vec<String>) {
    match sweep {
        Some(s) => (Some(s.deleted), s.errors.iter().map(|e| e.to_string()).collect()),
        None => (None, Vec::new()),
    }
}

impl UpdateResponse {
    pub fn from_outcome(key: &str, outcome: &UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Completed(c) => {
                let (swept, sweep_errors) = sweep_fields(c.sweep.as_ref());
                let (status, code, verb) = match c.mode {
                    CompletionMode::Created => (UpdateStatus::Created, 201, "created"),
                    CompletionMode::Recreated => (UpdateStatus::Recreated, 200, "recreated"),
                };
                Self {
                    status,
                    code,
                    message: format!("{} {}", key, verb),
                    object_absent: false,
                    swept,
                    sweep_errors,
                    resource_version: c.object.resource_version.clone(),
                }
            }
            UpdateOutcome::TimedOut { waited } => Self {
                status: UpdateStatus::TimedOut,
                code: 504,
                message: format!("{}: deletion not observed within {}s; object may be stuck terminating", key, waited.as_secs()),
                object_absent: false,
                swept: None,
                sweep_errors: Vec::new(),
                resource_version: None,
            },
            UpdateOutcome::Failed(e) => Self {
                status: UpdateStatus::Failed,
                code: failure_code(e),
                message: format!("{}: {}", key, e),
                object_absent: e.object_state() == ObjectState::Absent,
                swept: None,
                sweep_errors: Vec::new(),
                resource_version: None,
            },
        }
    }
}

impl DeleteResponse {
    pub fn from_outcome(key: &str, outcome: &DeleteOutcome) -> Self {
        let plain = |status, code, message: String| Self { status, code, message, swept: None, sweep_errors: Vec::new() };
        match outcome {
            DeleteOutcome::Deleted { sweep } => {
                let (swept, sweep_errors) = sweep_fields(sweep.as_ref());
                Self { status: DeleteStatus::Deleted, code: 200, message: format!("{} deleted", key), swept, sweep_errors }
            }
            DeleteOutcome::NotFound => plain(DeleteStatus::NotFound, 404, format!("{} not found", key)),
            DeleteOutcome::TimedOut { waited } => plain(
                DeleteStatus::TimedOut,
                504,
                format!("{}: deletion not observed within {}s", key, waited.as_secs()),
            ),
            DeleteOutcome::Failed(e) => plain(DeleteStatus::Failed, failure_code(e), format!("{}: {}", key, e)),
        }
    }
}

/// kctl API surface consumed by frontends.
#[async_trait::async_trait]
pub trait KctlApi: Send + Sync {
    /// Create the object, or recreate it when it already exists.
    async fn update(&self, req: UpdateRequest) -> KctlResult<UpdateResponse>;

    /// Dry-run the desired state without touching the live object.
    async fn validate(&self, req: UpdateRequest) -> KctlResult<()>;

    /// Delete the object, wait for the deletion to be observed and sweep dependents.
    async fn delete(&self, req: DeleteRequest) -> KctlResult<DeleteResponse>;
}

/// In-process implementation over a `Coordinator`.
#[derive(Clone)]
pub struct InProcApi {
    coordinator: Coordinator,
}

impl InProcApi {
    pub fn new(gateway: Arc<dyn ResourceGateway>, config: RecreateConfig) -> Self {
        Self { coordinator: Coordinator::new(gateway, config) }
    }

    /// Connect to the cluster from the ambient kubeconfig.
    pub async fn connect(config: RecreateConfig) -> anyhow::Result<Self> {
        let gateway = kctl_kubehub::KubeGateway::try_default().await?.with_event_buffer(config.event_buffer);
        Ok(Self::new(Arc::new(gateway), config))
    }

    pub fn coordinator(&self) -> &Coordinator { &self.coordinator }

    fn desired(&self, req: &UpdateRequest) -> KctlResult<DesiredState> {
        DesiredState::from_manifest(req.kind, req.manifest.clone(), &self.coordinator.config().default_namespace)
            .map_err(|e| KctlError::Validation(e.to_string()))
    }

    fn timeout(&self, requested: Option<Duration>) -> Duration {
        requested.map(RecreateConfig::clamp_timeout).unwrap_or(self.coordinator.config().deletion_timeout)
    }
}

#[async_trait::async_trait]
impl KctlApi for InProcApi {
    async fn update(&self, req: UpdateRequest) -> KctlResult<UpdateResponse> {
        let t0 = Instant::now();
        let desired = self.desired(&req)?;
        let descriptor = desired.descriptor();
        info!(key = %descriptor.key(), "api: update start");
        let outcome = self.coordinator.update_resource(&descriptor, desired, self.timeout(req.timeout)).await;
        let resp = UpdateResponse::from_outcome(&descriptor.key(), &outcome);
        info!(key = %descriptor.key(), status = ?resp.status, code = resp.code, took_ms = %t0.elapsed().as_millis(), "api: update done");
        Ok(resp)
    }

    async fn validate(&self, req: UpdateRequest) -> KctlResult<()> {
        let desired = self.desired(&req)?;
        self.coordinator.validate(&desired).await.map(|_| ()).map_err(|e| KctlError::Validation(e.to_string()))
    }

    async fn delete(&self, req: DeleteRequest) -> KctlResult<DeleteResponse> {
        let t0 = Instant::now();
        let ns = req.namespace.clone().unwrap_or_else(|| self.coordinator.config().default_namespace.clone());
        let descriptor = ResourceDescriptor::new(req.kind, ns, req.name.clone());
        info!(key = %descriptor.key(), "api: delete start");
        let outcome = self.coordinator.delete_resource(&descriptor, self.timeout(req.timeout)).await;
        let resp = DeleteResponse::from_outcome(&descriptor.key(), &outcome);
        info!(key = %descriptor.key(), status = ?resp.status, code = resp.code, took_ms = %t0.elapsed().as_millis(), "api: delete done");
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kctl_core::{Completion, GatewayError, ObservedState};
    use serde_json::json;

    #[test]
    fn failure_codes_follow_the_stage() {
        let gw = GatewayError::api(409, "Conflict", "x");
        assert_eq!(failure_code(&UpdateError::Mismatch("x".into())), 400);
        assert_eq!(failure_code(&UpdateError::Validation(GatewayError::Transport("x".into()))), 422);
        assert_eq!(failure_code(&UpdateError::Delete(gw.clone())), 409);
        assert_eq!(failure_code(&UpdateError::Recreate(gw)), 500);
        assert_eq!(failure_code(&UpdateError::Inspect(GatewayError::Transport("x".into()))), 502);
    }

    #[test]
    fn recreate_failure_marks_object_absent() {
        let outcome = UpdateOutcome::Failed(UpdateError::Recreate(GatewayError::api(403, "Forbidden", "quota")));
        let resp = UpdateResponse::from_outcome("Pod/ns/y", &outcome);
        assert_eq!(resp.status, UpdateStatus::Failed);
        assert!(resp.object_absent);
        assert_eq!(resp.code, 500);
    }

    #[test]
    fn completed_response_serializes_snake_case() {
        let object = ObservedState::from_raw(ResourceKind::Pod, json!({ "metadata": { "name": "y", "namespace": "ns", "resourceVersion": "9" } }));
        let outcome = UpdateOutcome::Completed(Completion { mode: CompletionMode::Created, object, sweep: None });
        let resp = UpdateResponse::from_outcome("Pod/ns/y", &outcome);
        assert_eq!(resp.code, 201);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "created");
        assert_eq!(v["resource_version"], "9");
    }

    #[test]
    fn yaml_requests_parse() {
        let req = UpdateRequest::from_yaml("kind: Pod\nmetadata:\n  name: y\n").expect("yaml");
        assert_eq!(req.manifest["metadata"]["name"], "y");
        assert!(UpdateRequest::from_yaml("kind: [unclosed").is_err());
    }
}
