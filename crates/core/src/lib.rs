//! kctl core types: resource identity, desired/observed state, change events
//! and the gateway contract every cluster backend implements.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};

pub mod config;
pub mod error;

pub use config::RecreateConfig;
pub use error::{GatewayError, ObjectState, SweepError, UpdateError};

pub type Labels = BTreeMap<String, String>;

/// Kinds whose spec the control plane refuses to mutate in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    Job,
    CronJob,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Pod, ResourceKind::Job, ResourceKind::CronJob];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "v1",
            ResourceKind::Job | ResourceKind::CronJob => "batch/v1",
        }
    }

    /// Accepts the manifest `kind` as well as the lowercase/plural forms used on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Some(ResourceKind::Pod),
            "job" | "jobs" => Some(ResourceKind::Job),
            "cronjob" | "cronjobs" | "cj" => Some(ResourceKind::CronJob),
            _ => None,
        }
    }

    /// Kind of the dependents spawned from this kind's pod template, if any.
    pub fn child_kind(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::Pod => None,
            ResourceKind::Job | ResourceKind::CronJob => Some(ResourceKind::Pod),
        }
    }

    fn template_labels_path(&self) -> Option<&'static [&'static str]> {
        match self {
            ResourceKind::Pod => None,
            ResourceKind::Job => Some(&["spec", "template", "metadata", "labels"]),
            ResourceKind::CronJob => Some(&["spec", "jobTemplate", "spec", "template", "metadata", "labels"]),
        }
    }

    /// Selector for the dependents of `observed`: its pod-template labels.
    /// Returns `None` for kinds without dependents and for templates without labels,
    /// since an empty selector would match every pod in the namespace.
    pub fn child_selector(&self, observed: &ObservedState) -> Option<LabelSelector> {
        let path = self.template_labels_path()?;
        let mut cur = &observed.raw;
        for seg in path {
            cur = cur.get(*seg)?;
        }
        let labels = labels_from_json(cur);
        if labels.is_empty() { None } else { Some(LabelSelector::from(labels)) }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality-based label selector. Renders sorted, so the same set always yields the same string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector(Labels);

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn requirements(&self) -> &Labels { &self.0 }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl From<Labels> for LabelSelector {
    fn from(labels: Labels) -> Self { Self(labels) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Identifies the cluster object a single update attempt targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into(), labels: Labels::new() }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Stable `kind/namespace/name` key.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }

    /// Whether an observed object is the one this descriptor names.
    pub fn identifies(&self, obj: &ObservedState) -> bool {
        obj.kind == self.kind && obj.namespace == self.namespace && obj.name == self.name
    }

    /// The coordinator never renames or moves an object; `desired` must target the same identity.
    pub fn check(&self, desired: &DesiredState) -> Result<(), UpdateError> {
        if desired.kind != self.kind || desired.namespace != self.namespace || desired.name != self.name {
            return Err(UpdateError::Mismatch(format!(
                "descriptor {} does not match desired {}/{}/{}",
                self.key(), desired.kind, desired.namespace, desired.name
            )));
        }
        Ok(())
    }
}

/// Caller-supplied full specification of the object after the update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredState {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub manifest: Json,
}

impl DesiredState {
    /// Build from a manifest. The manifest's own `kind` wins over `kind_hint`; a missing
    /// `metadata.namespace` falls back to `default_namespace`. Server-populated fields are
    /// stripped so an object read back from the cluster can be re-submitted as-is.
    pub fn from_manifest(kind_hint: Option<ResourceKind>, manifest: Json, default_namespace: &str) -> Result<Self, UpdateError> {
        let mut manifest = strip_server_fields(manifest);
        let obj = manifest
            .as_object_mut()
            .ok_or_else(|| UpdateError::Mismatch("manifest must be an object".into()))?;
        let kind = match obj.get("kind").and_then(|v| v.as_str()) {
            Some(k) => ResourceKind::parse(k).ok_or_else(|| UpdateError::Mismatch(format!("unsupported kind: {}", k)))?,
            None => kind_hint.ok_or_else(|| UpdateError::Mismatch("manifest has no kind".into()))?,
        };
        obj.insert("kind".into(), Json::String(kind.as_str().into()));
        obj.entry("apiVersion").or_insert_with(|| Json::String(kind.api_version().into()));

        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        let meta = meta
            .as_object_mut()
            .ok_or_else(|| UpdateError::Mismatch("metadata must be an object".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| UpdateError::Mismatch("metadata.name is required".into()))?;
        let namespace = match meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            Some(ns) => ns.to_string(),
            None => {
                meta.insert("namespace".into(), Json::String(default_namespace.to_string()));
                default_namespace.to_string()
            }
        };
        Ok(Self { kind, namespace, name, manifest })
    }

    /// Descriptor for the object this state describes.
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::new(self.kind, self.namespace.clone(), self.name.clone()).with_labels(self.labels())
    }

    pub fn labels(&self) -> Labels {
        self.manifest
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .map(labels_from_json)
            .unwrap_or_default()
    }

    /// Copy of this state under `name + suffix`, used for dry-run validation.
    pub fn renamed(&self, suffix: &str) -> Self {
        let name = format!("{}{}", self.name, suffix);
        let mut manifest = self.manifest.clone();
        if let Some(meta) = manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("name".into(), Json::String(name.clone()));
        }
        Self { kind: self.kind, namespace: self.namespace.clone(), name, manifest }
    }
}

/// Read-only snapshot of an object as the control plane reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
    pub resource_version: Option<String>,
    pub raw: Json,
}

impl ObservedState {
    /// Shape an object payload returned by a gateway.
    pub fn from_raw(kind: ResourceKind, raw: Json) -> Self {
        let meta = raw.get("metadata");
        let field = |k: &str| meta.and_then(|m| m.get(k)).and_then(|v| v.as_str()).map(|s| s.to_string());
        Self {
            kind,
            namespace: field("namespace").unwrap_or_default(),
            name: field("name").unwrap_or_default(),
            labels: meta.and_then(|m| m.get("labels")).map(labels_from_json).unwrap_or_default(),
            resource_version: field("resourceVersion"),
            raw,
        }
    }

    pub fn selector(&self) -> LabelSelector {
        LabelSelector::from(self.labels.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One event from a gateway subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(ObservedState),
    Modified(ObservedState),
    Deleted(ObservedState),
    Error(String),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added(_) => ChangeKind::Added,
            ChangeEvent::Modified(_) => ChangeKind::Modified,
            ChangeEvent::Deleted(_) => ChangeKind::Deleted,
            ChangeEvent::Error(_) => ChangeKind::Error,
        }
    }

    pub fn object(&self) -> Option<&ObservedState> {
        match self {
            ChangeEvent::Added(o) | ChangeEvent::Modified(o) | ChangeEvent::Deleted(o) => Some(o),
            ChangeEvent::Error(_) => None,
        }
    }
}

/// Cancellation handle for a gateway-side task. Dropping it cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// An established change-event subscription. The watch is live by the time this value exists.
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::Receiver<ChangeEvent>,
    pub cancel: CancelHandle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub dry_run: bool,
}

impl CreateOptions {
    pub fn dry_run() -> Self { Self { dry_run: true } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<u32>,
    pub propagation: Option<Propagation>,
}

impl DeleteOptions {
    /// Zero grace period, background propagation: used for orphaned dependents.
    pub fn immediate(grace_seconds: u32) -> Self {
        Self { grace_period_seconds: Some(grace_seconds), propagation: Some(Propagation::Background) }
    }
}

/// Capability interface over the cluster control plane.
#[async_trait::async_trait]
pub trait ResourceGateway: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<ObservedState>, GatewayError>;

    async fn create(&self, desired: &DesiredState, opts: CreateOptions) -> Result<ObservedState, GatewayError>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str, opts: DeleteOptions) -> Result<(), GatewayError>;

    /// Returns once the watch is established server-side.
    async fn subscribe(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Subscription, GatewayError>;

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Vec<ObservedState>, GatewayError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompletionMode {
    /// Object was absent; plain create.
    Created,
    /// Object was deleted and created again.
    Recreated,
}

/// Aggregated result of removing dependents. Never fatal.
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub matched: usize,
    pub deleted: usize,
    pub errors: Vec<SweepError>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub mode: CompletionMode,
    pub object: ObservedState,
    pub sweep: Option<SweepResult>,
}

/// Terminal result of one recreate-update invocation.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Completed(Completion),
    /// Deletion was issued but not observed within the bound; the object may be stuck terminating.
    TimedOut { waited: Duration },
    Failed(UpdateError),
}

impl UpdateOutcome {
    pub fn is_completed(&self) -> bool { matches!(self, UpdateOutcome::Completed(_)) }
    pub fn is_timed_out(&self) -> bool { matches!(self, UpdateOutcome::TimedOut { .. }) }
}

/// Terminal result of a delete-and-await invocation.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    Deleted { sweep: Option<SweepResult> },
    NotFound,
    TimedOut { waited: Duration },
    Failed(UpdateError),
}

fn labels_from_json(v: &Json) -> Labels {
    v.as_object()
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Remove fields the API server owns; they make a create request invalid or stale.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "deletionTimestamp", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeKind, Completion, CompletionMode, CreateOptions, DeleteOptions, DeleteOutcome, DesiredState,
        GatewayError, LabelSelector, Labels, ObservedState, ResourceDescriptor, ResourceGateway, ResourceKind, Subscription,
        SweepResult, UpdateError, UpdateOutcome,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_raw() -> Json {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "x", "namespace": "ns", "labels": { "app": "x" }, "resourceVersion": "41" },
            "spec": { "template": { "metadata": { "labels": { "app": "x", "tier": "batch" } } } }
        })
    }

    #[test]
    fn selector_renders_sorted_and_matches_subsets() {
        let sel = LabelSelector::new().with("tier", "batch").with("app", "x");
        assert_eq!(sel.to_string(), "app=x,tier=batch");
        let mut labels = Labels::new();
        labels.insert("app".into(), "x".into());
        assert!(!sel.matches(&labels));
        labels.insert("tier".into(), "batch".into());
        labels.insert("extra".into(), "1".into());
        assert!(sel.matches(&labels));
        assert!(LabelSelector::new().matches(&Labels::new()));
    }

    #[test]
    fn child_selector_follows_kind_template_path() {
        let job = ObservedState::from_raw(ResourceKind::Job, job_raw());
        assert_eq!(job.resource_version.as_deref(), Some("41"));
        let sel = ResourceKind::Job.child_selector(&job).expect("job has dependents");
        assert_eq!(sel.to_string(), "app=x,tier=batch");

        let cron = ObservedState::from_raw(ResourceKind::CronJob, json!({
            "metadata": { "name": "c", "namespace": "ns" },
            "spec": { "jobTemplate": { "spec": { "template": { "metadata": { "labels": { "cron": "c" } } } } } }
        }));
        assert_eq!(ResourceKind::CronJob.child_selector(&cron).map(|s| s.to_string()).as_deref(), Some("cron=c"));

        let pod = ObservedState::from_raw(ResourceKind::Pod, json!({ "metadata": { "name": "p" } }));
        assert!(ResourceKind::Pod.child_selector(&pod).is_none());
    }

    #[test]
    fn child_selector_refuses_empty_template_labels() {
        let job = ObservedState::from_raw(ResourceKind::Job, json!({
            "metadata": { "name": "x" },
            "spec": { "template": { "metadata": { "labels": {} } } }
        }));
        assert!(ResourceKind::Job.child_selector(&job).is_none());
    }

    #[test]
    fn desired_from_manifest_fills_namespace_and_strips_server_fields() {
        let mut raw = job_raw();
        raw["metadata"].as_object_mut().unwrap().remove("namespace");
        raw["status"] = json!({ "active": 1 });
        let d = DesiredState::from_manifest(None, raw, "default").expect("valid manifest");
        assert_eq!(d.kind, ResourceKind::Job);
        assert_eq!(d.namespace, "default");
        assert_eq!(d.manifest["metadata"]["namespace"], "default");
        assert!(d.manifest["metadata"].get("resourceVersion").is_none());
        assert!(d.manifest.get("status").is_none());
        assert_eq!(d.descriptor().key(), "Job/default/x");
    }

    #[test]
    fn desired_from_manifest_rejects_missing_name_and_unknown_kind() {
        assert!(DesiredState::from_manifest(None, json!({ "kind": "Pod", "metadata": {} }), "default").is_err());
        assert!(DesiredState::from_manifest(None, json!({ "kind": "Deployment", "metadata": { "name": "d" } }), "default").is_err());
        let d = DesiredState::from_manifest(Some(ResourceKind::Pod), json!({ "metadata": { "name": "p" } }), "ns").expect("hinted kind");
        assert_eq!(d.manifest["apiVersion"], "v1");
    }

    #[test]
    fn renamed_copy_keeps_original_untouched() {
        let d = DesiredState::from_manifest(None, job_raw(), "default").unwrap();
        let v = d.renamed("-validate");
        assert_eq!(v.name, "x-validate");
        assert_eq!(v.manifest["metadata"]["name"], "x-validate");
        assert_eq!(d.manifest["metadata"]["name"], "x");
    }

    #[test]
    fn descriptor_check_rejects_rename() {
        let d = DesiredState::from_manifest(None, job_raw(), "default").unwrap();
        let desc = ResourceDescriptor::new(ResourceKind::Job, "ns", "y");
        assert!(matches!(desc.check(&d), Err(UpdateError::Mismatch(_))));
        assert!(ResourceDescriptor::new(ResourceKind::Job, "ns", "x").check(&d).is_ok());
    }

    #[test]
    fn parse_kind_accepts_cli_spellings() {
        assert_eq!(ResourceKind::parse("cronjobs"), Some(ResourceKind::CronJob));
        assert_eq!(ResourceKind::parse("Pod"), Some(ResourceKind::Pod));
        assert_eq!(ResourceKind::parse("deployment"), None);
    }
}
