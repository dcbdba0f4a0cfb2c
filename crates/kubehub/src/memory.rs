//! In-RAM control plane. Behaves like an API server for the calls the gateway contract
//! covers, records every call in order, and lets callers script deletion timing and failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use kctl_core::{
    CancelHandle, ChangeEvent, CreateOptions, DeleteOptions, DesiredState, GatewayError, LabelSelector, ObservedState,
    ResourceGateway, ResourceKind, Subscription,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::debug;

/// How a successful delete of a given kind plays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteBehavior {
    /// Object disappears and a `Deleted` event is published.
    #[default]
    Immediate,
    /// Object disappears but no event is published (the watch missed it).
    Silent,
    /// Object stays, marked terminating, and only a `Modified` event is published.
    Never,
}

/// Gateway operations, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    DryRun,
    Create,
    Delete,
    Subscribe,
    List,
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Get { kind: ResourceKind, name: String },
    Create { kind: ResourceKind, name: String, dry_run: bool },
    Delete { kind: ResourceKind, name: String, grace_period_seconds: Option<u32> },
    Subscribe { kind: ResourceKind, selector: String },
    List { kind: ResourceKind, selector: String },
}

type Key = (ResourceKind, String, String);

struct Subscriber {
    kind: ResourceKind,
    namespace: String,
    selector: LabelSelector,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, ObservedState>,
    calls: Vec<GatewayCall>,
    subscribers: Vec<Subscriber>,
    behavior: HashMap<ResourceKind, DeleteBehavior>,
    failures: HashMap<Op, GatewayError>,
    delete_failures: HashMap<String, GatewayError>,
    rv: u64,
}

impl State {
    fn publish(&mut self, ev: ChangeEvent) {
        let Some(obj) = ev.object().cloned() else { return };
        self.subscribers.retain(|s| !s.tx.is_closed());
        for s in &self.subscribers {
            if s.kind == obj.kind && s.namespace == obj.namespace && s.selector.matches(&obj.labels) {
                let _ = s.tx.try_send(ev.clone());
            }
        }
    }

    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn failure(&self, op: Op) -> Result<(), GatewayError> {
        match self.failures.get(&op) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Cheaply cloneable handle; clones share one control plane.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
}

impl MemoryGateway {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test; keep going with its data.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store an object as if it had been created earlier. Missing namespace defaults to `default`.
    pub fn seed(&self, kind: ResourceKind, mut raw: Json) -> ObservedState {
        let mut st = self.lock();
        let rv = st.next_rv();
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.entry("namespace").or_insert_with(|| Json::String("default".into()));
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        let obj = ObservedState::from_raw(kind, raw);
        st.objects.insert((kind, obj.namespace.clone(), obj.name.clone()), obj.clone());
        obj
    }

    pub fn set_delete_behavior(&self, kind: ResourceKind, behavior: DeleteBehavior) {
        self.lock().behavior.insert(kind, behavior);
    }

    pub fn fail(&self, op: Op, err: GatewayError) {
        self.lock().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: Op) {
        self.lock().failures.remove(&op);
    }

    /// Fail deletes of one object name only.
    pub fn fail_delete_of(&self, name: impl Into<String>, err: GatewayError) {
        self.lock().delete_failures.insert(name.into(), err);
    }

    /// Remove an object without publishing anything.
    pub fn forget(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ObservedState> {
        self.lock().objects.remove(&(kind, namespace.to_string(), name.to_string()))
    }

    /// Publish an arbitrary event to matching subscribers.
    pub fn emit(&self, ev: ChangeEvent) {
        self.lock().publish(ev);
    }

    /// Push an `Error` event to every live subscriber of `kind`.
    pub fn emit_error(&self, kind: ResourceKind, message: &str) {
        let st = self.lock();
        for s in st.subscribers.iter().filter(|s| s.kind == kind) {
            let _ = s.tx.try_send(ChangeEvent::Error(message.to_string()));
        }
    }

    /// Close every subscription from the server side.
    pub fn drop_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ObservedState> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<ObservedState> {
        self.lock().objects.values().filter(|o| o.kind == kind).cloned().collect()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Real (non dry-run) creates of `kind`.
    pub fn creates(&self, kind: ResourceKind) -> usize {
        self.count(|c| matches!(c, GatewayCall::Create { kind: k, dry_run: false, .. } if *k == kind))
    }

    pub fn deletes(&self, kind: ResourceKind) -> usize {
        self.count(|c| matches!(c, GatewayCall::Delete { kind: k, .. } if *k == kind))
    }

    pub fn subscribes(&self) -> usize {
        self.count(|c| matches!(c, GatewayCall::Subscribe { .. }))
    }

    /// Subscriptions whose receiving side is still open.
    pub fn live_subscriptions(&self) -> usize {
        let mut st = self.lock();
        st.subscribers.retain(|s| !s.tx.is_closed());
        st.subscribers.len()
    }
}

#[async_trait::async_trait]
impl ResourceGateway for MemoryGateway {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<ObservedState>, GatewayError> {
        let mut st = self.lock();
        st.calls.push(GatewayCall::Get { kind, name: name.to_string() });
        st.failure(Op::Get)?;
        Ok(st.objects.get(&(kind, namespace.to_string(), name.to_string())).cloned())
    }

    async fn create(&self, desired: &DesiredState, opts: CreateOptions) -> Result<ObservedState, GatewayError> {
        let mut st = self.lock();
        st.calls.push(GatewayCall::Create { kind: desired.kind, name: desired.name.clone(), dry_run: opts.dry_run });
        st.failure(if opts.dry_run { Op::DryRun } else { Op::Create })?;
        let key = (desired.kind, desired.namespace.clone(), desired.name.clone());
        if st.objects.contains_key(&key) {
            return Err(GatewayError::api(409, "AlreadyExists", format!("{} \"{}\" already exists", desired.kind, desired.name)));
        }
        let mut raw = desired.manifest.clone();
        if opts.dry_run {
            return Ok(ObservedState::from_raw(desired.kind, raw));
        }
        let rv = st.next_rv();
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        let obj = ObservedState::from_raw(desired.kind, raw);
        st.objects.insert(key, obj.clone());
        st.publish(ChangeEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str, opts: DeleteOptions) -> Result<(), GatewayError> {
        let mut st = self.lock();
        st.calls.push(GatewayCall::Delete { kind, name: name.to_string(), grace_period_seconds: opts.grace_period_seconds });
        st.failure(Op::Delete)?;
        if let Some(e) = st.delete_failures.get(name) {
            return Err(e.clone());
        }
        let key = (kind, namespace.to_string(), name.to_string());
        if !st.objects.contains_key(&key) {
            return Err(GatewayError::api(404, "NotFound", format!("{} \"{}\" not found", kind, name)));
        }
        match st.behavior.get(&kind).copied().unwrap_or_default() {
            DeleteBehavior::Immediate => {
                if let Some(obj) = st.objects.remove(&key) {
                    st.publish(ChangeEvent::Deleted(obj));
                }
            }
            DeleteBehavior::Silent => {
                st.objects.remove(&key);
            }
            DeleteBehavior::Never => {
                let rv = st.next_rv();
                if let Some(obj) = st.objects.get_mut(&key) {
                    if let Some(meta) = obj.raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                        meta.insert("deletionTimestamp".into(), Json::String("1970-01-01T00:00:00Z".into()));
                    }
                    obj.resource_version = Some(rv);
                    let snapshot = obj.clone();
                    st.publish(ChangeEvent::Modified(snapshot));
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Subscription, GatewayError> {
        let mut st = self.lock();
        st.calls.push(GatewayCall::Subscribe { kind, selector: selector.to_string() });
        st.failure(Op::Subscribe)?;
        let (tx, rx) = mpsc::channel(64);
        st.subscribers.push(Subscriber { kind, namespace: namespace.to_string(), selector: selector.clone(), tx });
        // Dropping the handle is enough here: closing the receiver unregisters the subscriber.
        let (cancel, _cancel_rx) = CancelHandle::pair();
        debug!(kind = %kind, ns = %namespace, selector = %selector, "memory: subscribed");
        Ok(Subscription { events: rx, cancel })
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Vec<ObservedState>, GatewayError> {
        let mut st = self.lock();
        st.calls.push(GatewayCall::List { kind, selector: selector.to_string() });
        st.failure(Op::List)?;
        Ok(st
            .objects
            .values()
            .filter(|o| o.kind == kind && o.namespace == namespace && selector.matches(&o.labels))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, app: &str) -> Json {
        json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": name, "namespace": "ns", "labels": { "app": app } } })
    }

    #[tokio::test]
    async fn delete_publishes_to_matching_subscribers_only() {
        let gw = MemoryGateway::new();
        gw.seed(ResourceKind::Pod, pod("a", "x"));
        gw.seed(ResourceKind::Pod, pod("b", "y"));
        let mut sx = gw.subscribe(ResourceKind::Pod, "ns", &LabelSelector::new().with("app", "x")).await.unwrap();
        let mut sy = gw.subscribe(ResourceKind::Pod, "ns", &LabelSelector::new().with("app", "y")).await.unwrap();

        gw.delete(ResourceKind::Pod, "ns", "a", DeleteOptions::default()).await.unwrap();
        let ev = sx.events.recv().await.expect("event for app=x");
        assert!(matches!(ev, ChangeEvent::Deleted(ref o) if o.name == "a"));
        assert!(sy.events.try_recv().is_err());
        assert!(gw.object(ResourceKind::Pod, "ns", "a").is_none());
    }

    #[tokio::test]
    async fn never_behavior_keeps_object_terminating() {
        let gw = MemoryGateway::new();
        gw.seed(ResourceKind::Pod, pod("a", "x"));
        gw.set_delete_behavior(ResourceKind::Pod, DeleteBehavior::Never);
        let mut sub = gw.subscribe(ResourceKind::Pod, "ns", &LabelSelector::new()).await.unwrap();
        gw.delete(ResourceKind::Pod, "ns", "a", DeleteOptions::default()).await.unwrap();
        assert!(matches!(sub.events.recv().await, Some(ChangeEvent::Modified(_))));
        let obj = gw.object(ResourceKind::Pod, "ns", "a").expect("still present");
        assert!(obj.raw["metadata"].get("deletionTimestamp").is_some());
    }

    #[tokio::test]
    async fn dry_run_create_does_not_persist_and_conflicts_are_reported() {
        let gw = MemoryGateway::new();
        let d = DesiredState::from_manifest(None, pod("a", "x"), "ns").unwrap();
        gw.create(&d, CreateOptions::dry_run()).await.unwrap();
        assert!(gw.object(ResourceKind::Pod, "ns", "a").is_none());
        gw.create(&d, CreateOptions::default()).await.unwrap();
        let err = gw.create(&d, CreateOptions::default()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(gw.creates(ResourceKind::Pod), 2);
    }

    #[tokio::test]
    async fn injected_failures_and_dropped_receivers() {
        let gw = MemoryGateway::new();
        gw.fail(Op::Get, GatewayError::Transport("down".into()));
        assert!(gw.get(ResourceKind::Pod, "ns", "a").await.is_err());
        gw.clear_failure(Op::Get);
        assert!(gw.get(ResourceKind::Pod, "ns", "a").await.unwrap().is_none());

        let sub = gw.subscribe(ResourceKind::Pod, "ns", &LabelSelector::new()).await.unwrap();
        assert_eq!(gw.live_subscriptions(), 1);
        drop(sub);
        assert_eq!(gw.live_subscriptions(), 0);
    }
}
