use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::{
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use kctl_core::{
    CancelHandle, ChangeEvent, CreateOptions, DeleteOptions, DesiredState, GatewayError, LabelSelector, ObservedState,
    Propagation, ResourceGateway, ResourceKind, Subscription,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Gateway over a live API server. One implementation serves every kind through `DynamicObject`.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    event_buffer: usize,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client, event_buffer: 64 }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(crate::get_kube_client().await?))
    }

    pub fn with_event_buffer(mut self, cap: usize) -> Self {
        self.event_buffer = cap.max(1);
        self
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        ResourceKind::Job => ApiResource::erase::<Job>(&()),
        ResourceKind::CronJob => ApiResource::erase::<CronJob>(&()),
    }
}

fn map_err(e: kube::Error) -> GatewayError {
    match e {
        kube::Error::Api(ae) => GatewayError::Api { code: ae.code, reason: ae.reason, message: ae.message },
        kube::Error::SerdeError(se) => GatewayError::Decode(se.to_string()),
        other => GatewayError::Transport(other.to_string()),
    }
}

fn observed(kind: ResourceKind, obj: &DynamicObject) -> Result<ObservedState, GatewayError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| GatewayError::Decode(e.to_string()))?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(ObservedState::from_raw(kind, raw))
}

fn change_event(kind: ResourceKind, ev: WatchEvent<DynamicObject>) -> Option<ChangeEvent> {
    let shaped = |o: &DynamicObject| observed(kind, o).map_err(|e| ChangeEvent::Error(e.to_string()));
    Some(match ev {
        WatchEvent::Added(o) => shaped(&o).map(ChangeEvent::Added).unwrap_or_else(|e| e),
        WatchEvent::Modified(o) => shaped(&o).map(ChangeEvent::Modified).unwrap_or_else(|e| e),
        WatchEvent::Deleted(o) => shaped(&o).map(ChangeEvent::Deleted).unwrap_or_else(|e| e),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(err) => ChangeEvent::Error(format!("{} ({}): {}", err.reason, err.code, err.message)),
    })
}

fn delete_params(opts: DeleteOptions) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: opts.grace_period_seconds,
        propagation_policy: opts.propagation.map(|p| match p {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl ResourceGateway for KubeGateway {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<ObservedState>, GatewayError> {
        match self.api(kind, namespace).get_opt(name).await.map_err(map_err)? {
            Some(obj) => Ok(Some(observed(kind, &obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, desired: &DesiredState, opts: CreateOptions) -> Result<ObservedState, GatewayError> {
        let obj: DynamicObject =
            serde_json::from_value(desired.manifest.clone()).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let pp = PostParams { dry_run: opts.dry_run, ..Default::default() };
        let created = self.api(desired.kind, &desired.namespace).create(&pp, &obj).await.map_err(map_err)?;
        observed(desired.kind, &created)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str, opts: DeleteOptions) -> Result<(), GatewayError> {
        self.api(kind, namespace).delete(name, &delete_params(opts)).await.map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Subscription, GatewayError> {
        let api = self.api(kind, namespace);
        let mut wp = WatchParams::default();
        if !selector.is_empty() {
            wp = wp.labels(&selector.to_string());
        }
        let (tx, rx) = mpsc::channel::<ChangeEvent>(self.event_buffer);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), GatewayError>>();
        let (cancel, mut cancel_rx) = CancelHandle::pair();
        let ctx = format!("{}/{} [{}]", kind, namespace, selector);

        // The watch stream borrows its Api, so both live inside the forwarding task.
        tokio::spawn(async move {
            let stream = match api.watch(&wp, "0").await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(map_err(e)));
                    return;
                }
            };
            futures::pin_mut!(stream);
            debug!(ctx = %ctx, "watch established");
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => { debug!(ctx = %ctx, "watch cancelled"); break; }
                    next = stream.next() => match next {
                        Some(Ok(ev)) => {
                            if let Some(ev) = change_event(kind, ev) {
                                if tx.send(ev).await.is_err() { break; }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(ctx = %ctx, error = %e, "watch stream error");
                            let _ = tx.send(ChangeEvent::Error(e.to_string())).await;
                            break;
                        }
                        None => { debug!(ctx = %ctx, "watch stream ended"); break; }
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Subscription { events: rx, cancel }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::Closed),
        }
    }

    async fn list(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> Result<Vec<ObservedState>, GatewayError> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let list = self.api(kind, namespace).list(&lp).await.map_err(map_err)?;
        list.items.iter().map(|o| observed(kind, o)).collect()
    }
}
