//! Dependent resource sweeper: removes children a parent spawned from its pod template.

use std::sync::Arc;

use futures::future::join_all;
use kctl_core::{DeleteOptions, LabelSelector, ResourceGateway, ResourceKind, SweepError, SweepResult};
use metrics::counter;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Sweeper {
    gateway: Arc<dyn ResourceGateway>,
    grace_seconds: u32,
}

impl Sweeper {
    pub fn new(gateway: Arc<dyn ResourceGateway>, grace_seconds: u32) -> Self {
        Self { gateway, grace_seconds }
    }

    /// Best-effort delete of every `child` in `namespace` matching `selector`.
    /// Failures are collected into the result; nothing here is fatal to the caller.
    pub async fn sweep(&self, child: ResourceKind, selector: &LabelSelector, namespace: &str) -> SweepResult {
        if selector.is_empty() {
            // Would match every object of the kind in the namespace.
            warn!(kind = %child, ns = %namespace, "sweep: refusing empty selector");
            return SweepResult::default();
        }
        let items = match self.gateway.list(child, namespace, selector).await {
            Ok(items) => items,
            Err(e) => {
                warn!(kind = %child, ns = %namespace, selector = %selector, error = %e, "sweep: list failed");
                counter!("sweep_errors", 1u64);
                return SweepResult {
                    matched: 0,
                    deleted: 0,
                    errors: vec![SweepError { namespace: namespace.to_string(), name: format!("[{}]", selector), source: e }],
                };
            }
        };

        let opts = DeleteOptions::immediate(self.grace_seconds);
        let results = join_all(items.iter().map(|o| async move {
            let res = self.gateway.delete(child, &o.namespace, &o.name, opts).await;
            (o, res)
        }))
        .await;

        let mut out = SweepResult { matched: items.len(), ..Default::default() };
        for (o, res) in results {
            match res {
                Ok(()) => out.deleted += 1,
                // Already gone (e.g. garbage-collected by the control plane) counts as swept.
                Err(e) if e.is_not_found() => out.deleted += 1,
                Err(e) => {
                    warn!(kind = %child, ns = %o.namespace, name = %o.name, error = %e, "sweep: delete failed");
                    out.errors.push(SweepError { namespace: o.namespace.clone(), name: o.name.clone(), source: e });
                }
            }
        }
        counter!("sweep_deleted", out.deleted as u64);
        counter!("sweep_errors", out.errors.len() as u64);
        info!(kind = %child, ns = %namespace, selector = %selector, matched = out.matched, deleted = out.deleted, errors = out.errors.len(), "sweep: done");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kctl_core::GatewayError;
    use kctl_kubehub::{GatewayCall, MemoryGateway, Op};
    use serde_json::json;

    fn seed_pod(gw: &MemoryGateway, name: &str, app: &str) {
        gw.seed(ResourceKind::Pod, json!({ "metadata": { "name": name, "namespace": "ns", "labels": { "app": app } } }));
    }

    #[tokio::test]
    async fn deletes_only_matching_children_with_zero_grace() {
        let gw = MemoryGateway::new();
        seed_pod(&gw, "x-1", "x");
        seed_pod(&gw, "x-2", "x");
        seed_pod(&gw, "other", "z");
        let res = Sweeper::new(Arc::new(gw.clone()), 0).sweep(ResourceKind::Pod, &LabelSelector::new().with("app", "x"), "ns").await;
        assert_eq!((res.matched, res.deleted), (2, 2));
        assert!(res.errors.is_empty());
        assert_eq!(gw.objects(ResourceKind::Pod).len(), 1);
        assert!(gw.calls().iter().all(|c| !matches!(c, GatewayCall::Delete { grace_period_seconds, .. } if *grace_period_seconds != Some(0))));
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let gw = MemoryGateway::new();
        seed_pod(&gw, "x-1", "x");
        seed_pod(&gw, "x-2", "x");
        gw.fail_delete_of("x-2", GatewayError::api(403, "Forbidden", "no"));
        let res = Sweeper::new(Arc::new(gw.clone()), 0).sweep(ResourceKind::Pod, &LabelSelector::new().with("app", "x"), "ns").await;
        assert_eq!(res.deleted, 1);
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].name, "x-2");
    }

    #[tokio::test]
    async fn list_failure_and_empty_selector() {
        let gw = MemoryGateway::new();
        seed_pod(&gw, "x-1", "x");
        let sweeper = Sweeper::new(Arc::new(gw.clone()), 0);

        let res = sweeper.sweep(ResourceKind::Pod, &LabelSelector::new(), "ns").await;
        assert_eq!(res.matched, 0);
        assert_eq!(gw.calls().len(), 0);

        gw.fail(Op::List, GatewayError::Transport("down".into()));
        let res = sweeper.sweep(ResourceKind::Pod, &LabelSelector::new().with("app", "x"), "ns").await;
        assert_eq!(res.errors.len(), 1);
        assert_eq!(gw.objects(ResourceKind::Pod).len(), 1);
    }
}
