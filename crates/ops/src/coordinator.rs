//! Recreate-update coordinator.
//!
//! Fields the control plane treats as immutable after creation (a pod's containers, a
//! job's template) cannot be patched, so an update becomes: validate with a dry-run,
//! subscribe, delete, wait until the deletion is observed, sweep orphaned dependents,
//! create again. Every run ends in exactly one terminal outcome.

use std::sync::Arc;
use std::time::Duration;

use kctl_core::{
    Completion, CompletionMode, CreateOptions, DeleteOptions, DeleteOutcome, DesiredState, ObservedState, Propagation,
    RecreateConfig, ResourceDescriptor, ResourceGateway, SweepResult, UpdateError, UpdateOutcome,
};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::locks::{NameGuard, NameLocks};
use crate::sweep::Sweeper;
use crate::watch::{recheck_absent, Confirmation, DeletionWatch, WaitResult};

/// Result of the shared delete-and-await phase.
enum Removal {
    Confirmed { how: Confirmation, sweep: Option<SweepResult> },
    TimedOut(Duration),
    Failed(UpdateError),
}

#[derive(Clone)]
pub struct Coordinator {
    gateway: Arc<dyn ResourceGateway>,
    sweeper: Sweeper,
    locks: NameLocks,
    config: RecreateConfig,
}

impl Coordinator {
    pub fn new(gateway: Arc<dyn ResourceGateway>, config: RecreateConfig) -> Self {
        let sweeper = Sweeper::new(gateway.clone(), config.sweep_grace_seconds);
        Self { gateway, sweeper, locks: NameLocks::new(), config }
    }

    pub fn config(&self) -> &RecreateConfig { &self.config }

    pub fn gateway(&self) -> &Arc<dyn ResourceGateway> { &self.gateway }

    async fn lock(&self, descriptor: &ResourceDescriptor) -> Option<NameGuard> {
        if self.config.serialize_updates {
            Some(self.locks.acquire(&descriptor.key()).await)
        } else {
            None
        }
    }

    /// Non-persisting dry-run create of `desired` under a decorated name.
    pub async fn validate(&self, desired: &DesiredState) -> Result<ObservedState, UpdateError> {
        let probe = desired.renamed(&self.config.validate_suffix);
        self.gateway.create(&probe, CreateOptions::dry_run()).await.map_err(UpdateError::Validation)
    }

    /// Make the cluster object named by `descriptor` match `desired`, recreating it if it exists.
    /// `timeout` bounds only the wait for the deletion to be observed.
    pub async fn update_resource(&self, descriptor: &ResourceDescriptor, desired: DesiredState, timeout: Duration) -> UpdateOutcome {
        let t0 = Instant::now();
        counter!("recreate_attempts", 1u64);
        let _guard = self.lock(descriptor).await;
        info!(kind = %descriptor.kind, ns = %descriptor.namespace, name = %descriptor.name, timeout_ms = timeout.as_millis() as u64, "recreate: start");

        let outcome = self.run_update(descriptor, desired, timeout).await;

        let took_ms = t0.elapsed().as_millis() as u64;
        histogram!("recreate_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &outcome {
            UpdateOutcome::Completed(c) => {
                counter!("recreate_completed", 1u64);
                info!(key = %descriptor.key(), mode = ?c.mode, took_ms, "recreate: completed");
            }
            UpdateOutcome::TimedOut { waited } => {
                counter!("recreate_timed_out", 1u64);
                warn!(key = %descriptor.key(), waited_ms = waited.as_millis() as u64, took_ms, "recreate: deletion not observed in time");
            }
            UpdateOutcome::Failed(e) => {
                counter!("recreate_failed", 1u64);
                warn!(key = %descriptor.key(), error = %e, object = ?e.object_state(), took_ms, "recreate: failed");
            }
        }
        outcome
    }

    async fn run_update(&self, descriptor: &ResourceDescriptor, desired: DesiredState, timeout: Duration) -> UpdateOutcome {
        if let Err(e) = descriptor.check(&desired) {
            return UpdateOutcome::Failed(e);
        }

        let observed = match self.gateway.get(descriptor.kind, &descriptor.namespace, &descriptor.name).await {
            Ok(o) => o,
            Err(e) => return UpdateOutcome::Failed(UpdateError::Inspect(e)),
        };
        let Some(observed) = observed else {
            debug!(key = %descriptor.key(), "recreate: object absent, plain create");
            return match self.gateway.create(&desired, CreateOptions::default()).await {
                Ok(object) => UpdateOutcome::Completed(Completion { mode: CompletionMode::Created, object, sweep: None }),
                Err(e) => UpdateOutcome::Failed(UpdateError::Create(e)),
            };
        };

        if let Err(e) = self.validate(&desired).await {
            return UpdateOutcome::Failed(e);
        }

        let sweep = match self.remove_and_await(descriptor, &observed, timeout).await {
            Removal::Confirmed { how, sweep } => {
                debug!(key = %descriptor.key(), how = ?how, "recreate: deletion confirmed");
                sweep
            }
            Removal::TimedOut(waited) => return UpdateOutcome::TimedOut { waited },
            Removal::Failed(e) => return UpdateOutcome::Failed(e),
        };

        match self.gateway.create(&desired, CreateOptions::default()).await {
            Ok(object) => UpdateOutcome::Completed(Completion { mode: CompletionMode::Recreated, object, sweep }),
            Err(e) => {
                error!(key = %descriptor.key(), error = %e, "recreate: object deleted but not recreated");
                UpdateOutcome::Failed(UpdateError::Recreate(e))
            }
        }
    }

    /// Delete the object and wait until the deletion is observed, sweeping dependents afterwards.
    pub async fn delete_resource(&self, descriptor: &ResourceDescriptor, timeout: Duration) -> DeleteOutcome {
        counter!("delete_attempts", 1u64);
        let _guard = self.lock(descriptor).await;
        info!(kind = %descriptor.kind, ns = %descriptor.namespace, name = %descriptor.name, "delete: start");
        let observed = match self.gateway.get(descriptor.kind, &descriptor.namespace, &descriptor.name).await {
            Ok(Some(o)) => o,
            Ok(None) => return DeleteOutcome::NotFound,
            Err(e) => return DeleteOutcome::Failed(UpdateError::Inspect(e)),
        };
        match self.remove_and_await(descriptor, &observed, timeout).await {
            Removal::Confirmed { sweep, .. } => DeleteOutcome::Deleted { sweep },
            Removal::TimedOut(waited) => {
                warn!(key = %descriptor.key(), waited_ms = waited.as_millis() as u64, "delete: deletion not observed in time");
                DeleteOutcome::TimedOut { waited }
            }
            Removal::Failed(e) => DeleteOutcome::Failed(e),
        }
    }

    async fn remove_and_await(&self, descriptor: &ResourceDescriptor, observed: &ObservedState, timeout: Duration) -> Removal {
        let kind = descriptor.kind;
        let ns = descriptor.namespace.as_str();
        // Captured from the live object: the replacement may carry a different template.
        let children = kind.child_kind().zip(kind.child_selector(observed));

        // Subscribe before deleting, scoped to the live labels (the desired ones may differ).
        let subscription = match self.gateway.subscribe(kind, ns, &observed.selector()).await {
            Ok(s) => s,
            Err(e) => return Removal::Failed(UpdateError::Subscribe(e)),
        };
        let watch = DeletionWatch::spawn(self.gateway.clone(), descriptor.clone(), subscription);
        let deadline = Instant::now() + timeout;

        let opts = DeleteOptions {
            propagation: children.as_ref().map(|_| Propagation::Background),
            ..Default::default()
        };
        match self.gateway.delete(kind, ns, &descriptor.name, opts).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(key = %descriptor.key(), "recreate: already gone at delete"),
            Err(e) => return Removal::Failed(UpdateError::Delete(e)),
        }

        // A fast deletion can complete before the watch reports anything.
        let how = match recheck_absent(self.gateway.as_ref(), descriptor).await {
            Ok(true) => {
                drop(watch);
                Confirmation::Recheck
            }
            other => {
                if let Err(e) = other {
                    debug!(key = %descriptor.key(), error = %e, "recreate: fast-path recheck failed");
                }
                match watch.wait(deadline.saturating_duration_since(Instant::now())).await {
                    WaitResult::Deleted(how) => how,
                    WaitResult::TimedOut(_) => return Removal::TimedOut(timeout),
                    WaitResult::Failed(msg) => return Removal::Failed(UpdateError::Subscription(msg)),
                }
            }
        };

        let sweep = match children {
            Some((child, selector)) => Some(self.sweeper.sweep(child, &selector, ns).await),
            None => None,
        };
        Removal::Confirmed { how, sweep }
    }
}
