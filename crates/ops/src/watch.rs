//! Deletion watch: a listener task that reduces a change-event subscription to one verdict,
//! handed back to the orchestrating task through a oneshot and awaited under a deadline.

use std::sync::Arc;
use std::time::Duration;

use kctl_core::{ChangeEvent, GatewayError, ResourceDescriptor, ResourceGateway, Subscription};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// How a deletion was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// A `Deleted` event for the target arrived.
    Event,
    /// A direct existence check reported not-found.
    Recheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Deleted(Confirmation),
    TimedOut(Duration),
    Failed(String),
}

enum Verdict {
    Deleted(Confirmation),
    Failed(String),
}

/// Direct existence check. `Ok(true)` when the target is already gone.
pub async fn recheck_absent(gateway: &dyn ResourceGateway, target: &ResourceDescriptor) -> Result<bool, GatewayError> {
    Ok(gateway.get(target.kind, &target.namespace, &target.name).await?.is_none())
}

/// Owns the listener task. Dropping the watch aborts the task, which closes the subscription.
pub struct DeletionWatch {
    verdict: oneshot::Receiver<Verdict>,
    task: JoinHandle<()>,
}

impl DeletionWatch {
    /// Start consuming `subscription` in the background. The subscription must already be
    /// established, so a delete issued after this call cannot slip past it.
    pub fn spawn(gateway: Arc<dyn ResourceGateway>, target: ResourceDescriptor, subscription: Subscription) -> Self {
        let (tx, verdict) = oneshot::channel();
        let task = tokio::spawn(listen(gateway, target, subscription, tx));
        Self { verdict, task }
    }

    /// Wait at most `bound` for the listener's verdict, then tear the listener down.
    pub async fn wait(mut self, bound: Duration) -> WaitResult {
        match tokio::time::timeout(bound, &mut self.verdict).await {
            Ok(Ok(Verdict::Deleted(how))) => WaitResult::Deleted(how),
            Ok(Ok(Verdict::Failed(msg))) => WaitResult::Failed(msg),
            Ok(Err(_)) => WaitResult::Failed("listener exited without a verdict".into()),
            Err(_) => WaitResult::TimedOut(bound),
        }
    }
}

impl Drop for DeletionWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn listen(
    gateway: Arc<dyn ResourceGateway>,
    target: ResourceDescriptor,
    mut subscription: Subscription,
    tx: oneshot::Sender<Verdict>,
) {
    let verdict = loop {
        match subscription.events.recv().await {
            Some(ChangeEvent::Deleted(obj)) => {
                if target.identifies(&obj) {
                    break Verdict::Deleted(Confirmation::Event);
                }
                debug!(target = %target.key(), other = %obj.name, "watch: sibling deleted");
            }
            Some(ChangeEvent::Error(msg)) => break Verdict::Failed(msg),
            Some(ev) => {
                // Unrelated traffic on the selector can hide a deletion the watch never reports.
                match recheck_absent(gateway.as_ref(), &target).await {
                    Ok(true) => break Verdict::Deleted(Confirmation::Recheck),
                    Ok(false) => debug!(target = %target.key(), event = ?ev.kind(), "watch: still present"),
                    Err(e) => debug!(target = %target.key(), error = %e, "watch: recheck failed"),
                }
            }
            None => break Verdict::Failed("subscription closed before deletion was observed".into()),
        }
    };
    let _ = tx.send(verdict);
}
