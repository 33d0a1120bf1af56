//! Outbound signal dispatch port.

use async_trait::async_trait;

use crate::domain::errors::OrchResult;
use crate::domain::models::Signal;

/// Boundary the signal orchestrator calls to deliver a signal to one target.
///
/// Delivery transport (sibling workflows, queues, webhooks) lives outside
/// the core. A per-target failure is reported back as an `Err` and recorded
/// in the signal task's output; it only fails the task when the config says
/// so.
#[async_trait]
pub trait SignalDispatcher: Send + Sync {
    async fn dispatch(&self, target: &str, signal: &Signal) -> OrchResult<()>;
}
