//! kctl kubehub: resource gateway implementations.
//!
//! `KubeGateway` talks to a real API server through kube-rs; `MemoryGateway` is an
//! in-RAM control plane that records every call, for tests and offline runs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

mod kube_gateway;
pub mod memory;

pub use kube_gateway::KubeGateway;
pub use memory::{DeleteBehavior, GatewayCall, MemoryGateway, Op};

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}
