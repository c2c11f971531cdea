//! REST API module for external integrations
//!
//! Serves the cluster inventory endpoints used by the inventory owner and the
//! callback endpoint component reconcilers report operation progress to.

mod dto;
mod handlers;
mod server;


use std::sync::Arc;

use crate::cluster::Inventory;
use crate::scheduler::OperationsRegistry;

pub use dto::{
    CallbackResponse, ClusterResponse, ErrorResponse, HealthResponse, StatusChangeResponse,
    StatusChangesResponse,
};
pub use handlers::DEFAULT_STATUS_CHANGES_OFFSET;
pub use server::{router, run_server, ServerConfig, TlsConfig};

/// State shared by all handlers
pub struct ApiState {
    pub inventory: Arc<dyn Inventory>,
    pub operations: Arc<dyn OperationsRegistry>,
}

impl ApiState {
    pub fn new(inventory: Arc<dyn Inventory>, operations: Arc<dyn OperationsRegistry>) -> Self {
        Self {
            inventory,
            operations,
        }
    }
}
