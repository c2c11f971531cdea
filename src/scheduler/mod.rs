//! Reconciliation scheduling
//!
//! The [`InventoryWatcher`] discovers clusters due for reconciliation and feeds them
//! through a bounded queue into the [`Dispatcher`], which tracks the dispatched
//! component work in the [`OperationsRegistry`].

mod dispatcher;
mod inventory_watch;
mod invoker;
mod operations;

#[cfg(test)]
mod dispatcher_test;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use inventory_watch::{
    InventoryWatchConfig, InventoryWatcher, DEFAULT_CLUSTER_RECONCILE_INTERVAL,
    DEFAULT_WATCH_INTERVAL,
};
pub use invoker::{ComponentInvoker, ReconcilerEndpoint, ReconcilersConfig, RemoteInvoker};
pub use operations::{
    MemoryOperationsRegistry, Operation, OperationState, OperationsRegistry, DEFAULT_ERROR_REASON,
};
