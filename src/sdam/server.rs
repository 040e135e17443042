use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::{
    cmap::ConnectionPool,
    options::{ClientOptions, ServerAddress},
    sdam::description::ServerDescription,
};

/// Contains the state for a given server in the topology.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, options: &ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            pool: ConnectionPool::new(address.clone(), options),
            address,
            operation_count: AtomicU32::new(0),
        })
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}

/// A server selected for an operation, bundling the server handle with the
/// description it was selected under.
#[derive(Clone, Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
    description: ServerDescription,
}

impl SelectedServer {
    pub(crate) fn new(server: Arc<Server>, description: ServerDescription) -> Self {
        Self {
            server,
            description,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    pub(crate) fn description(&self) -> &ServerDescription {
        &self.description
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.server.pool
    }

    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.description.supports_retryable_writes()
    }

    pub(crate) fn increment_operation_count(&self) {
        self.server.increment_operation_count();
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.server.decrement_operation_count();
    }

    #[cfg(test)]
    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }
}
