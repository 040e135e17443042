use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use rand::prelude::*;
use tokio::sync::watch;

use crate::{
    client::session::ClientSession,
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::{ServerDescription, TopologyDescription},
        server::{SelectedServer, Server},
        SessionSupportStatus,
    },
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The full state of the deployment at one point in time: the description plus
/// the live server handles. Published over a watch channel so that selection
/// can wait for updates without polling.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// Tracks the state of the deployment. The monitoring layer lives outside
/// this crate and feeds observations in through [`Topology::update_server`];
/// everything else only reads.
#[derive(Debug)]
pub(crate) struct Topology {
    sender: watch::Sender<Arc<TopologyState>>,
    receiver: watch::Receiver<Arc<TopologyState>>,
    server_selection_timeout: Duration,
    options: ClientOptions,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let description = TopologyDescription::new(options.hosts.iter().cloned());
        let servers = options
            .hosts
            .iter()
            .map(|address| (address.clone(), Server::new(address.clone(), &options)))
            .collect();
        let (sender, receiver) = watch::channel(Arc::new(TopologyState {
            description,
            servers,
        }));
        Ok(Self {
            sender,
            receiver,
            server_selection_timeout: options
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            options,
        })
    }

    pub(crate) fn state(&self) -> Arc<TopologyState> {
        self.receiver.borrow().clone()
    }

    /// Incorporates a fresh observation of a server. This is the entry point
    /// the monitoring layer drives; it also manages the server's pool
    /// lifecycle, readying it when the server is reachable and pausing it
    /// when it becomes unknown.
    pub(crate) fn update_server(&self, description: ServerDescription) {
        tracing::debug!(
            address = %description.address,
            server_type = ?description.server_type,
            "updating topology"
        );
        self.sender.send_modify(|state| {
            let state = Arc::make_mut(state);
            let address = description.address.clone();
            let server = state
                .servers
                .entry(address.clone())
                .or_insert_with(|| Server::new(address, &self.options));
            if description.server_type.is_available() {
                server.pool.mark_ready();
            } else {
                server.pool.clear();
            }
            state.description.update(description);
        });
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.state().description.session_support_status()
    }

    pub(crate) fn has_session_support(&self) -> bool {
        matches!(
            self.session_support_status(),
            SessionSupportStatus::Supported { .. }
        )
    }

    /// Whether session support cannot be decided yet and a server must be
    /// selected first to find out.
    pub(crate) fn should_check_for_session_support(&self) -> bool {
        self.session_support_status() == SessionSupportStatus::Undetermined
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        match self.session_support_status() {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => Some(logical_session_timeout),
            _ => None,
        }
    }

    pub(crate) fn common_wire_version(&self) -> Option<i32> {
        self.state().description.common_wire_version()
    }

    /// Closes every server's connection pool.
    pub(crate) fn shutdown(&self) {
        for server in self.state().servers.values() {
            server.pool.close();
        }
    }

    /// Selects a server matching `criteria`, waiting for topology updates
    /// until one is suitable or the selection timeout elapses.
    ///
    /// A session pinned by an active transaction short-circuits to its pinned
    /// server; predicate criteria (same-server continuations) deliberately
    /// skip that shortcut and go through full selection so the target's
    /// monitor state is re-validated.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        session: Option<&ClientSession>,
    ) -> Result<SelectedServer> {
        if !matches!(criteria, SelectionCriteria::Predicate(_)) {
            if let Some(session) = session {
                if session.in_transaction() {
                    if let Some(address) = session.pinned_address() {
                        let state = self.state();
                        if let (Some(server), Some(description)) = (
                            state.servers.get(&address),
                            state.description.servers.get(&address),
                        ) {
                            return Ok(SelectedServer::new(server.clone(), description.clone()));
                        }
                    }
                }
            }
        }

        let start = Instant::now();
        let mut receiver = self.receiver.clone();
        loop {
            let state = receiver.borrow_and_update().clone();
            let suitable = state.description.suitable_servers(criteria);
            if let Some(description) = suitable.choose(&mut rand::rng()) {
                if let Some(server) = state.servers.get(&description.address) {
                    tracing::debug!(address = %description.address, %criteria, "selected server");
                    return Ok(SelectedServer::new(server.clone(), (*description).clone()));
                }
            }

            let Some(remaining) = self.server_selection_timeout.checked_sub(start.elapsed())
            else {
                return Err(self.selection_timeout_error(criteria));
            };
            match tokio::time::timeout(remaining, receiver.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::internal("topology update channel closed"));
                }
                Err(_) => return Err(self.selection_timeout_error(criteria)),
            }
        }
    }

    fn selection_timeout_error(&self, criteria: &SelectionCriteria) -> Error {
        ErrorKind::ServerSelection {
            message: format!(
                "timed out while trying to select a server with criteria {}; topology: {:?}",
                criteria,
                self.state().description,
            ),
        }
        .into()
    }
}
