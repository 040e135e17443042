pub(crate) mod description;
pub mod public;
mod server;
mod server_selection;
mod topology;

use std::time::Duration;

pub(crate) use self::{server::SelectedServer, topology::Topology};

/// Whether the deployment supports sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionSupportStatus {
    /// It is not known yet whether the deployment supports sessions. This is
    /// the state before any data-bearing server has been observed.
    Undetermined,

    /// Every known data-bearing server supports sessions.
    Supported {
        /// The minimum logical session timeout across the deployment.
        logical_session_timeout: Duration,
    },

    /// At least one known data-bearing server does not support sessions.
    Unsupported,
}
