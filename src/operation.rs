use bitflags::bitflags;
use bson::{doc, Document};
use futures_util::future::BoxFuture;

use crate::{
    client::session::ClientSession,
    cmap::conn::Command,
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::SelectedServer,
    selection_criteria::ReadPreference,
};

bitflags! {
    /// Capability tags describing the behavior of an operation. The execution
    /// pipeline consults these to decide on session handling, server
    /// selection, and retry policy; it never inspects the operation itself.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Aspect: u8 {
        /// The operation may be re-attempted once on a retryable failure.
        const RETRYABLE = 1 << 0;

        /// The operation reads data.
        const READ_OPERATION = 1 << 1;

        /// The operation writes data.
        const WRITE_OPERATION = 1 << 2;

        /// The operation creates a server-side cursor.
        const CURSOR_CREATING = 1 << 3;

        /// The operation is a continuation that must run on the same server
        /// as the operation that started it.
        const MUST_SELECT_SAME_SERVER = 1 << 4;
    }
}

/// The level of retryability an operation supports.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// The mutable option bag carried by every operation descriptor. The
/// capability set is fixed at construction; these options may be adjusted by
/// the pipeline during the single run that consumes the descriptor.
#[derive(Clone, Debug, Default)]
pub(crate) struct OperationOptions {
    /// The read preference explicitly requested for this operation, if any.
    pub(crate) read_preference: Option<ReadPreference>,

    /// Set by the pipeline before the first attempt of a write that is
    /// eligible for a retry, so the command carries the retry marker.
    pub(crate) will_retry_write: bool,

    /// Skip the committed-transaction unpin check during session binding.
    pub(crate) bypass_pinning_check: bool,
}

/// A trait modeling the behavior of a server side operation.
pub(crate) trait Operation: Send {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// The capability set of this operation.
    fn aspects(&self) -> Aspect;

    /// The operation's mutable option bag.
    fn options(&self) -> &OperationOptions;

    fn options_mut(&mut self) -> &mut OperationOptions;

    /// Runs the operation against the selected server, using the provided
    /// session if one is bound.
    fn execute<'a>(
        &'a mut self,
        server: &'a SelectedServer,
        session: Option<&'a mut ClientSession>,
    ) -> BoxFuture<'a, Result<Self::O>>;

    /// Whether a failed attempt of this operation may be retried as a read.
    fn can_retry_read(&self) -> bool {
        true
    }

    /// Whether a failed attempt of this operation may be retried as a write.
    fn can_retry_write(&self) -> bool {
        true
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The address of the server a continuation operation is bound to.
    fn server_address(&self) -> Option<&ServerAddress> {
        None
    }

    /// Whether this operation opts into being written to a secondary.
    fn try_secondary_write(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn has_aspect(&self, aspect: Aspect) -> bool {
        self.aspects().contains(aspect)
    }

    /// The retry category this operation falls into, derived from its
    /// capability set.
    fn retryability(&self) -> Retryability {
        if !self.has_aspect(Aspect::RETRYABLE) {
            Retryability::None
        } else if self.has_aspect(Aspect::WRITE_OPERATION) {
            Retryability::Write
        } else if self.has_aspect(Aspect::READ_OPERATION) {
            Retryability::Read
        } else {
            Retryability::None
        }
    }
}

/// The health-check command an explicit connect runs against the deployment.
#[derive(Debug, Default)]
pub(crate) struct Ping {
    options: OperationOptions,
}

impl Ping {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Operation for Ping {
    type O = Document;
    const NAME: &'static str = "ping";

    fn aspects(&self) -> Aspect {
        Aspect::RETRYABLE | Aspect::READ_OPERATION
    }

    fn options(&self) -> &OperationOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut OperationOptions {
        &mut self.options
    }

    fn execute<'a>(
        &'a mut self,
        server: &'a SelectedServer,
        _session: Option<&'a mut ClientSession>,
    ) -> BoxFuture<'a, Result<Self::O>> {
        Box::pin(async move {
            let Some(mut connection) = server.pool().check_out() else {
                return Err(ErrorKind::from(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("no established connections available for {}", server.address()),
                ))
                .into());
            };
            let command = Command::new(Self::NAME, "admin", doc! { "ping": 1 });
            let response = connection.send_command(command, None).await;
            server.pool().check_in(connection);
            response
        })
    }
}
