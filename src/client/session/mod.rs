pub(crate) mod pool;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use uuid::Uuid;

use crate::{
    cmap::ConnectionPool,
    error::{ErrorKind, Result},
    options::{ServerAddress, SessionOptions, TransactionOptions},
    runtime,
    sdam::SelectedServer,
    Client,
};

pub(super) use pool::ServerSessionPool;

/// A FerroDB client session. This struct represents a logical session used
/// for ordering sequential operations. To create a `ClientSession`, call
/// `start_session` on a [`Client`].
///
/// `ClientSession` instances are not thread safe or fork safe. They can only
/// be used by one thread or process at a time.
#[derive(Debug)]
pub struct ClientSession {
    client: Client,
    server_session: ServerSession,
    options: Option<SessionOptions>,
    is_implicit: bool,
    /// The token of the pipeline run that created this session, set only for
    /// implicit sessions. The run that owns a session is the one that ends
    /// it.
    owner: Option<Uuid>,
    has_ended: bool,
    pinned: Option<PinnedServer>,
    pub(crate) transaction: Transaction,
}

/// The server/pool pair a session is pinned to while a transaction or cursor
/// requires all of its operations to reach the same server.
#[derive(Clone, Debug)]
pub(crate) struct PinnedServer {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
    }

    pub(crate) fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was committed when the transaction was committed.
        data_committed: bool,
    },
    Aborted,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            client,
            server_session,
            options,
            is_implicit,
            owner,
            has_ended: false,
            pinned: None,
            transaction: Default::default(),
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// Whether this session was created implicitly by the driver or
    /// explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    pub(crate) fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// The options used to create this session.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Whether this session has been ended. An ended session must never be
    /// used again.
    pub fn has_ended(&self) -> bool {
        self.has_ended
    }

    /// Whether this session is currently in an active transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.state == TransactionState::Starting
            || self.transaction.state == TransactionState::InProgress
    }

    /// Gets the current transaction number.
    pub(crate) fn txn_number(&self) -> u64 {
        self.server_session.txn_number
    }

    /// Increments the transaction number.
    pub(crate) fn increment_txn_number(&mut self) {
        self.server_session.txn_number += 1;
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Updates the date that the underlying server session was last used as
    /// part of an operation sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// Pins this session to the given server.
    pub(crate) fn pin_to(&mut self, server: &SelectedServer) {
        self.pinned = Some(PinnedServer {
            address: server.address().clone(),
            pool: server.pool().clone(),
        });
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    pub(crate) fn pinned_address(&self) -> Option<ServerAddress> {
        self.pinned.as_ref().map(|pinned| pinned.address.clone())
    }

    /// Releases the session's pin. A session in an active transaction may
    /// only be unpinned by the forced network-error recovery path;
    /// `force_clear` additionally clears the pinned server's connection pool
    /// so a retry cannot land on a now-suspect connection.
    pub(crate) fn unpin(&mut self, force: bool, force_clear: bool) -> Result<()> {
        if self.in_transaction() && !force {
            return Err(ErrorKind::Transaction {
                message: "cannot unpin a session while a transaction is in progress".to_string(),
            }
            .into());
        }
        if let Some(pinned) = self.pinned.take() {
            if force_clear {
                pinned.pool.clear();
            }
        }
        Ok(())
    }

    /// Starts a new transaction on this session with the given options. This
    /// session must be passed into each operation within the transaction;
    /// otherwise the operation will be executed outside of it.
    pub fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".to_string(),
                }
                .into());
            }
            _ => {}
        }
        self.increment_txn_number();
        self.transaction.start(options.into());
        Ok(())
    }

    /// Commits the transaction that is currently active on this session. A
    /// transaction on which no operation ever ran commits without any
    /// server-side work to account for.
    pub fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot commit a transaction after aborting it".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress => {
                self.transaction.commit(true);
                Ok(())
            }
            TransactionState::Committed { data_committed } => {
                self.transaction.commit(data_committed);
                Ok(())
            }
        }
    }

    /// Aborts the transaction that is currently active on this session.
    pub fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "cannot abort a transaction after committing it".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot abort a transaction twice".to_string(),
            }
            .into()),
            TransactionState::Starting | TransactionState::InProgress => {
                self.transaction.abort();
                let _ = self.unpin(true, false);
                Ok(())
            }
        }
    }

    /// Ends this session, returning the underlying server session to the
    /// client's pool. A transaction still open on the session is abandoned.
    /// Ending an already-ended session is a no-op.
    pub async fn end(&mut self) -> Result<()> {
        if self.has_ended {
            return Ok(());
        }
        self.has_ended = true;
        if self.in_transaction() {
            self.transaction.abort();
        } else {
            self.transaction.reset();
        }
        let _ = self.unpin(true, false);
        self.client
            .check_in_server_session(self.server_session.clone())
            .await;
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.has_ended {
            return;
        }
        let client = self.client.clone();
        let server_session = self.server_session.clone();
        runtime::spawn_if_runtime_available(async move {
            client.check_in_server_session(server_session).await;
        });
    }
}

/// Client side abstraction of a server session. These are pooled and may be
/// associated with multiple `ClientSession`s over the course of their
/// lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    txn_number: u64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub(crate) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount
    /// of time (1 minute).
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        let expiration_date = self.last_use + logical_session_timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::ClientOptions;

    fn session() -> ClientSession {
        let client = Client::with_options(ClientOptions::default()).unwrap();
        ClientSession::new(ServerSession::new(), client, None, false, None)
    }

    fn pinned_session() -> ClientSession {
        let mut session = session();
        session.pinned = Some(PinnedServer {
            address: ServerAddress::default(),
            pool: ConnectionPool::new(ServerAddress::default(), &ClientOptions::default()),
        });
        session
    }

    #[tokio::test]
    async fn unpin_requires_force_during_an_active_transaction() {
        let mut session = pinned_session();
        session.start_transaction(None).unwrap();
        session.transaction.state = TransactionState::InProgress;

        assert!(session.unpin(false, false).is_err());
        assert!(session.is_pinned());

        session.unpin(true, false).unwrap();
        assert!(!session.is_pinned());
    }

    #[tokio::test]
    async fn ending_a_session_abandons_its_open_transaction() {
        let mut session = session();
        session.start_transaction(None).unwrap();
        assert!(session.in_transaction());

        session.end().await.unwrap();
        assert!(session.has_ended());
        assert_eq!(session.transaction.state, TransactionState::Aborted);
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn transaction_state_transitions_are_guarded() {
        let mut session = session();
        assert!(session.commit_transaction().is_err());
        assert!(session.abort_transaction().is_err());

        session.start_transaction(None).unwrap();
        assert_eq!(session.txn_number(), 1);
        assert!(session.start_transaction(None).is_err());

        session.commit_transaction().unwrap();
        assert!(!session.in_transaction());
        assert_eq!(
            session.transaction.state,
            TransactionState::Committed {
                data_committed: false
            }
        );
        // Committing again is a no-op, aborting afterwards is an error.
        session.commit_transaction().unwrap();
        assert!(session.abort_transaction().is_err());
    }

    #[tokio::test]
    async fn aborting_a_starting_transaction_releases_the_pin() {
        let mut session = pinned_session();
        session.start_transaction(None).unwrap();
        session.abort_transaction().unwrap();
        assert!(!session.is_pinned());
        assert!(!session.in_transaction());
        assert!(session.abort_transaction().is_err());
    }
}
