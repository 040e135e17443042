pub(crate) mod csfle;
mod executor;
pub mod session;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        RwLock,
    },
    time::Duration,
};

use uuid::Uuid;

use self::{
    csfle::AutoEncrypter,
    session::{ClientSession, ServerSession, ServerSessionPool},
};
use crate::{
    error::{Error, Result},
    operation::Ping,
    options::{ClientOptions, SessionOptions},
    sdam::Topology,
};

/// This is the main entry point for the API. A `Client` is used to connect to
/// a FerroDB deployment.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared
/// across threads or async tasks.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    options: ClientOptions,
    topology: RwLock<Option<Arc<Topology>>>,
    session_pool: ServerSessionPool,
    warnings: WarningDeduplicator,
    csfle: Option<AutoEncrypter>,
    /// Set while an operation is connecting on its own behalf, to skip the
    /// health ping an explicit connect performs.
    suppress_connect_ping: AtomicBool,
}

impl Client {
    /// Creates a new `Client` connected to the deployment specified by
    /// `options`. The client does not reach out to the deployment until it is
    /// first used.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let csfle = options
            .auto_encryption_opts
            .clone()
            .map(AutoEncrypter::new)
            .transpose()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                topology: RwLock::new(None),
                session_pool: ServerSessionPool::new(),
                warnings: WarningDeduplicator::default(),
                csfle,
                suppress_connect_ping: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn warnings(&self) -> &WarningDeduplicator {
        &self.inner.warnings
    }

    #[allow(dead_code)]
    pub(crate) fn auto_encrypter(&self) -> Option<&AutoEncrypter> {
        self.inner.csfle.as_ref()
    }

    pub(crate) fn is_connected(&self) -> bool {
        read_lock(&self.inner.topology).is_some()
    }

    pub(crate) fn topology(&self) -> Result<Arc<Topology>> {
        read_lock(&self.inner.topology)
            .clone()
            .ok_or_else(|| Error::internal("operation executed before the client connected"))
    }

    /// Connects to the deployment: initializes the topology from the seed
    /// list, spawns the encryption helper if needed, and verifies that a
    /// server can be selected. The verification ping is skipped when the
    /// pipeline is connecting on an operation's behalf.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut topology = write_lock(&self.inner.topology);
            if topology.is_none() {
                *topology = Some(Arc::new(Topology::new(self.inner.options.clone())?));
            }
        }

        if let Some(ref encrypter) = self.inner.csfle {
            if let Err(spawn_error) = encrypter.spawn_helper_if_needed() {
                self.inner.warnings.warn_once(
                    "crypt-helper-spawn",
                    format_args!("failed to spawn the encryption helper: {}", spawn_error),
                );
            }
        }

        if !self.inner.suppress_connect_ping.load(Ordering::SeqCst) {
            let mut ping = Ping::new();
            self.execute_operation(&mut ping, None).await?;
        }
        Ok(())
    }

    /// Shuts this client down, closing every server's connection pool.
    pub async fn shutdown(self) {
        if let Some(topology) = read_lock(&self.inner.topology).clone() {
            topology.shutdown();
        }
    }

    pub(crate) fn suppress_connect_ping(&self) -> PingSuppressionGuard<'_> {
        self.inner
            .suppress_connect_ping
            .store(true, Ordering::SeqCst);
        PingSuppressionGuard(&self.inner.suppress_connect_ping)
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        Ok(self.start_session_inner(options.into(), false, None).await)
    }

    /// Starts the implicit session for one pipeline run, tagged with the
    /// run's ownership token.
    pub(crate) async fn start_implicit_session(&self, owner: Uuid) -> ClientSession {
        self.start_session_inner(None, true, Some(owner)).await
    }

    async fn start_session_inner(
        &self,
        options: Option<SessionOptions>,
        is_implicit: bool,
        owner: Option<Uuid>,
    ) -> ClientSession {
        let server_session = self
            .inner
            .session_pool
            .check_out(self.logical_session_timeout())
            .await;
        ClientSession::new(server_session, self.clone(), options, is_implicit, owner)
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        self.inner
            .session_pool
            .check_in(session, self.logical_session_timeout())
            .await;
    }

    fn logical_session_timeout(&self) -> Option<Duration> {
        read_lock(&self.inner.topology)
            .as_ref()
            .and_then(|topology| topology.logical_session_timeout())
    }

    #[cfg(test)]
    pub(crate) fn session_pool(&self) -> &ServerSessionPool {
        &self.inner.session_pool
    }
}

/// Clears the ping-suppression flag on every exit path, including failed and
/// cancelled connect attempts.
pub(crate) struct PingSuppressionGuard<'a>(&'a AtomicBool);

impl Drop for PingSuppressionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Emits each distinct warning once per client. Owned by the client rather
/// than living in process-global state so tests can observe it in isolation.
#[derive(Debug, Default)]
pub(crate) struct WarningDeduplicator {
    seen: Mutex<HashSet<String>>,
}

impl WarningDeduplicator {
    /// Logs `message` the first time `key` is seen; later calls with the same
    /// key are dropped. Returns whether the warning was emitted.
    pub(crate) fn warn_once(&self, key: &str, message: impl std::fmt::Display) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if seen.insert(key.to_string()) {
            tracing::warn!(key, "{}", message);
            true
        } else {
            false
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
