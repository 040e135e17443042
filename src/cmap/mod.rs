//! A skeleton of the connection pool: generation tracking, the
//! ready/paused/closed lifecycle, and the idle-connection list. Connection
//! *establishment* lives outside this crate; the pool manages connections
//! that were established elsewhere and checked in.

pub(crate) mod conn;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
    Mutex,
};

pub(crate) use conn::Connection;

use crate::{
    linked_list::LinkedList,
    options::{ClientOptions, ServerAddress},
    state_transitions::StateTransitions,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// The lifecycle state of a connection pool. New pools start out paused and
/// are marked ready once their server is confirmed reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PoolState {
    Ready,
    Paused,
    Closed,
}

fn pool_transitions() -> StateTransitions<PoolState> {
    StateTransitions::new([
        (PoolState::Paused, vec![PoolState::Ready, PoolState::Closed]),
        (PoolState::Ready, vec![PoolState::Paused, PoolState::Closed]),
        (PoolState::Closed, vec![]),
    ])
}

/// A pool of established connections for a single server. Cheap to clone and
/// safe to share across concurrently executing operations.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    address: ServerAddress,
    max_size: u32,
    generation: AtomicU32,
    transitions: StateTransitions<PoolState>,
    locked: Mutex<PoolLocked>,
}

#[derive(Debug)]
struct PoolLocked {
    state: PoolState,
    available: LinkedList<Connection>,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: &ClientOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                address,
                max_size: options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE),
                generation: AtomicU32::new(0),
                transitions: pool_transitions(),
                locked: Mutex::new(PoolLocked {
                    state: PoolState::Paused,
                    available: LinkedList::new(),
                }),
            }),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> PoolState {
        self.lock().state
    }

    /// Checks out the most recently used idle connection, skipping any that
    /// belong to a previous generation. Returns `None` when the pool is not
    /// ready or empty.
    pub(crate) fn check_out(&self) -> Option<Connection> {
        let generation = self.generation();
        let mut locked = self.lock();
        if locked.state != PoolState::Ready {
            return None;
        }
        locked.available.prune(|conn| conn.generation != generation);
        locked.available.pop()
    }

    /// Returns a connection to the idle list. Stale connections and check-ins
    /// on a non-ready or full pool are discarded.
    pub(crate) fn check_in(&self, connection: Connection) {
        let generation = self.generation();
        let mut locked = self.lock();
        if locked.state != PoolState::Ready
            || connection.generation != generation
            || locked.available.len() >= self.inner.max_size as usize
        {
            return;
        }
        locked.available.push(connection);
    }

    /// Clears the pool in response to an error: advances the generation so
    /// outstanding connections are recognized as stale, drops the idle list,
    /// and pauses the pool until the server is confirmed healthy again.
    pub(crate) fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut locked = self.lock();
        locked.available.clear();
        if locked.state == PoolState::Ready {
            if let Ok(change) = self
                .inner
                .transitions
                .transition(&mut locked.state, PoolState::Paused)
            {
                tracing::debug!(
                    address = %self.inner.address,
                    from = ?change.from,
                    to = ?change.to,
                    "connection pool cleared"
                );
            }
        }
    }

    /// Marks the pool ready for check-outs. A no-op if it already is.
    pub(crate) fn mark_ready(&self) {
        let mut locked = self.lock();
        if locked.state != PoolState::Paused {
            return;
        }
        if let Ok(change) = self
            .inner
            .transitions
            .transition(&mut locked.state, PoolState::Ready)
        {
            tracing::debug!(
                address = %self.inner.address,
                from = ?change.from,
                to = ?change.to,
                "connection pool ready"
            );
        }
    }

    /// Permanently closes the pool, dropping all idle connections. Any state
    /// may transition to closed.
    pub(crate) fn close(&self) {
        let mut locked = self.lock();
        locked.available.clear();
        if locked.state != PoolState::Closed {
            let _ = self
                .inner
                .transitions
                .transition(&mut locked.state, PoolState::Closed);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolLocked> {
        match self.inner.locked.lock() {
            Ok(guard) => guard,
            // The pool's invariants hold even if a holder panicked; the data
            // is a plain list plus a state tag.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmap::conn::tests_support::sink_connection;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            ServerAddress::default(),
            &ClientOptions::builder().max_pool_size(2_u32).build(),
        )
    }

    #[tokio::test]
    async fn check_out_respects_pause_state() {
        let pool = pool();
        assert_eq!(pool.state(), PoolState::Paused);
        assert!(pool.check_out().is_none());

        pool.mark_ready();
        pool.check_in(sink_connection(1, pool.generation()));
        assert!(pool.check_out().is_some());
    }

    #[tokio::test]
    async fn clear_bumps_generation_and_prunes_stale_connections() {
        let pool = pool();
        pool.mark_ready();
        let old_generation = pool.generation();
        pool.check_in(sink_connection(1, old_generation));

        pool.clear();
        assert_eq!(pool.state(), PoolState::Paused);
        assert_eq!(pool.generation(), old_generation + 1);
        assert!(pool.check_out().is_none());

        pool.mark_ready();
        // A connection from the old generation is discarded on check-in.
        pool.check_in(sink_connection(2, old_generation));
        assert!(pool.check_out().is_none());
    }

    #[tokio::test]
    async fn full_pool_discards_check_ins() {
        let pool = pool();
        pool.mark_ready();
        for id in 0..3 {
            pool.check_in(sink_connection(id, pool.generation()));
        }
        assert!(pool.check_out().is_some());
        assert!(pool.check_out().is_some());
        assert!(pool.check_out().is_none());
    }

    #[tokio::test]
    async fn closed_pool_stays_closed() {
        let pool = pool();
        pool.close();
        pool.mark_ready();
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(pool.check_out().is_none());
    }
}
