use std::time::Duration;

use tokio::sync::Mutex;

use super::ServerSession;
use crate::linked_list::LinkedList;

/// The client-owned pool of reusable server sessions. Most recently used
/// sessions sit at the head so they are reused before they can expire.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<LinkedList<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self {
            pool: Mutex::new(LinkedList::new()),
        }
    }

    /// Checks out a server session from the pool, pruning any sessions that
    /// are about to expire. If none are left afterwards, a fresh session is
    /// created.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        if let Some(timeout) = logical_session_timeout {
            pool.prune(|session| session.is_about_to_expire(timeout));
        }
        pool.shift().unwrap_or_else(ServerSession::new)
    }

    /// Checks a server session back into the pool unless it is dirty or about
    /// to expire, pruning expired sessions while at it.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        if let Some(timeout) = logical_session_timeout {
            pool.prune(|session| session.is_about_to_expire(timeout));
            if session.is_about_to_expire(timeout) {
                return;
            }
        }
        if session.dirty {
            return;
        }
        pool.unshift(session);
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &bson::Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[tokio::test]
    async fn sessions_are_reused_most_recent_first() {
        let pool = ServerSessionPool::new();
        let first = ServerSession::new();
        let second = ServerSession::new();
        let second_id = second.id.clone();

        pool.check_in(first, TIMEOUT).await;
        pool.check_in(second, TIMEOUT).await;

        let reused = pool.check_out(TIMEOUT).await;
        assert_eq!(reused.id, second_id);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded_on_check_in() {
        let pool = ServerSessionPool::new();
        let mut session = ServerSession::new();
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, TIMEOUT).await;
        assert!(!pool.contains(&id).await);
    }

    #[tokio::test]
    async fn expiring_sessions_are_pruned() {
        let pool = ServerSessionPool::new();
        let session = ServerSession::new();
        let id = session.id.clone();
        pool.check_in(session, TIMEOUT).await;

        // Any session is "about to expire" under a timeout shorter than the
        // one-minute safety window.
        let expired = pool.check_out(Some(Duration::from_secs(30))).await;
        assert_ne!(expired.id, id);
        assert_eq!(pool.len().await, 0);
    }
}
