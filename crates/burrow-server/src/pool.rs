//! Per-session pools of pre-opened worker connections.
//!
//! A session is one live tunnel: a (session id, subdomain) pair, the
//! tunnel control socket, and a FIFO queue of idle workers parked by
//! JoinPool. The pool keeps two indexes over the same sessions and
//! mutates them atomically under one lock; queue operations take only
//! the owning session's lock.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use burrow_proto::codec;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Byte stream a worker parks in the pool.
pub trait PooledStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PooledStream for T {}

pub type BoxedStream = Box<dyn PooledStream>;

/// Write side of a session's tunnel control socket.
pub type TunnelWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type SharedTunnelWriter = Arc<tokio::sync::Mutex<TunnelWriter>>;

/// Upper bound on idle workers queued per session.
pub const MAX_IDLE_PER_SESSION: usize = 99_999;
/// First spawn request pushed to a client.
pub const INITIAL_SPAWN: u32 = 5;
/// Ceiling for the doubling spawn schedule.
pub const MAX_SPAWN: u32 = 1024;

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool and index errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("subdomain is already claimed by a live session")]
    SubdomainTaken,

    #[error("subdomain not found")]
    SubdomainNotFound,

    #[error("session not found")]
    SessionNotFound,

    #[error("session pool is full")]
    PoolFull,

    #[error("session pool is empty")]
    PoolEmpty,
}

/// A worker connection parked in a session's idle queue.
///
/// Dropping a `PooledConn` closes its socket and releases the JoinPool
/// handler waiting on the done signal, so pruning and session teardown
/// need no extra bookkeeping.
pub struct PooledConn {
    session_id: String,
    stream: BoxedStream,
    joined_at: Instant,
    done: oneshot::Sender<()>,
}

impl PooledConn {
    pub fn new(session_id: String, stream: BoxedStream) -> (Self, oneshot::Receiver<()>) {
        let (done, done_rx) = oneshot::channel();
        (
            Self {
                session_id,
                stream,
                joined_at: Instant::now(),
                done,
            },
            done_rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn age(&self) -> Duration {
        self.joined_at.elapsed()
    }

    /// Hand the socket to a splice, keeping the done signal to fire
    /// when the splice completes.
    pub fn into_parts(self) -> (BoxedStream, oneshot::Sender<()>) {
        (self.stream, self.done)
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("session_id", &self.session_id)
            .field("age", &self.age())
            .finish()
    }
}

struct SessionState {
    idle: VecDeque<PooledConn>,
    next_open: u32,
}

/// One live tunnel and its worker queue.
pub struct Session {
    session_id: String,
    subdomain: String,
    tunnel: SharedTunnelWriter,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn idle_len(&self) -> usize {
        self.state.lock().expect("session lock poisoned").idle.len()
    }

    pub fn next_open(&self) -> u32 {
        self.state.lock().expect("session lock poisoned").next_open
    }

    /// Ask the client, over the tunnel control socket, to spawn the
    /// next batch of workers. Each request doubles the following one,
    /// up to [`MAX_SPAWN`].
    pub async fn open_more(&self) -> io::Result<()> {
        let count = {
            let mut state = self.state.lock().expect("session lock poisoned");
            let count = state.next_open;
            state.next_open = count.saturating_mul(2).min(MAX_SPAWN);
            count
        };

        debug!(
            subdomain = %self.subdomain,
            count,
            "requesting more workers from client"
        );

        let mut tunnel = self.tunnel.lock().await;
        codec::write_u32(&mut *tunnel, count).await?;
        tunnel.flush().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("subdomain", &self.subdomain)
            .finish()
    }
}

#[derive(Default)]
struct PoolIndex {
    by_id: HashMap<String, Arc<Session>>,
    by_subdomain: HashMap<String, Arc<Session>>,
}

/// Process-wide registry of sessions and their idle workers.
pub struct ConnectionPool {
    index: Mutex<PoolIndex>,
    idle_timeout: Duration,
    idle_capacity: usize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(PoolIndex::default()),
            idle_timeout: IDLE_TIMEOUT,
            idle_capacity: MAX_IDLE_PER_SESSION,
        }
    }

    /// Override the idle timeout (tests).
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Override the per-session queue capacity (tests).
    pub fn with_idle_capacity(mut self, idle_capacity: usize) -> Self {
        self.idle_capacity = idle_capacity;
        self
    }

    /// Insert a session into both indexes atomically.
    pub fn add_session(
        &self,
        session_id: &str,
        subdomain: &str,
        tunnel: SharedTunnelWriter,
    ) -> Result<Arc<Session>, PoolError> {
        let mut index = self.index.lock().expect("pool lock poisoned");
        if index.by_subdomain.contains_key(subdomain) {
            return Err(PoolError::SubdomainTaken);
        }

        let session = Arc::new(Session {
            session_id: session_id.to_string(),
            subdomain: subdomain.to_string(),
            tunnel,
            state: Mutex::new(SessionState {
                idle: VecDeque::new(),
                next_open: INITIAL_SPAWN,
            }),
        });

        index.by_id.insert(session_id.to_string(), session.clone());
        index
            .by_subdomain
            .insert(subdomain.to_string(), session.clone());
        Ok(session)
    }

    /// Remove a session from both indexes and drop every queued worker,
    /// closing their sockets and releasing their JoinPool handlers.
    pub fn remove_session(&self, session_id: &str) -> Result<(), PoolError> {
        let session = {
            let mut index = self.index.lock().expect("pool lock poisoned");
            let session = index
                .by_id
                .remove(session_id)
                .ok_or(PoolError::SessionNotFound)?;
            index.by_subdomain.remove(session.subdomain());
            session
        };

        let drained = {
            let mut state = session.state.lock().expect("session lock poisoned");
            state.idle.drain(..).count()
        };
        debug!(
            subdomain = %session.subdomain(),
            drained,
            "session removed"
        );
        Ok(())
    }

    pub fn get_session(&self, subdomain: &str) -> Result<Arc<Session>, PoolError> {
        self.index
            .lock()
            .expect("pool lock poisoned")
            .by_subdomain
            .get(subdomain)
            .cloned()
            .ok_or(PoolError::SubdomainNotFound)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.index
            .lock()
            .expect("pool lock poisoned")
            .by_id
            .contains_key(session_id)
    }

    pub fn has_subdomain(&self, subdomain: &str) -> bool {
        self.index
            .lock()
            .expect("pool lock poisoned")
            .by_subdomain
            .contains_key(subdomain)
    }

    fn session_by_id(&self, session_id: &str) -> Option<Arc<Session>> {
        self.index
            .lock()
            .expect("pool lock poisoned")
            .by_id
            .get(session_id)
            .cloned()
    }

    /// Non-blocking enqueue of an idle worker.
    pub fn put_conn(&self, session_id: &str, conn: PooledConn) -> Result<(), PoolError> {
        let session = self
            .session_by_id(session_id)
            .ok_or(PoolError::SessionNotFound)?;
        let mut state = session.state.lock().expect("session lock poisoned");
        if state.idle.len() >= self.idle_capacity {
            return Err(PoolError::PoolFull);
        }
        state.idle.push_back(conn);
        trace!(session_id, queued = state.idle.len(), "worker parked");
        Ok(())
    }

    /// Non-blocking FIFO dequeue of an idle worker.
    pub fn get_conn(&self, session_id: &str) -> Result<PooledConn, PoolError> {
        let session = self
            .session_by_id(session_id)
            .ok_or(PoolError::SessionNotFound)?;
        let mut state = session.state.lock().expect("session lock poisoned");
        state.idle.pop_front().ok_or(PoolError::PoolEmpty)
    }

    /// Drop every worker idle past the timeout, then reseed the spawn
    /// schedule from what survived.
    pub fn prune(&self) {
        let sessions: Vec<Arc<Session>> = {
            let index = self.index.lock().expect("pool lock poisoned");
            index.by_id.values().cloned().collect()
        };

        for session in sessions {
            let mut state = session.state.lock().expect("session lock poisoned");
            let before = state.idle.len();
            state.idle.retain(|conn| conn.age() < self.idle_timeout);
            let after = state.idle.len();
            state.next_open = next_spawn_size(after);
            if before != after {
                debug!(
                    subdomain = %session.subdomain(),
                    expired = before - after,
                    remaining = after,
                    "pruned idle workers"
                );
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the idle pruner until the pool is dropped by everyone else.
pub async fn run_pruner(pool: Arc<ConnectionPool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        pool.prune();
    }
}

/// Smallest step of the 5-doubling schedule strictly greater than
/// `len`, clamped at [`MAX_SPAWN`].
pub fn next_spawn_size(len: usize) -> u32 {
    let mut size = INITIAL_SPAWN;
    while (size as usize) <= len && size < MAX_SPAWN {
        size = size.saturating_mul(2);
    }
    size.min(MAX_SPAWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sink_writer() -> SharedTunnelWriter {
        Arc::new(tokio::sync::Mutex::new(
            Box::new(tokio::io::sink()) as TunnelWriter
        ))
    }

    fn parked(session_id: &str) -> (PooledConn, oneshot::Receiver<()>) {
        let (local, _remote) = tokio::io::duplex(64);
        PooledConn::new(session_id.to_string(), Box::new(local))
    }

    #[tokio::test]
    async fn indexes_stay_in_step() {
        let pool = ConnectionPool::new();
        let session = pool.add_session("sid-1", "alpha", sink_writer()).unwrap();

        assert!(pool.has_session("sid-1"));
        assert!(pool.has_subdomain("alpha"));
        assert_eq!(
            pool.get_session("alpha").unwrap().session_id(),
            session.session_id()
        );

        pool.remove_session("sid-1").unwrap();
        assert!(!pool.has_session("sid-1"));
        assert!(!pool.has_subdomain("alpha"));
        assert_eq!(
            pool.get_session("alpha").unwrap_err(),
            PoolError::SubdomainNotFound
        );
    }

    #[tokio::test]
    async fn duplicate_subdomain_is_rejected() {
        let pool = ConnectionPool::new();
        pool.add_session("sid-1", "alpha", sink_writer()).unwrap();
        assert_eq!(
            pool.add_session("sid-2", "alpha", sink_writer()).unwrap_err(),
            PoolError::SubdomainTaken
        );
        // first claim still intact
        assert!(pool.has_session("sid-1"));
        assert!(!pool.has_session("sid-2"));
    }

    #[tokio::test]
    async fn concurrent_claims_on_one_subdomain_admit_exactly_one() {
        let pool = Arc::new(ConnectionPool::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.add_session(&format!("sid-{i}"), "alpha", sink_writer())
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn conns_dequeue_in_fifo_order() {
        let pool = ConnectionPool::new();
        pool.add_session("sid-1", "alpha", sink_writer()).unwrap();

        let (first_local, mut first_remote) = tokio::io::duplex(64);
        let (second_local, _second_remote) = tokio::io::duplex(64);
        let (first, _rx1) = PooledConn::new("sid-1".to_string(), Box::new(first_local));
        let (second, _rx2) = PooledConn::new("sid-1".to_string(), Box::new(second_local));
        pool.put_conn("sid-1", first).unwrap();
        pool.put_conn("sid-1", second).unwrap();

        // a write through the popped worker lands on the first-parked peer
        let popped = pool.get_conn("sid-1").unwrap();
        let (mut stream, _done) = popped.into_parts();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"x")
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        tokio::time::timeout(
            Duration::from_secs(1),
            first_remote.read_exact(&mut buf),
        )
        .await
        .expect("first parked worker should be first out")
        .unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn empty_queue_returns_pool_empty() {
        let pool = ConnectionPool::new();
        pool.add_session("sid-1", "alpha", sink_writer()).unwrap();
        assert_eq!(pool.get_conn("sid-1").unwrap_err(), PoolError::PoolEmpty);
    }

    #[tokio::test]
    async fn full_queue_returns_pool_full() {
        let pool = ConnectionPool::new().with_idle_capacity(2);
        pool.add_session("sid-1", "alpha", sink_writer()).unwrap();

        let (a, _ra) = parked("sid-1");
        let (b, _rb) = parked("sid-1");
        let (c, _rc) = parked("sid-1");
        pool.put_conn("sid-1", a).unwrap();
        pool.put_conn("sid-1", b).unwrap();
        assert_eq!(pool.put_conn("sid-1", c).unwrap_err(), PoolError::PoolFull);
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let pool = ConnectionPool::new();
        let (conn, _rx) = parked("ghost");
        assert_eq!(
            pool.put_conn("ghost", conn).unwrap_err(),
            PoolError::SessionNotFound
        );
        assert_eq!(
            pool.get_conn("ghost").unwrap_err(),
            PoolError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn open_more_doubles_until_the_clamp() {
        let pool = ConnectionPool::new();
        let (writer, mut reader) = tokio::io::duplex(4096);
        let tunnel: SharedTunnelWriter =
            Arc::new(tokio::sync::Mutex::new(Box::new(writer) as TunnelWriter));
        let session = pool.add_session("sid-1", "alpha", tunnel).unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            session.open_more().await.unwrap();
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).await.unwrap();
            seen.push(u32::from_be_bytes(buf));
        }
        assert_eq!(
            seen,
            vec![5, 10, 20, 40, 80, 160, 320, 640, 1024, 1024]
        );
    }

    #[tokio::test]
    async fn prune_drops_expired_and_reseeds_schedule() {
        let pool = ConnectionPool::new().with_idle_timeout(Duration::ZERO);
        let session = pool.add_session("sid-1", "alpha", sink_writer()).unwrap();

        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (conn, rx) = parked("sid-1");
            pool.put_conn("sid-1", conn).unwrap();
            receivers.push(rx);
        }
        // everything is already past a zero timeout
        pool.prune();
        assert_eq!(session.idle_len(), 0);
        assert_eq!(session.next_open(), INITIAL_SPAWN);

        // dropped workers release their join handlers
        for rx in receivers {
            assert!(rx.await.is_err());
        }
    }

    #[tokio::test]
    async fn prune_keeps_fresh_workers() {
        let pool = ConnectionPool::new();
        let session = pool.add_session("sid-1", "alpha", sink_writer()).unwrap();
        let (conn, _rx) = parked("sid-1");
        pool.put_conn("sid-1", conn).unwrap();

        pool.prune();
        assert_eq!(session.idle_len(), 1);
    }

    #[tokio::test]
    async fn removing_a_session_releases_parked_workers() {
        let pool = ConnectionPool::new();
        pool.add_session("sid-1", "alpha", sink_writer()).unwrap();
        let (conn, rx) = parked("sid-1");
        pool.put_conn("sid-1", conn).unwrap();

        pool.remove_session("sid-1").unwrap();
        assert!(rx.await.is_err());
    }

    #[test]
    fn spawn_schedule_grows_past_the_queue_length() {
        assert_eq!(next_spawn_size(0), 5);
        assert_eq!(next_spawn_size(4), 5);
        assert_eq!(next_spawn_size(5), 10);
        assert_eq!(next_spawn_size(11), 20);
        assert_eq!(next_spawn_size(640), 1024);
        assert_eq!(next_spawn_size(100_000), 1024);
    }
}
