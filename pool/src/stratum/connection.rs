/// Per-connection state: the Open -> Active -> Destroyed machine, the
/// authorized-user set, difficulty plus its staged successor, and the
/// vardiff / ban-score accumulators.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::banscore::BanScore;
use crate::config::Config;
use crate::vardiff::{RetargetConfig, VarDiffState};

/// One slow reader may queue at most this many unwritten bytes before the
/// connection is destroyed.
pub const MAX_WRITE_BACKLOG: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no authorized user yet.
    Open,
    /// At least one authorized user.
    Active,
    /// Terminal; no further packets are dispatched.
    Destroyed,
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("write backlog exceeded {MAX_WRITE_BACKLOG} bytes")]
    Backlog,
    #[error("transport closed")]
    Closed,
}

/// Handle to the writer task. Sends never await peer I/O; a broadcast to a
/// slow connection therefore cannot stall the others, and the queued-byte
/// counter enforces the backlog cap instead.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<AtomicUsize>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<String>, queued: Arc<AtomicUsize>) -> Self {
        Self { tx, queued }
    }

    pub fn send(&self, line: String) -> Result<(), OutboundError> {
        if self.queued.load(Ordering::Relaxed) + line.len() > MAX_WRITE_BACKLOG {
            return Err(OutboundError::Backlog);
        }
        self.queued.fetch_add(line.len(), Ordering::Relaxed);
        self.tx.send(line).map_err(|_| OutboundError::Closed)
    }
}

pub struct Connection {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    /// Per-session extranonce1, fixed for the lifetime of the connection.
    pub extranonce1: String,
    state: ConnectionState,
    subscribed: bool,
    users: HashSet<String>,
    difficulty: Option<u64>,
    pending_difficulty: Option<u64>,
    vardiff: VarDiffState,
    ban: BanScore,
    outbound: Option<Outbound>,
}

impl Connection {
    pub fn new(session_id: String, peer_addr: SocketAddr, cfg: &Config) -> Self {
        // Derive a stable 4-byte extranonce1 from the session id before it
        // moves into the struct.
        let extranonce1 = {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            session_id.hash(&mut hasher);
            format!("{:08x}", (hasher.finish() & 0xFFFF_FFFF) as u32)
        };

        let now = Instant::now();
        Self {
            session_id,
            peer_addr,
            extranonce1,
            state: ConnectionState::Open,
            subscribed: false,
            users: HashSet::new(),
            difficulty: None,
            pending_difficulty: None,
            vardiff: VarDiffState::new(RetargetConfig {
                shares_per_minute: cfg.shares_per_minute,
                cap_difficulty: cfg.cap_difficulty,
            }),
            ban: BanScore::new(cfg.ban.threshold, cfg.ban.half_life_ms, now),
            outbound: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ConnectionState::Destroyed
    }

    pub fn set_outbound(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn outbound(&self) -> Option<Outbound> {
        self.outbound.clone()
    }

    pub fn mark_subscribed(&mut self) {
        self.subscribed = true;
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Register a username. The first success moves Open -> Active.
    /// Re-registering the same name is a no-op (the set enforces
    /// uniqueness); returns whether the name was newly added.
    pub fn authorize(&mut self, username: &str) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let added = self.users.insert(username.to_string());
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Active;
        }
        added
    }

    pub fn is_authorized_user(&self, username: &str) -> bool {
        self.users.contains(username)
    }

    pub fn difficulty(&self) -> Option<u64> {
        self.difficulty
    }

    pub fn pending_difficulty(&self) -> Option<u64> {
        self.pending_difficulty
    }

    /// Stage a difficulty to take effect on the next job send.
    pub fn stage_difficulty(&mut self, difficulty: u64) {
        self.pending_difficulty = Some(difficulty.max(1));
    }

    /// Difficulty the next job is delivered under: a pending value wins and
    /// is consumed; otherwise the current one; `initial` seeds the very
    /// first job. The bool reports whether the miner must be told.
    pub fn take_effective_difficulty(&mut self, initial: u64) -> (u64, bool) {
        match self.pending_difficulty.take() {
            Some(next) => {
                let changed = self.difficulty != Some(next);
                self.difficulty = Some(next);
                (next, changed)
            }
            None => match self.difficulty {
                Some(current) => (current, false),
                None => {
                    let first = initial.max(1);
                    self.difficulty = Some(first);
                    (first, true)
                }
            },
        }
    }

    /// Restart the vardiff window; called exactly when a job is delivered.
    pub fn reset_retarget(&mut self, now: Instant) {
        self.vardiff.reset(now);
    }

    /// After an accepted share: run the retarget decision and stage any
    /// change. Returns the staged difficulty so the caller can force a
    /// clean job.
    pub fn retarget(&mut self, now: Instant) -> Option<u64> {
        let current = self.difficulty.unwrap_or(1);
        let next = self.vardiff.on_submission(now, current)?;
        self.pending_difficulty = Some(next);
        Some(next)
    }

    /// Apply a ban penalty; true means the threshold was crossed.
    pub fn penalize(&mut self, now: Instant, weight: f64) -> bool {
        self.ban.penalize(now, weight)
    }

    pub fn ban_score(&self, now: Instant) -> f64 {
        self.ban.current(now)
    }

    /// Terminal and idempotent: the first call tears down, repeats are
    /// no-ops. Returns whether this call performed the destroy.
    pub fn destroy(&mut self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.state = ConnectionState::Destroyed;
        self.outbound = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_conn() -> Connection {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345);
        Connection::new("test-session".to_string(), addr, &Config::default())
    }

    #[test]
    fn starts_open_with_unset_difficulty() {
        let conn = test_conn();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.difficulty(), None);
        assert!(!conn.is_subscribed());
        assert_eq!(conn.extranonce1.len(), 8);
    }

    #[test]
    fn first_authorize_activates() {
        let mut conn = test_conn();
        assert!(conn.authorize("alice"));
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.is_authorized_user("alice"));
        assert!(!conn.is_authorized_user("bob"));
        // duplicate registration is a no-op
        assert!(!conn.authorize("alice"));
        assert!(conn.authorize("bob"));
    }

    #[test]
    fn pending_difficulty_is_consumed_once() {
        let mut conn = test_conn();
        // first job seeds from initial
        assert_eq!(conn.take_effective_difficulty(1_000), (1_000, true));
        // no pending: unchanged
        assert_eq!(conn.take_effective_difficulty(1_000), (1_000, false));
        conn.stage_difficulty(4_000);
        assert_eq!(conn.pending_difficulty(), Some(4_000));
        assert_eq!(conn.take_effective_difficulty(1_000), (4_000, true));
        assert_eq!(conn.pending_difficulty(), None);
        assert_eq!(conn.take_effective_difficulty(1_000), (4_000, false));
    }

    #[test]
    fn staged_retarget_waits_for_job_send() {
        let mut conn = test_conn();
        conn.take_effective_difficulty(1_000);
        let start = Instant::now();
        conn.reset_retarget(start);
        // 20 shares all at the reset instant: 4x raise staged, difficulty
        // itself untouched until the next job send
        let mut staged = None;
        for _ in 0..20 {
            staged = conn.retarget(start);
        }
        assert_eq!(staged, Some(4_000));
        assert_eq!(conn.difficulty(), Some(1_000));
        assert_eq!(conn.take_effective_difficulty(1_000), (4_000, true));
    }

    #[test]
    fn destroy_is_terminal_and_idempotent() {
        let mut conn = test_conn();
        conn.authorize("alice");
        assert!(conn.destroy());
        assert_eq!(conn.state(), ConnectionState::Destroyed);
        assert!(!conn.destroy());
        assert!(!conn.authorize("carol"));
        assert_eq!(conn.state(), ConnectionState::Destroyed);
    }

    #[test]
    fn outbound_backlog_cap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let outbound = Outbound::new(tx, queued.clone());

        assert!(outbound.send("hello\n".to_string()).is_ok());
        assert_eq!(queued.load(Ordering::Relaxed), 6);
        assert_eq!(rx.try_recv().unwrap(), "hello\n");

        // a reader that never drains: queue right up to the cap, then fail
        queued.store(MAX_WRITE_BACKLOG, Ordering::Relaxed);
        assert!(matches!(
            outbound.send("x".to_string()),
            Err(OutboundError::Backlog)
        ));

        queued.store(0, Ordering::Relaxed);
        drop(rx);
        assert!(matches!(
            outbound.send("y".to_string()),
            Err(OutboundError::Closed)
        ));
    }
}
