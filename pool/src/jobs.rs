/// Job lifecycle: wrapping upstream work objects, duplicate-share detection
/// and the wire form of `mining.notify`.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use vetra_core::hash::Hash;
use vetra_core::work::{CommitOutcome, Proof, WorkSource};

use crate::error::CommitError;
use crate::stratum::protocol::Submission;

/// Superseded jobs kept around so late shares can still be honored.
const HISTORY_LIMIT: usize = 16;

/// One unit of work offered to miners.
///
/// Duplicate detection is per-Job: two different connections submitting the
/// identical nonce tuple on the same job are both caught here.
pub struct Job {
    id: String,
    work: Arc<dyn WorkSource>,
    target: Hash,
    difficulty: u64,
    seen: Mutex<HashSet<String>>,
    committed: AtomicBool,
    stale: AtomicBool,
}

impl Job {
    fn new(id: String, work: Arc<dyn WorkSource>) -> anyhow::Result<Self> {
        let target = work.target()?;
        let difficulty = work.difficulty();
        Ok(Self {
            id,
            work,
            target,
            difficulty,
            seen: Mutex::new(HashSet::new()),
            committed: AtomicBool::new(false),
            stale: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Network target snapshot taken at creation.
    pub fn target(&self) -> &Hash {
        &self.target
    }

    pub fn difficulty(&self) -> u64 {
        self.difficulty
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Stale jobs keep accepting shares unless the work source marked them
    /// clean-only.
    pub fn accepts_stale(&self) -> bool {
        !self.work.clean_only()
    }

    /// Record a nonce-tuple fingerprint. False means it was already seen.
    pub fn record_submission(&self, fingerprint: &str) -> bool {
        self.seen.lock().insert(fingerprint.to_string())
    }

    /// Delegate the proof check to the work source. None is a failed check.
    pub fn get_proof(&self, nonce1: &str, sub: &Submission) -> Option<Proof> {
        self.work.get_proof(nonce1, &sub.nonce2, &sub.time, &sub.nonce)
    }

    /// Commit a winning proof upstream. Enforced once per job.
    pub async fn commit(&self, proof: &Proof) -> Result<CommitOutcome, CommitError> {
        if self
            .committed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CommitError::AlreadyCommitted);
        }
        Ok(self.work.commit(proof).await?)
    }

    /// The ordered 13-field `mining.notify` params:
    /// `[id, prev, coinb1, coinb2, [leaf..], stepsJson, treeRoot,
    ///   filterRoot, reservedRoot, version, bits, time, clean]`.
    ///
    /// One merkle leaf per coinbase-adjacent transaction lets the miner
    /// rebuild the root without a second round trip.
    pub fn notify_params(&self, clean: bool) -> anyhow::Result<Value> {
        let work = &self.work;
        let (coinb1, coinb2) = work.coinbase_halves();
        let leaves: Vec<String> = work
            .transactions()
            .iter()
            .map(|tx| hex::encode(work.leaf_hash(tx.txid())))
            .collect();
        let steps_json = serde_json::to_string(work.merkle_branch())?;
        Ok(json!([
            self.id,
            work.prev_hash().to_lowercase(),
            coinb1.to_lowercase(),
            coinb2.to_lowercase(),
            leaves,
            steps_json,
            work.tree_root().to_lowercase(),
            work.filter_root().to_lowercase(),
            work.reserved_root().to_lowercase(),
            format!("{:08x}", work.version()),
            format!("{:08x}", work.bits()),
            format!("{:08x}", work.time()),
            clean,
        ]))
    }
}

#[derive(Default)]
struct RegistryInner {
    current: Option<Arc<Job>>,
    by_id: HashMap<String, Arc<Job>>,
    order: VecDeque<String>,
}

/// Owns every live Job. The current-job reference is replaced atomically
/// under the registry lock; readers see either the old or the new job,
/// never a partially built one.
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
    next_seq: AtomicU64,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// 20 printable characters: a 12-digit hex sequence plus 8 random hex
    /// digits. Unique for as long as any job can stay referenced.
    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let salt = Uuid::new_v4().simple().to_string();
        format!("{:012x}{}", seq, &salt[..8])
    }

    /// Wrap fresh upstream work into the new current job; the previous
    /// current job goes stale. Fails when the work object cannot produce a
    /// target.
    pub async fn create_job(&self, work: Arc<dyn WorkSource>) -> anyhow::Result<Arc<Job>> {
        let job = Arc::new(Job::new(self.next_id(), work)?);

        let mut inner = self.inner.write().await;
        if let Some(prev) = inner.current.take() {
            prev.mark_stale();
        }
        inner.by_id.insert(job.id().to_string(), job.clone());
        inner.order.push_back(job.id().to_string());
        while inner.order.len() > HISTORY_LIMIT {
            if let Some(oldest) = inner.order.pop_front() {
                inner.by_id.remove(&oldest);
            }
        }
        inner.current = Some(job.clone());
        Ok(job)
    }

    pub async fn current(&self) -> Option<Arc<Job>> {
        self.inner.read().await.current.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
