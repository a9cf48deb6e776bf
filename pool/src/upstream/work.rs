use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time;

use vetra_core::hash::{self, Hash};
use vetra_core::work::{CommitOutcome, Proof, TemplateTx, WorkSource};

use super::node::NodeClient;
use crate::metrics::prometheus as metrics;
use crate::stratum::StratumServer;

/// Raw template shape returned by the node RPC.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkTemplate {
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    #[serde(default)]
    pub merkle_branch: Vec<String>,
    pub tree_root: String,
    pub filter_root: String,
    pub reserved_root: String,
    pub version: u32,
    pub bits: u32,
    pub time: u32,
    pub target: String,
    pub difficulty: u64,
    #[serde(default)]
    pub transactions: Vec<String>,
    #[serde(default)]
    pub clean_only: bool,
}

/// One node template wrapped as a `WorkSource`.
///
/// All hex is normalized to lowercase at construction; `time` is the only
/// mutable piece and rolls forward on `refresh`.
pub struct ChainWork {
    template: WorkTemplate,
    target: Hash,
    txs: Vec<TemplateTx>,
    time: AtomicU32,
    node: Arc<NodeClient>,
}

impl ChainWork {
    pub fn from_value(value: &Value, node: Arc<NodeClient>) -> Result<Self> {
        let mut template: WorkTemplate = serde_json::from_value(value.clone())
            .map_err(|e| anyhow!("malformed work template: {e}"))?;

        template.prev_hash = template.prev_hash.to_lowercase();
        template.coinbase1 = template.coinbase1.to_lowercase();
        template.coinbase2 = template.coinbase2.to_lowercase();
        template.tree_root = template.tree_root.to_lowercase();
        template.filter_root = template.filter_root.to_lowercase();
        template.reserved_root = template.reserved_root.to_lowercase();
        template.target = template.target.to_lowercase();
        for step in &mut template.merkle_branch {
            *step = step.to_lowercase();
        }

        let target = hash::from_hex(&template.target)
            .ok_or_else(|| anyhow!("template target is not 32 hex bytes"))?;

        let txs = template
            .transactions
            .iter()
            .map(|txid| {
                hash::from_hex(&txid.to_lowercase())
                    .map(TemplateTx::new)
                    .ok_or_else(|| anyhow!("template txid is not 32 hex bytes"))
            })
            .collect::<Result<Vec<_>>>()?;

        let time = AtomicU32::new(template.time);
        Ok(Self {
            template,
            target,
            txs,
            time,
            node,
        })
    }

    /// Header preimage for one nonce tuple: the fixed template fields plus
    /// the rolled time and the three nonce fragments. None on bad hex.
    fn header_blob(&self, nonce1: &str, nonce2: &str, time: &str, nonce: &str) -> Option<Vec<u8>> {
        if time.len() != 8 {
            return None;
        }
        let mut blob = Vec::with_capacity(160);
        blob.extend_from_slice(&self.template.version.to_be_bytes());
        blob.extend(hex::decode(&self.template.prev_hash).ok()?);
        blob.extend(hex::decode(&self.template.tree_root).ok()?);
        blob.extend(hex::decode(&self.template.filter_root).ok()?);
        blob.extend(hex::decode(&self.template.reserved_root).ok()?);
        blob.extend_from_slice(&self.template.bits.to_be_bytes());
        blob.extend(hex::decode(time).ok()?);
        blob.extend(hex::decode(nonce1).ok()?);
        blob.extend(hex::decode(nonce2).ok()?);
        blob.extend(hex::decode(nonce).ok()?);
        Some(blob)
    }
}

#[async_trait]
impl WorkSource for ChainWork {
    /// Roll the template time forward so long-lived jobs stay mineable.
    async fn refresh(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| anyhow!("clock before epoch: {e}"))?
            .as_secs() as u32;
        self.time.fetch_max(now, Ordering::Relaxed);
        Ok(())
    }

    fn target(&self) -> Result<Hash> {
        Ok(self.target)
    }

    fn difficulty(&self) -> u64 {
        self.template.difficulty.max(1)
    }

    fn prev_hash(&self) -> &str {
        &self.template.prev_hash
    }

    fn coinbase_halves(&self) -> (&str, &str) {
        (&self.template.coinbase1, &self.template.coinbase2)
    }

    fn merkle_branch(&self) -> &[String] {
        &self.template.merkle_branch
    }

    fn tree_root(&self) -> &str {
        &self.template.tree_root
    }

    fn filter_root(&self) -> &str {
        &self.template.filter_root
    }

    fn reserved_root(&self) -> &str {
        &self.template.reserved_root
    }

    fn version(&self) -> u32 {
        self.template.version
    }

    fn bits(&self) -> u32 {
        self.template.bits
    }

    fn time(&self) -> u32 {
        self.time.load(Ordering::Relaxed)
    }

    fn transactions(&self) -> &[TemplateTx] {
        &self.txs
    }

    fn leaf_hash(&self, txid: &Hash) -> Hash {
        hash::leaf_hash(txid)
    }

    fn get_proof(&self, nonce1: &str, nonce2: &str, time: &str, nonce: &str) -> Option<Proof> {
        let blob = self.header_blob(nonce1, nonce2, time, nonce)?;
        Some(Proof {
            hash: hash::header_hash(&blob),
            nonce1: nonce1.to_string(),
            nonce2: nonce2.to_string(),
            time: time.to_string(),
            nonce: nonce.to_string(),
        })
    }

    async fn commit(&self, proof: &Proof) -> Result<CommitOutcome> {
        let blob = self
            .header_blob(&proof.nonce1, &proof.nonce2, &proof.time, &proof.nonce)
            .ok_or_else(|| anyhow!("proof no longer assembles a header"))?;
        match self.node.submit_work(&hex::encode(blob)).await? {
            true => Ok(CommitOutcome::Accepted {
                block_hash: hash::to_hex(&proof.hash),
            }),
            false => Ok(CommitOutcome::Rejected {
                reason: "node rejected the block".to_string(),
            }),
        }
    }

    fn clean_only(&self) -> bool {
        self.template.clean_only
    }
}

/// Polls the node for templates and feeds new ones to the stratum server.
pub struct WorkManager {
    node: Arc<NodeClient>,
    poll_interval: Duration,
    current: RwLock<Option<Arc<ChainWork>>>,
}

impl WorkManager {
    pub fn new(node: Arc<NodeClient>, poll_interval: Duration) -> Self {
        tracing::info!(
            "work manager polling every {}s",
            poll_interval.as_secs()
        );
        Self {
            node,
            poll_interval,
            current: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> Option<Arc<ChainWork>> {
        self.current.read().await.clone()
    }

    /// Spawn the poll loop. Each new template becomes a clean job broadcast;
    /// unchanged templates just get their time rolled forward.
    pub async fn start(self: Arc<Self>, server: Arc<StratumServer>) {
        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = time::interval(manager.poll_interval);
            loop {
                ticker.tick().await;
                match manager.node.get_work_template().await {
                    Ok(value) => {
                        if let Err(e) = manager.adopt(&value, &server).await {
                            metrics::inc_template_fetch_errors();
                            tracing::error!("template rejected: {e}");
                        }
                    }
                    Err(e) => {
                        metrics::inc_template_fetch_errors();
                        tracing::error!("template fetch failed: {e}");
                    }
                }
            }
        });
    }

    async fn adopt(&self, value: &Value, server: &Arc<StratumServer>) -> Result<()> {
        let changed = {
            let current = self.current.read().await;
            let incoming_prev = value
                .get("prev_hash")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            match current.as_ref() {
                Some(work) => work.prev_hash() != incoming_prev,
                None => true,
            }
        };

        if !changed {
            if let Some(work) = self.current().await {
                work.refresh().await?;
            }
            return Ok(());
        }

        let work = Arc::new(ChainWork::from_value(value, self.node.clone())?);
        tracing::info!(
            "📋 new work template: prev={} difficulty={}",
            &work.prev_hash()[..work.prev_hash().len().min(16)],
            work.difficulty()
        );
        metrics::inc_template_updates();

        *self.current.write().await = Some(work.clone());
        let source: Arc<dyn WorkSource> = work;
        server.submit_work(source, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template_value() -> Value {
        json!({
            "prev_hash": "AA".repeat(32),
            "coinbase1": "01AB",
            "coinbase2": "02CD",
            "merkle_branch": ["BB".repeat(32)],
            "tree_root": "CC".repeat(32),
            "filter_root": "DD".repeat(32),
            "reserved_root": "EE".repeat(32),
            "version": 2,
            "bits": 0x1d00ffffu32,
            "time": 0x65000000u32,
            "target": "00000fff".to_string() + &"ff".repeat(28),
            "difficulty": 4096,
            "transactions": ["12".repeat(32), "34".repeat(32)],
        })
    }

    fn node() -> Arc<NodeClient> {
        Arc::new(NodeClient::new("http://127.0.0.1:1/jsonrpc".to_string()))
    }

    #[test]
    fn template_parses_and_normalizes() {
        let work = ChainWork::from_value(&template_value(), node()).unwrap();
        assert_eq!(work.prev_hash(), "aa".repeat(32));
        assert_eq!(work.coinbase_halves().0, "01ab");
        assert_eq!(work.merkle_branch(), ["bb".repeat(32)]);
        assert_eq!(work.difficulty(), 4096);
        assert_eq!(work.transactions().len(), 2);
        assert_eq!(work.time(), 0x65000000);
        let target = work.target().unwrap();
        assert_eq!(target[0], 0x00);
        assert_eq!(target[3], 0xff);
    }

    #[test]
    fn bad_target_is_refused() {
        let mut value = template_value();
        value["target"] = json!("nothex");
        assert!(ChainWork::from_value(&value, node()).is_err());

        let mut value = template_value();
        value["target"] = json!("abcd");
        assert!(ChainWork::from_value(&value, node()).is_err());
    }

    #[test]
    fn proofs_are_deterministic_and_nonce_sensitive() {
        let work = ChainWork::from_value(&template_value(), node()).unwrap();
        let a = work
            .get_proof("00000001", "00112233", "65000000", "deadbeef")
            .unwrap();
        let b = work
            .get_proof("00000001", "00112233", "65000000", "deadbeef")
            .unwrap();
        let c = work
            .get_proof("00000001", "00112233", "65000000", "deadbeee")
            .unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn malformed_nonces_produce_no_proof() {
        let work = ChainWork::from_value(&template_value(), node()).unwrap();
        assert!(work.get_proof("zz", "00112233", "65000000", "00").is_none());
        assert!(work.get_proof("00000001", "00112233", "650000", "00").is_none());
    }

    #[tokio::test]
    async fn refresh_rolls_time_forward_only() {
        let work = ChainWork::from_value(&template_value(), node()).unwrap();
        let before = work.time();
        work.refresh().await.unwrap();
        assert!(work.time() >= before);
    }

    #[tokio::test]
    async fn manager_starts_with_no_template() {
        let manager = WorkManager::new(node(), Duration::from_secs(10));
        assert!(manager.current().await.is_none());
    }
}
