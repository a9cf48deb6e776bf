/// The work-source seam.
///
/// The Stratum engine never constructs headers or computes proof-of-work
/// hashes itself; it consumes one unit of upstream work through this trait
/// and hands winning proofs back through `commit`.
use anyhow::Result;
use async_trait::async_trait;

use crate::hash::Hash;

/// One coinbase-adjacent transaction carried by a work template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTx {
    txid: Hash,
}

impl TemplateTx {
    pub fn new(txid: Hash) -> Self {
        Self { txid }
    }

    pub fn txid(&self) -> &Hash {
        &self.txid
    }
}

/// A proof-of-work evaluation for one nonce tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Digest of the assembled header.
    pub hash: Hash,
    /// The tuple that produced it, kept for the commit path.
    pub nonce1: String,
    pub nonce2: String,
    pub time: String,
    pub nonce: String,
}

/// Outcome of committing a winning proof upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Accepted { block_hash: String },
    Rejected { reason: String },
}

#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Revalidate / re-stamp the underlying template (e.g. roll its time
    /// forward) without replacing it.
    async fn refresh(&self) -> Result<()>;

    /// Full network target for this work unit. Errors when the template
    /// cannot produce one.
    fn target(&self) -> Result<Hash>;

    /// Network difficulty for this work unit.
    fn difficulty(&self) -> u64;

    fn prev_hash(&self) -> &str;

    /// Coinbase serialization split around the extranonce insertion point.
    fn coinbase_halves(&self) -> (&str, &str);

    /// Precomputed merkle steps from the coinbase up to the root.
    fn merkle_branch(&self) -> &[String];

    fn tree_root(&self) -> &str;
    fn filter_root(&self) -> &str;
    fn reserved_root(&self) -> &str;

    fn version(&self) -> u32;
    fn bits(&self) -> u32;
    fn time(&self) -> u32;

    /// Coinbase-adjacent transactions whose leaf hashes the job
    /// advertisement carries.
    fn transactions(&self) -> &[TemplateTx];

    /// Leaf-hash function of this work source's hash collaborator.
    fn leaf_hash(&self, txid: &Hash) -> Hash;

    /// Evaluate one nonce tuple. None when the tuple cannot form a header
    /// (bad hex, wrong widths); callers treat that as a failed proof.
    fn get_proof(&self, nonce1: &str, nonce2: &str, time: &str, nonce: &str) -> Option<Proof>;

    /// Hand a winning proof back to the chain.
    async fn commit(&self, proof: &Proof) -> Result<CommitOutcome>;

    /// When true, shares against this work are only valid while it is the
    /// current job; superseded copies must be discarded.
    fn clean_only(&self) -> bool {
        false
    }
}
