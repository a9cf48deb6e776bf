//! Exercises the work-source seam the way the pool engine consumes it:
//! through a trait object, comparing digests against explicit targets.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use vetra_core::difficulty::{meets_target, target_from_difficulty, MAX_TARGET};
use vetra_core::hash::{self, Hash};
use vetra_core::work::{CommitOutcome, Proof, TemplateTx, WorkSource};

struct FixedWork {
    target: Hash,
    txs: Vec<TemplateTx>,
    branch: Vec<String>,
}

impl FixedWork {
    fn new(target: Hash) -> Self {
        Self {
            target,
            txs: vec![TemplateTx::new([0x11; 32]), TemplateTx::new([0x22; 32])],
            branch: vec!["aa".repeat(32), "bb".repeat(32)],
        }
    }
}

#[async_trait]
impl WorkSource for FixedWork {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn target(&self) -> Result<Hash> {
        Ok(self.target)
    }

    fn difficulty(&self) -> u64 {
        1
    }

    fn prev_hash(&self) -> &str {
        "00000000aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
    }

    fn coinbase_halves(&self) -> (&str, &str) {
        ("0100", "0200")
    }

    fn merkle_branch(&self) -> &[String] {
        &self.branch
    }

    fn tree_root(&self) -> &str {
        "11"
    }

    fn filter_root(&self) -> &str {
        "22"
    }

    fn reserved_root(&self) -> &str {
        "33"
    }

    fn version(&self) -> u32 {
        1
    }

    fn bits(&self) -> u32 {
        0x1d00ffff
    }

    fn time(&self) -> u32 {
        1_700_000_000
    }

    fn transactions(&self) -> &[TemplateTx] {
        &self.txs
    }

    fn leaf_hash(&self, txid: &Hash) -> Hash {
        hash::leaf_hash(txid)
    }

    fn get_proof(&self, nonce1: &str, nonce2: &str, time: &str, nonce: &str) -> Option<Proof> {
        let mut blob = Vec::new();
        for part in [nonce1, nonce2, time, nonce] {
            blob.extend(hex::decode(part).ok()?);
        }
        Some(Proof {
            hash: hash::header_hash(&blob),
            nonce1: nonce1.to_string(),
            nonce2: nonce2.to_string(),
            time: time.to_string(),
            nonce: nonce.to_string(),
        })
    }

    async fn commit(&self, proof: &Proof) -> Result<CommitOutcome> {
        Ok(CommitOutcome::Accepted {
            block_hash: hash::to_hex(&proof.hash),
        })
    }
}

#[tokio::test]
async fn proof_flows_through_trait_object() {
    let work: Arc<dyn WorkSource> = Arc::new(FixedWork::new(MAX_TARGET));

    let proof = work
        .get_proof("deadbeef", "00112233", "0000003c", "12345678")
        .expect("well-formed tuple");
    assert!(meets_target(&proof.hash, &MAX_TARGET));

    // the same tuple always evaluates to the same digest
    let again = work
        .get_proof("deadbeef", "00112233", "0000003c", "12345678")
        .unwrap();
    assert_eq!(proof.hash, again.hash);

    match work.commit(&proof).await.unwrap() {
        CommitOutcome::Accepted { block_hash } => assert_eq!(block_hash, hash::to_hex(&proof.hash)),
        CommitOutcome::Rejected { reason } => panic!("unexpected reject: {reason}"),
    }
}

#[tokio::test]
async fn malformed_tuple_yields_no_proof() {
    let work = FixedWork::new(MAX_TARGET);
    assert!(work.get_proof("zz", "00112233", "0000003c", "12345678").is_none());
}

#[test]
fn share_target_is_stricter_than_difficulty_one() {
    let share = target_from_difficulty(1_000);
    assert!(share < MAX_TARGET);
    // a digest above the share target still fails even though it clears diff 1
    let mut digest = share;
    digest[0] += 1;
    assert!(meets_target(&digest, &MAX_TARGET));
    assert!(!meets_target(&digest, &share));
}
