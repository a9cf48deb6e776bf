use thiserror::Error;

use crate::config::BanConfig;

/// Submission-path failures. Each maps to a JSON-RPC error code on the wire
/// and a ban-score weight, so a misbehaving miner accumulates toward a ban
/// while a well-behaved one just sees the reject reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("unauthorized worker")]
    Unauthorized,
    #[error("malformed submission: {0}")]
    Malformed(&'static str),
    #[error("job not found")]
    UnknownJob(String),
    #[error("stale job")]
    StaleJob(String),
    #[error("duplicate share")]
    Duplicate,
    #[error("high-hash")]
    BadProof,
}

impl ShareError {
    pub fn code(&self) -> i32 {
        match self {
            ShareError::Malformed(_) => 20,
            ShareError::UnknownJob(_) | ShareError::StaleJob(_) => 21,
            ShareError::Duplicate => 22,
            ShareError::BadProof => 23,
            ShareError::Unauthorized => 24,
        }
    }

    pub fn ban_weight(&self, ban: &BanConfig) -> f64 {
        match self {
            ShareError::Unauthorized => ban.weight_unauthorized,
            ShareError::Malformed(_) => ban.weight_malformed,
            ShareError::UnknownJob(_) => ban.weight_unknown_job,
            ShareError::StaleJob(_) => ban.weight_stale_job,
            ShareError::Duplicate => ban.weight_duplicate,
            ShareError::BadProof => ban.weight_bad_proof,
        }
    }
}

/// Violations of the job commit contract. A job may be committed at most
/// once; a second attempt is an internal invariant failure surfaced to the
/// orchestrator, never swallowed.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("job already committed")]
    AlreadyCommitted,
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}
