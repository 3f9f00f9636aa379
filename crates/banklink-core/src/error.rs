use thiserror::Error;

/// banklink runtime errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Challenge contract violation: {0}")]
    ChallengeContract(String),

    #[error("Reconciliation action not allowed: {0}")]
    ReconciliationAction(String),

    #[error("No discovered round: {0}")]
    NoDiscovery(String),

    #[error("Account store failure: {0}")]
    AccountStore(String),

    #[error("Directory persistence failure: {0}")]
    Directory(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LinkError {
    pub fn challenge_contract(detail: impl Into<String>) -> Self {
        Self::ChallengeContract(detail.into())
    }

    pub fn account_store(detail: impl Into<String>) -> Self {
        Self::AccountStore(detail.into())
    }
}
