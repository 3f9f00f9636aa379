//! Bank-link core: the authentication and account-discovery orchestrator of a
//! desktop personal-finance manager.
//!
//! Drives the multi-round challenge/response handshake against an
//! institution's online-banking endpoint, suspending for operator input when
//! the server demands additional proof of identity, and reconciles the
//! discovered remote account list against local accounts. Round tokens guard
//! every asynchronous completion so a superseded round can never mutate state.

#![deny(unsafe_code)]

pub mod directory;
pub mod discovery;
pub mod error;
pub mod policy;
pub mod prompts;
pub mod resolvers;
pub mod round;
pub mod runtime;
pub mod transport;
pub mod types;
pub mod vault;

pub use directory::{DirectoryStorageConfig, InstitutionDirectory, InstitutionRecord};
pub use discovery::{
    commit_reconciliation, match_accounts, online_link_id, CommitFailure, CommitReport,
    LocalAccountStore, ReconciliationEntry, ReconciliationState,
};
pub use error::LinkError;
pub use policy::{classify, preemptive_step, remediation_for, ErrorCode, RemediationStep};
pub use prompts::{
    AuthTokenPrompt, AuthTokenRequest, CredentialInput, CredentialPrompt, CredentialRequest,
    MfaInput, MfaPrompt, MfaQuestion, MfaRequest, NewPasswordInput, NewPasswordPrompt,
    NewPasswordRequest, PromptOutcome, PromptSurfaces,
};
pub use resolvers::{
    challenge_label, AuthTokenResolver, CredentialResolver, MfaChallengeResolver,
    NewPasswordResolver,
};
pub use round::{RoundKind, RoundPhase, RoundSnapshot, RoundToken, RoundTracker};
pub use runtime::{LinkEngine, LinkEngineConfig, RoundReport, RoundStatus};
pub use transport::BankTransport;
pub use types::{
    AccountType, Credentials, Fault, InstitutionDraft, LocalAccount, MfaChallenge,
    MfaChallengeAnswer, PasswordChange, ProfileFetch, ProfileInfo, RemoteAccount, RemoteRouting,
    SignOnCapabilities, SignOnResult,
};
pub use vault::CredentialVault;
