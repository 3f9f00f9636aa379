use async_trait::async_trait;
use std::sync::Arc;

/// Result of one operator interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome<T> {
    Accepted(T),
    Cancelled,
}

impl<T> PromptOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PromptOutcome<U> {
        match self {
            Self::Accepted(value) => PromptOutcome::Accepted(f(value)),
            Self::Cancelled => PromptOutcome::Cancelled,
        }
    }
}

/// Credential prompt context. The server host is shown so the operator can
/// verify they are not handing credentials to a look-alike.
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest {
    pub server_host: String,
    pub user_id: String,
    pub credential_label_1: Option<String>,
    pub credential_label_2: Option<String>,
}

/// Operator-entered credential material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialInput {
    pub user_id: String,
    pub password: String,
    pub credential_1: String,
    pub credential_2: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthTokenRequest {
    pub label: String,
    pub info_url: Option<String>,
}

/// One challenge question as presented to the operator, label already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaQuestion {
    pub phrase_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct MfaRequest {
    pub questions: Vec<MfaQuestion>,
}

/// Operator answer set, one entry per presented question.
pub type MfaInput = Vec<crate::types::MfaChallengeAnswer>;

#[derive(Debug, Clone, Default)]
pub struct NewPasswordRequest {
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    /// Why the previous entry was rejected, on a re-prompt.
    pub rejection: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPasswordInput {
    pub password: String,
    pub confirmation: String,
}

/// Modal credential prompt surface.
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn request(&self, request: CredentialRequest) -> PromptOutcome<CredentialInput>;
}

/// One-time auth token prompt surface.
#[async_trait]
pub trait AuthTokenPrompt: Send + Sync {
    async fn request(&self, request: AuthTokenRequest) -> PromptOutcome<String>;
}

/// Multi-factor challenge prompt surface.
#[async_trait]
pub trait MfaPrompt: Send + Sync {
    async fn request(&self, request: MfaRequest) -> PromptOutcome<MfaInput>;
}

/// New-password prompt surface. The surface collects the password twice; the
/// resolver owns validation and the change round-trip.
#[async_trait]
pub trait NewPasswordPrompt: Send + Sync {
    async fn request(&self, request: NewPasswordRequest) -> PromptOutcome<NewPasswordInput>;
}

/// The four pluggable human-interaction points consumed by the orchestrator.
#[derive(Clone)]
pub struct PromptSurfaces {
    pub credentials: Arc<dyn CredentialPrompt>,
    pub auth_token: Arc<dyn AuthTokenPrompt>,
    pub mfa: Arc<dyn MfaPrompt>,
    pub new_password: Arc<dyn NewPasswordPrompt>,
}
