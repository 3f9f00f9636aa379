use crate::types::{Credentials, Fault, SignOnCapabilities};

/// Closed set of server status codes the orchestrator knows how to remediate.
///
/// Anything the classifier does not recognize lands in `Other` and is treated
/// as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    SignonInvalid,
    AuthTokenRequired,
    AuthTokenInvalid,
    MfaChallengeRequired,
    MustChangePassword,
    Other(String),
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SignonInvalid => "signon_invalid",
            Self::AuthTokenRequired => "auth_token_required",
            Self::AuthTokenInvalid => "auth_token_invalid",
            Self::MfaChallengeRequired => "mfa_challenge_required",
            Self::MustChangePassword => "must_change_password",
            Self::Other(_) => "other",
        }
    }
}

/// Remediation demanded before the failed request can be resubmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationStep {
    /// Fatal: surface the fault to the operator verbatim.
    None,
    PromptCredentials,
    PromptAuthToken,
    PromptMfaChallenge,
    PromptNewPassword,
}

impl RemediationStep {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PromptCredentials => "prompt_credentials",
            Self::PromptAuthToken => "prompt_auth_token",
            Self::PromptMfaChallenge => "prompt_mfa_challenge",
            Self::PromptNewPassword => "prompt_new_password",
        }
    }
}

/// Map a raw server fault onto the closed remediation taxonomy.
///
/// Every fault carries exactly one code; unrecognized raw codes default to the
/// `Other` bucket.
pub fn classify(fault: &Fault) -> ErrorCode {
    match fault.code.trim() {
        "" | "0" => ErrorCode::None,
        "15500" => ErrorCode::SignonInvalid,
        "15510" => ErrorCode::MfaChallengeRequired,
        "15512" => ErrorCode::AuthTokenRequired,
        "15513" => ErrorCode::AuthTokenInvalid,
        "15000" => ErrorCode::MustChangePassword,
        other => ErrorCode::Other(other.to_string()),
    }
}

/// Deterministic remediation policy.
///
/// | code                 | precondition        | step               |
/// |----------------------|---------------------|--------------------|
/// | AuthTokenRequired    | auth token is empty | PromptAuthToken    |
/// | AuthTokenInvalid     | always              | PromptAuthToken    |
/// | MfaChallengeRequired | always              | PromptMfaChallenge |
/// | MustChangePassword   | always              | PromptNewPassword  |
/// | SignonInvalid        | always              | PromptCredentials  |
/// | anything else        | —                   | None (fatal)       |
pub fn remediation_for(
    code: &ErrorCode,
    _capabilities: &SignOnCapabilities,
    credentials: &Credentials,
) -> RemediationStep {
    match code {
        ErrorCode::AuthTokenRequired if credentials.auth_token.is_empty() => {
            RemediationStep::PromptAuthToken
        }
        ErrorCode::AuthTokenInvalid => RemediationStep::PromptAuthToken,
        ErrorCode::MfaChallengeRequired => RemediationStep::PromptMfaChallenge,
        ErrorCode::MustChangePassword => RemediationStep::PromptNewPassword,
        ErrorCode::SignonInvalid => RemediationStep::PromptCredentials,
        _ => RemediationStep::None,
    }
}

/// Pre-emptive remediation before any sign-on attempt reaches the wire.
///
/// When the capability block advertises that an auth token is required and the
/// draft has none, the token prompt runs up front instead of waiting for the
/// guaranteed fault. Only the signup path consults this.
pub fn preemptive_step(
    capabilities: &SignOnCapabilities,
    credentials: &Credentials,
) -> Option<RemediationStep> {
    if capabilities.auth_token_required && credentials.auth_token.is_empty() {
        return Some(RemediationStep::PromptAuthToken);
    }
    None
}
