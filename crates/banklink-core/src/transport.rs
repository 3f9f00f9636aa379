use crate::types::{
    Credentials, Fault, InstitutionDraft, MfaChallengeAnswer, PasswordChange, ProfileFetch,
    RemoteAccount, SignOnCapabilities, SignOnResult,
};
use async_trait::async_trait;

/// Wire transport to an institution's online-banking endpoint.
///
/// Implementations own request construction, HTTP/TLS, and response parsing.
/// Every operation returns either a parsed response or a `Fault` carrying the
/// raw server code and diagnostic payload; transport-internal failures (I/O,
/// malformed responses) surface as faults with an unrecognized code so the
/// orchestrator presents them through the same fatal path.
#[async_trait]
pub trait BankTransport: Send + Sync {
    async fn get_signon_capabilities(
        &self,
        institution: &InstitutionDraft,
    ) -> Result<SignOnCapabilities, Fault>;

    async fn get_profile(&self, institution: &InstitutionDraft) -> Result<ProfileFetch, Fault>;

    /// Sign on with the given credential material. `mfa_answers` carries the
    /// operator's answers when resubmitting after an MFA challenge; it is
    /// empty on a first attempt.
    async fn sign_on(
        &self,
        institution: &InstitutionDraft,
        credentials: &Credentials,
        mfa_answers: &[MfaChallengeAnswer],
    ) -> Result<SignOnResult, Fault>;

    /// Fetch the remote account list after a successful sign-on. As with
    /// `sign_on`, `mfa_answers` carries challenge answers when this request is
    /// resubmitted after an MFA demand.
    async fn discover_accounts(
        &self,
        institution: &InstitutionDraft,
        credentials: &Credentials,
        mfa_answers: &[MfaChallengeAnswer],
    ) -> Result<Vec<RemoteAccount>, Fault>;

    async fn change_password(
        &self,
        institution: &InstitutionDraft,
        credentials: &Credentials,
        new_password: &str,
    ) -> Result<PasswordChange, Fault>;

    /// Answer the transport can synthesize itself for a well-known challenge
    /// phrase (client identity, host name, and similar machine-answerable
    /// questions). These are merged with operator answers before resubmission.
    fn built_in_mfa_answer(&self, _phrase_id: &str) -> Option<String> {
        None
    }
}
