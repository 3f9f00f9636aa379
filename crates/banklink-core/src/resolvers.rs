use crate::error::LinkError;
use crate::prompts::{
    AuthTokenPrompt, AuthTokenRequest, CredentialInput, CredentialPrompt, CredentialRequest,
    MfaPrompt, MfaQuestion, MfaRequest, NewPasswordPrompt, NewPasswordRequest, PromptOutcome,
};
use crate::transport::BankTransport;
use crate::types::{
    Credentials, Fault, InstitutionDraft, MfaChallenge, MfaChallengeAnswer, SignOnCapabilities,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Human-readable labels for the standard challenge phrase ids, used when the
/// server issues a bare phrase id without its own label.
const WELL_KNOWN_MFA_PHRASES: &[(&str, &str)] = &[
    ("MFA101", "City of birth"),
    ("MFA102", "Date of birth, formatted MM/DD/YYYY"),
    ("MFA103", "Debit card number"),
    ("MFA104", "Father's middle name"),
    ("MFA105", "Favorite color"),
    ("MFA106", "First pet's name"),
    ("MFA107", "Five-digit ZIP code"),
    ("MFA108", "Grandmother's maiden name on your father's side"),
    ("MFA109", "Grandmother's maiden name on your mother's side"),
    ("MFA110", "Last four digits of your cell phone number"),
];

fn well_known_phrase_label(phrase_id: &str) -> Option<&'static str> {
    WELL_KNOWN_MFA_PHRASES
        .iter()
        .find(|(id, _)| *id == phrase_id)
        .map(|(_, label)| *label)
}

/// Label fallback chain: server-supplied label, then the well-known phrase
/// table, then a raw unknown-question label.
pub fn challenge_label(challenge: &MfaChallenge) -> String {
    if let Some(label) = &challenge.label {
        if !label.is_empty() {
            return label.clone();
        }
    }
    if let Some(label) = well_known_phrase_label(&challenge.phrase_id) {
        return label.to_string();
    }
    format!("Unknown question ({})", challenge.phrase_id)
}

/// Credential re-prompt. The institution's server host is passed through as
/// trust context so the operator can verify who is asking.
pub struct CredentialResolver {
    prompt: Arc<dyn CredentialPrompt>,
}

impl CredentialResolver {
    pub fn new(prompt: Arc<dyn CredentialPrompt>) -> Self {
        Self { prompt }
    }

    pub async fn resolve(
        &self,
        institution: &InstitutionDraft,
        capabilities: &SignOnCapabilities,
        current: &Credentials,
    ) -> PromptOutcome<CredentialInput> {
        self.prompt
            .request(CredentialRequest {
                server_host: institution.server_host(),
                user_id: current.user_id.clone(),
                credential_label_1: capabilities.credential_label_1.clone(),
                credential_label_2: capabilities.credential_label_2.clone(),
            })
            .await
    }
}

/// One-time auth token prompt, shown with the server-supplied label and
/// optional "more info" link.
pub struct AuthTokenResolver {
    prompt: Arc<dyn AuthTokenPrompt>,
}

impl AuthTokenResolver {
    pub fn new(prompt: Arc<dyn AuthTokenPrompt>) -> Self {
        Self { prompt }
    }

    pub async fn resolve(&self, capabilities: &SignOnCapabilities) -> PromptOutcome<String> {
        let label = capabilities
            .auth_token_label
            .clone()
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| "Authentication token".to_string());

        self.prompt
            .request(AuthTokenRequest {
                label,
                info_url: capabilities.auth_token_info_url.clone(),
            })
            .await
    }
}

/// Multi-factor challenge prompt. Questions the transport can answer itself
/// are never shown; the merged answer set always covers every issued phrase id
/// exactly once.
pub struct MfaChallengeResolver {
    prompt: Arc<dyn MfaPrompt>,
}

impl MfaChallengeResolver {
    pub fn new(prompt: Arc<dyn MfaPrompt>) -> Self {
        Self { prompt }
    }

    pub async fn resolve(
        &self,
        transport: &dyn BankTransport,
        challenges: &[MfaChallenge],
    ) -> Result<PromptOutcome<Vec<MfaChallengeAnswer>>, LinkError> {
        if challenges.is_empty() {
            // Without questions there is nothing an operator could supply and
            // a bare resubmission would fault identically forever.
            return Err(LinkError::challenge_contract(
                "challenge fault carried no challenge questions",
            ));
        }

        // Duplicate phrase ids in one challenge set: later entry wins.
        let mut deduped: Vec<MfaChallenge> = Vec::new();
        for challenge in challenges {
            if let Some(existing) = deduped
                .iter_mut()
                .find(|c| c.phrase_id == challenge.phrase_id)
            {
                *existing = challenge.clone();
            } else {
                deduped.push(challenge.clone());
            }
        }

        let mut answers: Vec<MfaChallengeAnswer> = Vec::new();
        let mut questions: Vec<MfaQuestion> = Vec::new();
        for challenge in &deduped {
            match transport.built_in_mfa_answer(&challenge.phrase_id) {
                Some(answer) => {
                    debug!(phrase_id = %challenge.phrase_id, "challenge answered by transport");
                    answers.push(MfaChallengeAnswer::new(challenge.phrase_id.clone(), answer));
                }
                None => questions.push(MfaQuestion {
                    phrase_id: challenge.phrase_id.clone(),
                    label: challenge_label(challenge),
                }),
            }
        }

        if !questions.is_empty() {
            let expected: HashSet<String> =
                questions.iter().map(|q| q.phrase_id.clone()).collect();

            let operator = match self.prompt.request(MfaRequest { questions }).await {
                PromptOutcome::Accepted(operator) => operator,
                PromptOutcome::Cancelled => return Ok(PromptOutcome::Cancelled),
            };

            let mut answered: HashSet<String> = HashSet::new();
            for answer in &operator {
                if !expected.contains(&answer.phrase_id) {
                    return Err(LinkError::challenge_contract(format!(
                        "answer for unissued phrase id '{}'",
                        answer.phrase_id
                    )));
                }
                if !answered.insert(answer.phrase_id.clone()) {
                    return Err(LinkError::challenge_contract(format!(
                        "duplicate answer for phrase id '{}'",
                        answer.phrase_id
                    )));
                }
            }
            if answered.len() != expected.len() {
                let missing: Vec<String> = expected
                    .iter()
                    .filter(|id| !answered.contains(*id))
                    .cloned()
                    .collect();
                return Err(LinkError::challenge_contract(format!(
                    "unanswered phrase ids: {}",
                    missing.join(",")
                )));
            }

            answers.extend(operator);
        }

        Ok(PromptOutcome::Accepted(answers))
    }
}

/// Forced password change. Validation (entered twice, matching, institution
/// length bounds) happens before anything reaches the wire; the resolver then
/// runs the change against the transport itself and only reports `Accepted`
/// once the server confirms it.
pub struct NewPasswordResolver {
    prompt: Arc<dyn NewPasswordPrompt>,
}

impl NewPasswordResolver {
    pub fn new(prompt: Arc<dyn NewPasswordPrompt>) -> Self {
        Self { prompt }
    }

    pub async fn resolve(
        &self,
        transport: &dyn BankTransport,
        institution: &InstitutionDraft,
        credentials: &Credentials,
        capabilities: &SignOnCapabilities,
    ) -> Result<PromptOutcome<String>, Fault> {
        let mut rejection: Option<String> = None;

        loop {
            let input = match self
                .prompt
                .request(NewPasswordRequest {
                    min_len: capabilities.min_password_len,
                    max_len: capabilities.max_password_len,
                    rejection: rejection.take(),
                })
                .await
            {
                PromptOutcome::Accepted(input) => input,
                PromptOutcome::Cancelled => return Ok(PromptOutcome::Cancelled),
            };

            if input.password != input.confirmation {
                rejection = Some("The two entries do not match".to_string());
                continue;
            }
            let len = input.password.chars().count();
            if let Some(min) = capabilities.min_password_len {
                if len < min {
                    rejection = Some(format!("Password must be at least {min} characters"));
                    continue;
                }
            }
            if let Some(max) = capabilities.max_password_len {
                if len > max {
                    rejection = Some(format!("Password must be at most {max} characters"));
                    continue;
                }
            }

            transport
                .change_password(institution, credentials, &input.password)
                .await?;
            return Ok(PromptOutcome::Accepted(input.password));
        }
    }
}
