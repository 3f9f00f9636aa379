use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Draft of the institution the operator is connecting to.
///
/// This is the working copy edited in the connection dialog; the directory keeps
/// the persisted record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionDraft {
    pub institution_id: String,
    pub name: String,
    pub url: String,
    pub org: String,
    pub fid: String,
}

impl InstitutionDraft {
    pub fn new(
        institution_id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            institution_id: institution_id.into(),
            name: name.into(),
            url: url.into(),
            org: String::new(),
            fid: String::new(),
        }
    }

    pub fn with_realm(mut self, org: impl Into<String>, fid: impl Into<String>) -> Self {
        self.org = org.into();
        self.fid = fid.into();
        self
    }

    /// Host portion of the institution URL, shown to the operator as trust context.
    pub fn server_host(&self) -> String {
        let trimmed = self
            .url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        trimmed
            .split(|c| c == '/' || c == '?')
            .next()
            .unwrap_or(trimmed)
            .to_string()
    }
}

/// Online-account credential material for one institution.
///
/// Empty strings mean "not supplied". Nothing here is persisted until the round
/// that produced it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
    pub credential_1: String,
    pub credential_2: String,
    pub auth_token: String,
    pub access_key: String,
    pub client_uid: String,
    pub protocol_version: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_client_uid(mut self, client_uid: impl Into<String>) -> Self {
        self.client_uid = client_uid.into();
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: impl Into<String>) -> Self {
        self.protocol_version = protocol_version.into();
        self
    }
}

/// Server-advertised sign-on requirements, fetched fresh at the start of every
/// round. Never cached across rounds: institution policy can change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOnCapabilities {
    pub auth_token_required: bool,
    pub auth_token_label: Option<String>,
    pub auth_token_info_url: Option<String>,
    pub min_password_len: Option<usize>,
    pub max_password_len: Option<usize>,
    pub mfa_challenge_required: bool,
    pub credential_label_1: Option<String>,
    pub credential_label_2: Option<String>,
}

/// One server-issued multi-factor challenge question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub phrase_id: String,
    pub label: Option<String>,
}

impl MfaChallenge {
    pub fn new(phrase_id: impl Into<String>) -> Self {
        Self {
            phrase_id: phrase_id.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Operator answer to one multi-factor challenge question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallengeAnswer {
    pub phrase_id: String,
    pub answer: String,
}

impl MfaChallengeAnswer {
    pub fn new(phrase_id: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            phrase_id: phrase_id.into(),
            answer: answer.into(),
        }
    }
}

/// Institution profile returned by a successful profile fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub customer_service_phone: Option<String>,
    pub url: Option<String>,
    pub email: Option<String>,
}

/// Profile fetch result together with the saved wire diagnostic log, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFetch {
    pub profile: ProfileInfo,
    pub diagnostic_log: Option<PathBuf>,
}

/// Successful sign-on result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignOnResult {
    /// Access key issued after a satisfied MFA challenge; replayed on later
    /// sign-ons so the operator is not re-challenged every round.
    pub access_key: Option<String>,
}

/// Password change confirmation from the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PasswordChange {
    pub diagnostic_log: Option<PathBuf>,
}

/// Server-reported fault from any transport operation.
///
/// Carries the raw server code verbatim; classification into the closed
/// remediation taxonomy happens in `policy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: String,
    pub message: String,
    pub body: Option<String>,
    pub diagnostic_log: Option<PathBuf>,
    /// Challenge questions issued alongside an MFA-required fault.
    pub challenges: Vec<MfaChallenge>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Fault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            body: None,
            diagnostic_log: None,
            challenges: Vec::new(),
            occurred_at: Some(Utc::now()),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_diagnostic_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.diagnostic_log = Some(path.into());
        self
    }

    pub fn with_challenges(mut self, challenges: Vec<MfaChallenge>) -> Self {
        self.challenges = challenges;
        self
    }

    /// True when the raw body looks like an institution-served HTML error page.
    /// Such faults are rendered as rich content rather than plain text.
    pub fn has_html_body(&self) -> bool {
        let Some(body) = &self.body else {
            return false;
        };
        let lowered = body.to_ascii_lowercase();
        lowered.contains("<html") || lowered.contains("<!doctype html")
    }
}

/// Declared account type, shared between remote and local account records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Checking,
    Savings,
    MoneyMarket,
    CreditLine,
    CreditCard,
    Investment,
}

impl AccountType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Savings => "savings",
            Self::MoneyMarket => "money_market",
            Self::CreditLine => "credit_line",
            Self::CreditCard => "credit_card",
            Self::Investment => "investment",
        }
    }
}

/// Type-specific routing identity reported with a remote account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRouting {
    /// Deposit-style accounts are addressed by bank (and optionally branch) id.
    Deposit {
        bank_id: String,
        branch_id: Option<String>,
    },
    /// Investment accounts are addressed by broker id.
    Investment { broker_id: String },
    /// Card accounts carry no extra routing beyond the account id.
    Card,
}

/// One account reported by the institution in a discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub account_id: String,
    pub account_type: AccountType,
    pub routing: RemoteRouting,
}

impl RemoteAccount {
    pub fn deposit(
        account_id: impl Into<String>,
        account_type: AccountType,
        bank_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account_type,
            routing: RemoteRouting::Deposit {
                bank_id: bank_id.into(),
                branch_id: None,
            },
        }
    }

    pub fn investment(account_id: impl Into<String>, broker_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            account_type: AccountType::Investment,
            routing: RemoteRouting::Investment {
                broker_id: broker_id.into(),
            },
        }
    }

    pub fn card(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            account_type: AccountType::CreditCard,
            routing: RemoteRouting::Card,
        }
    }
}

/// Local account as exposed by the account store for discovery matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAccount {
    pub account_ref: String,
    pub name: String,
    pub account_type: AccountType,
    /// Primary account number.
    pub number: String,
    /// Institution-assigned alternate id, when the institution renumbered the
    /// account on its side.
    pub institution_assigned_id: Option<String>,
    /// Online link id when this account is already connected.
    pub online_link: Option<String>,
}

impl LocalAccount {
    pub fn new(
        account_ref: impl Into<String>,
        name: impl Into<String>,
        account_type: AccountType,
        number: impl Into<String>,
    ) -> Self {
        Self {
            account_ref: account_ref.into(),
            name: name.into(),
            account_type,
            number: number.into(),
            institution_assigned_id: None,
            online_link: None,
        }
    }

    pub fn with_institution_assigned_id(mut self, id: impl Into<String>) -> Self {
        self.institution_assigned_id = Some(id.into());
        self
    }

    pub fn with_online_link(mut self, link: impl Into<String>) -> Self {
        self.online_link = Some(link.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_host_strips_scheme_and_path() {
        let draft = InstitutionDraft::new("fi-1", "First Bank", "https://ofx.firstbank.example/ofx/v1");
        assert_eq!(draft.server_host(), "ofx.firstbank.example");

        let bare = InstitutionDraft::new("fi-2", "Other", "ofx.other.example");
        assert_eq!(bare.server_host(), "ofx.other.example");
    }

    #[test]
    fn html_body_detection_is_case_insensitive() {
        let plain = Fault::new("2000", "General error").with_body("service unavailable");
        assert!(!plain.has_html_body());

        let html = Fault::new("2000", "General error")
            .with_body("<!DOCTYPE HTML><html><body>maintenance window</body></html>");
        assert!(html.has_html_body());

        let no_body = Fault::new("2000", "General error");
        assert!(!no_body.has_html_body());
    }
}
