//! Scripted prompt, transport, and account-store fixtures for banklink.
//!
//! These adapters answer deterministically from pre-loaded scripts, so round
//! orchestration can be exercised end to end without a UI or a live
//! institution endpoint.

#![deny(unsafe_code)]

use async_trait::async_trait;
use banklink_core::{
    AccountType, AuthTokenPrompt, AuthTokenRequest, BankTransport, Credentials, CredentialInput,
    CredentialPrompt, CredentialRequest, Fault, InstitutionDraft, LinkError, LocalAccount,
    LocalAccountStore, MfaChallengeAnswer, MfaInput, MfaPrompt, MfaRequest, NewPasswordInput,
    NewPasswordPrompt, NewPasswordRequest, PasswordChange, ProfileFetch, ProfileInfo,
    PromptOutcome, PromptSurfaces, RemoteAccount, SignOnCapabilities, SignOnResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Queue of pre-loaded prompt outcomes. An exhausted queue answers `Cancelled`,
/// which ends the round neutrally instead of wedging a test.
struct ScriptQueue<T> {
    tag: &'static str,
    queue: Mutex<VecDeque<PromptOutcome<T>>>,
}

impl<T> ScriptQueue<T> {
    fn new(tag: &'static str) -> Self {
        Self {
            tag,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, outcome: PromptOutcome<T>) {
        self.queue.lock().unwrap().push_back(outcome);
    }

    fn next(&self) -> PromptOutcome<T> {
        match self.queue.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => {
                warn!(prompt = self.tag, "script exhausted, answering cancelled");
                PromptOutcome::Cancelled
            }
        }
    }
}

/// Scripted credential prompt surface.
pub struct ScriptedCredentialPrompt {
    script: ScriptQueue<CredentialInput>,
    requests: Mutex<Vec<CredentialRequest>>,
}

impl ScriptedCredentialPrompt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: ScriptQueue::new("credentials"),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: PromptOutcome<CredentialInput>) {
        self.script.push(outcome);
    }

    /// Requests the orchestrator made, in order, with their trust context.
    pub fn requests(&self) -> Vec<CredentialRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialPrompt for ScriptedCredentialPrompt {
    async fn request(&self, request: CredentialRequest) -> PromptOutcome<CredentialInput> {
        self.requests.lock().unwrap().push(request);
        self.script.next()
    }
}

/// Scripted auth-token prompt surface.
pub struct ScriptedAuthTokenPrompt {
    script: ScriptQueue<String>,
    requests: Mutex<Vec<AuthTokenRequest>>,
}

impl ScriptedAuthTokenPrompt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: ScriptQueue::new("auth_token"),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: PromptOutcome<String>) {
        self.script.push(outcome);
    }

    pub fn requests(&self) -> Vec<AuthTokenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthTokenPrompt for ScriptedAuthTokenPrompt {
    async fn request(&self, request: AuthTokenRequest) -> PromptOutcome<String> {
        self.requests.lock().unwrap().push(request);
        self.script.next()
    }
}

/// Scripted MFA prompt surface.
pub struct ScriptedMfaPrompt {
    script: ScriptQueue<MfaInput>,
    requests: Mutex<Vec<MfaRequest>>,
}

impl ScriptedMfaPrompt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: ScriptQueue::new("mfa"),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: PromptOutcome<MfaInput>) {
        self.script.push(outcome);
    }

    pub fn requests(&self) -> Vec<MfaRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl MfaPrompt for ScriptedMfaPrompt {
    async fn request(&self, request: MfaRequest) -> PromptOutcome<MfaInput> {
        self.requests.lock().unwrap().push(request);
        self.script.next()
    }
}

/// Scripted new-password prompt surface.
pub struct ScriptedNewPasswordPrompt {
    script: ScriptQueue<NewPasswordInput>,
    requests: Mutex<Vec<NewPasswordRequest>>,
}

impl ScriptedNewPasswordPrompt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: ScriptQueue::new("new_password"),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: PromptOutcome<NewPasswordInput>) {
        self.script.push(outcome);
    }

    pub fn push_entry(&self, password: &str, confirmation: &str) {
        self.push(PromptOutcome::Accepted(NewPasswordInput {
            password: password.to_string(),
            confirmation: confirmation.to_string(),
        }));
    }

    pub fn requests(&self) -> Vec<NewPasswordRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl NewPasswordPrompt for ScriptedNewPasswordPrompt {
    async fn request(&self, request: NewPasswordRequest) -> PromptOutcome<NewPasswordInput> {
        self.requests.lock().unwrap().push(request);
        self.script.next()
    }
}

/// The four scripted surfaces bundled for engine bootstrap.
pub struct ScriptedPromptSet {
    pub credentials: Arc<ScriptedCredentialPrompt>,
    pub auth_token: Arc<ScriptedAuthTokenPrompt>,
    pub mfa: Arc<ScriptedMfaPrompt>,
    pub new_password: Arc<ScriptedNewPasswordPrompt>,
}

impl ScriptedPromptSet {
    pub fn new() -> Self {
        Self {
            credentials: ScriptedCredentialPrompt::new(),
            auth_token: ScriptedAuthTokenPrompt::new(),
            mfa: ScriptedMfaPrompt::new(),
            new_password: ScriptedNewPasswordPrompt::new(),
        }
    }

    pub fn surfaces(&self) -> PromptSurfaces {
        PromptSurfaces {
            credentials: self.credentials.clone(),
            auth_token: self.auth_token.clone(),
            mfa: self.mfa.clone(),
            new_password: self.new_password.clone(),
        }
    }
}

impl Default for ScriptedPromptSet {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory local account store.
pub struct MemoryAccountStore {
    accounts: Mutex<Vec<LocalAccount>>,
    next_ref: AtomicUsize,
}

impl MemoryAccountStore {
    pub fn new(accounts: Vec<LocalAccount>) -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::new(accounts),
            next_ref: AtomicUsize::new(1),
        })
    }

    pub fn snapshot(&self) -> Vec<LocalAccount> {
        self.accounts.lock().unwrap().clone()
    }

    pub fn find(&self, account_ref: &str) -> Option<LocalAccount> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|account| account.account_ref == account_ref)
            .cloned()
    }
}

#[async_trait]
impl LocalAccountStore for MemoryAccountStore {
    async fn accounts(&self) -> Result<Vec<LocalAccount>, LinkError> {
        Ok(self.snapshot())
    }

    async fn create_and_link(
        &self,
        name: &str,
        account_type: AccountType,
        remote: &RemoteAccount,
        link_id: &str,
    ) -> Result<String, LinkError> {
        let account_ref = format!("acct-{}", self.next_ref.fetch_add(1, Ordering::SeqCst));
        let account = LocalAccount::new(&account_ref, name, account_type, &remote.account_id)
            .with_online_link(link_id);
        self.accounts.lock().unwrap().push(account);
        Ok(account_ref)
    }

    async fn link(
        &self,
        account_ref: &str,
        link_id: &str,
        corrected_type: Option<AccountType>,
    ) -> Result<(), LinkError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .iter_mut()
            .find(|account| account.account_ref == account_ref)
            .ok_or_else(|| {
                LinkError::account_store(format!("unknown account ref '{account_ref}'"))
            })?;
        account.online_link = Some(link_id.to_string());
        if let Some(account_type) = corrected_type {
            account.account_type = account_type;
        }
        Ok(())
    }

    async fn unlink(&self, account_ref: &str) -> Result<(), LinkError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .iter_mut()
            .find(|account| account.account_ref == account_ref)
            .ok_or_else(|| {
                LinkError::account_store(format!("unknown account ref '{account_ref}'"))
            })?;
        account.online_link = None;
        Ok(())
    }
}

/// Scriptable transport fixture.
///
/// Each operation pops the next result from its script; an empty script
/// answers success with the configured fixture data. Call counts and the last
/// submitted material are recorded for assertions.
pub struct ScriptedTransport {
    pub capabilities: Mutex<SignOnCapabilities>,
    pub profile: Mutex<ProfileInfo>,
    pub remote_accounts: Mutex<Vec<RemoteAccount>>,
    built_in_answers: Mutex<HashMap<String, String>>,
    sign_on_script: Mutex<VecDeque<Result<SignOnResult, Fault>>>,
    profile_script: Mutex<VecDeque<Result<ProfileFetch, Fault>>>,
    discover_script: Mutex<VecDeque<Result<Vec<RemoteAccount>, Fault>>>,
    change_password_script: Mutex<VecDeque<Result<PasswordChange, Fault>>>,
    pub sign_on_calls: AtomicUsize,
    pub discover_calls: AtomicUsize,
    pub change_password_calls: AtomicUsize,
    last_sign_on: Mutex<Option<(Credentials, Vec<MfaChallengeAnswer>)>>,
    last_password_change: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capabilities: Mutex::new(SignOnCapabilities::default()),
            profile: Mutex::new(ProfileInfo::default()),
            remote_accounts: Mutex::new(Vec::new()),
            built_in_answers: Mutex::new(HashMap::new()),
            sign_on_script: Mutex::new(VecDeque::new()),
            profile_script: Mutex::new(VecDeque::new()),
            discover_script: Mutex::new(VecDeque::new()),
            change_password_script: Mutex::new(VecDeque::new()),
            sign_on_calls: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            change_password_calls: AtomicUsize::new(0),
            last_sign_on: Mutex::new(None),
            last_password_change: Mutex::new(None),
        })
    }

    pub fn set_capabilities(&self, capabilities: SignOnCapabilities) {
        *self.capabilities.lock().unwrap() = capabilities;
    }

    pub fn set_remote_accounts(&self, accounts: Vec<RemoteAccount>) {
        *self.remote_accounts.lock().unwrap() = accounts;
    }

    pub fn set_built_in_answer(&self, phrase_id: &str, answer: &str) {
        self.built_in_answers
            .lock()
            .unwrap()
            .insert(phrase_id.to_string(), answer.to_string());
    }

    pub fn script_sign_on(&self, result: Result<SignOnResult, Fault>) {
        self.sign_on_script.lock().unwrap().push_back(result);
    }

    pub fn script_profile(&self, result: Result<ProfileFetch, Fault>) {
        self.profile_script.lock().unwrap().push_back(result);
    }

    pub fn script_discover(&self, result: Result<Vec<RemoteAccount>, Fault>) {
        self.discover_script.lock().unwrap().push_back(result);
    }

    pub fn script_change_password(&self, result: Result<PasswordChange, Fault>) {
        self.change_password_script.lock().unwrap().push_back(result);
    }

    /// Credentials and MFA answers from the most recent sign-on.
    pub fn last_sign_on(&self) -> Option<(Credentials, Vec<MfaChallengeAnswer>)> {
        self.last_sign_on.lock().unwrap().clone()
    }

    pub fn last_password_change(&self) -> Option<String> {
        self.last_password_change.lock().unwrap().clone()
    }
}

#[async_trait]
impl BankTransport for ScriptedTransport {
    async fn get_signon_capabilities(
        &self,
        _institution: &InstitutionDraft,
    ) -> Result<SignOnCapabilities, Fault> {
        Ok(self.capabilities.lock().unwrap().clone())
    }

    async fn get_profile(&self, _institution: &InstitutionDraft) -> Result<ProfileFetch, Fault> {
        match self.profile_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(ProfileFetch {
                profile: self.profile.lock().unwrap().clone(),
                diagnostic_log: None,
            }),
        }
    }

    async fn sign_on(
        &self,
        _institution: &InstitutionDraft,
        credentials: &Credentials,
        mfa_answers: &[MfaChallengeAnswer],
    ) -> Result<SignOnResult, Fault> {
        self.sign_on_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sign_on.lock().unwrap() = Some((credentials.clone(), mfa_answers.to_vec()));
        match self.sign_on_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(SignOnResult::default()),
        }
    }

    async fn discover_accounts(
        &self,
        _institution: &InstitutionDraft,
        _credentials: &Credentials,
        _mfa_answers: &[MfaChallengeAnswer],
    ) -> Result<Vec<RemoteAccount>, Fault> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        match self.discover_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.remote_accounts.lock().unwrap().clone()),
        }
    }

    async fn change_password(
        &self,
        _institution: &InstitutionDraft,
        _credentials: &Credentials,
        new_password: &str,
    ) -> Result<PasswordChange, Fault> {
        self.change_password_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_password_change.lock().unwrap() = Some(new_password.to_string());
        match self.change_password_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(PasswordChange::default()),
        }
    }

    fn built_in_mfa_answer(&self, phrase_id: &str) -> Option<String> {
        self.built_in_answers.lock().unwrap().get(phrase_id).cloned()
    }
}
