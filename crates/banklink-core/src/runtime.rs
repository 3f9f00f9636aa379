use crate::directory::{DirectoryStorageConfig, InstitutionDirectory, InstitutionRecord};
use crate::discovery::{
    self, CommitReport, LocalAccountStore, ReconciliationEntry,
};
use crate::error::LinkError;
use crate::policy::{self, RemediationStep};
use crate::prompts::{PromptOutcome, PromptSurfaces};
use crate::resolvers::{
    AuthTokenResolver, CredentialResolver, MfaChallengeResolver, NewPasswordResolver,
};
use crate::round::{RoundKind, RoundPhase, RoundSnapshot, RoundToken, RoundTracker};
use crate::transport::BankTransport;
use crate::types::{
    Credentials, Fault, InstitutionDraft, MfaChallengeAnswer, ProfileInfo, SignOnCapabilities,
};
use crate::vault::CredentialVault;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Link engine configuration.
#[derive(Debug, Clone, Default)]
pub struct LinkEngineConfig {
    pub directory_storage: DirectoryStorageConfig,
}

/// Terminal outcome of one orchestration round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// The round succeeded; reconciliation entries are available.
    Discovered { entries: usize },
    /// Fatal fault, surfaced verbatim. Entered credentials are kept.
    Failed { fault: Fault },
    /// The operator cancelled a prompt or closed the dialog.
    Cancelled,
    /// A newer round superseded this one; nothing was applied.
    Superseded,
}

impl RoundStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "discovered",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
        }
    }
}

/// Report returned to the caller of `start_verify` / `start_signup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    pub kind: RoundKind,
    pub status: RoundStatus,
}

/// Reconciliation context retained from the last round that reached discovery.
#[derive(Debug, Clone)]
struct DiscoveredRound {
    institution: InstitutionDraft,
    entries: Vec<ReconciliationEntry>,
}

/// What a remediation attempt decided about the faulted step.
enum RemediationOutcome {
    /// New material accepted; resubmit the same logical request once.
    Resubmit,
    Cancelled,
    Fatal(Fault),
    Superseded,
}

/// Bank-link orchestrator.
///
/// Sequences profile fetch, sign-on, and account discovery against the
/// transport, invoking a challenge resolver whenever the server demands more
/// proof of identity. Every network-bound step carries a round token; a
/// completion whose token is no longer current is discarded without touching
/// vault, directory, or UI-visible state.
pub struct LinkEngine {
    transport: Arc<dyn BankTransport>,
    prompts: PromptSurfaces,
    accounts: Arc<dyn LocalAccountStore>,
    directory: RwLock<InstitutionDirectory>,
    vault: RwLock<CredentialVault>,
    tracker: RoundTracker,
    discovered: RwLock<Option<DiscoveredRound>>,
    updates: watch::Sender<RoundSnapshot>,
    dialog_id: Uuid,
}

impl LinkEngine {
    pub async fn bootstrap(
        transport: Arc<dyn BankTransport>,
        prompts: PromptSurfaces,
        accounts: Arc<dyn LocalAccountStore>,
        config: LinkEngineConfig,
    ) -> Result<Self, LinkError> {
        let directory = InstitutionDirectory::bootstrap(config.directory_storage).await?;
        let (updates, _) = watch::channel(RoundSnapshot::idle());
        let dialog_id = Uuid::new_v4();
        info!(%dialog_id, directory = directory.backend_label(), "link engine ready");

        Ok(Self {
            transport,
            prompts,
            accounts,
            directory: RwLock::new(directory),
            vault: RwLock::new(CredentialVault::default()),
            tracker: RoundTracker::new(),
            discovered: RwLock::new(None),
            updates,
            dialog_id,
        })
    }

    pub fn dialog_id(&self) -> Uuid {
        self.dialog_id
    }

    /// Subscribe to round snapshots. The engine publishes one on every phase
    /// transition of the current round.
    pub fn subscribe(&self) -> watch::Receiver<RoundSnapshot> {
        self.updates.subscribe()
    }

    pub async fn credentials(&self) -> Credentials {
        self.vault.read().await.committed().clone()
    }

    pub async fn credentials_draft(&self) -> Credentials {
        self.vault.read().await.draft()
    }

    pub async fn set_credentials_draft(&self, credentials: Credentials) {
        *self.vault.write().await.draft_mut() = credentials;
    }

    /// Replace the credential draft; `None` clears every field.
    pub async fn reset_credentials(&self, source: Option<&Credentials>) {
        self.vault.write().await.reset(source);
    }

    /// Filtered view of the institution directory.
    pub async fn institutions(&self, filter: &str) -> Vec<InstitutionRecord> {
        self.directory.read().await.filter(filter)
    }

    pub async fn institution(&self, institution_id: &str) -> Option<InstitutionRecord> {
        self.directory.read().await.find(institution_id).cloned()
    }

    /// Verify the draft credentials against the institution.
    pub async fn start_verify(&self, institution: InstitutionDraft) -> RoundReport {
        self.run_round(RoundKind::Verify, institution).await
    }

    /// Sign up: verify credentials and discover the remote account list.
    pub async fn start_signup(&self, institution: InstitutionDraft) -> RoundReport {
        self.run_round(RoundKind::Signup, institution).await
    }

    /// Cooperatively cancel the current round. In-flight transport calls and
    /// open prompts are not aborted; their eventual completions are discarded.
    pub fn cancel_current_round(&self) {
        info!(dialog_id = %self.dialog_id, "round cancelled by operator");
        self.tracker.request_cancel();
        self.updates.send_replace(RoundSnapshot {
            token: RoundToken::NONE,
            kind: None,
            phase: RoundPhase::Cancelled,
            detail: Some("User cancelled".to_string()),
        });
    }

    /// Reconciliation entries of the last round that reached `Discovered`.
    pub async fn reconciliation_entries(&self) -> Result<Vec<ReconciliationEntry>, LinkError> {
        self.discovered
            .read()
            .await
            .as_ref()
            .map(|round| round.entries.clone())
            .ok_or_else(|| {
                LinkError::NoDiscovery("no round has reached account discovery".to_string())
            })
    }

    /// Apply operator reconciliation decisions in one pass. Failing entries
    /// are collected into the report, never raised mid-pass.
    pub async fn commit_reconciliation(
        &self,
        entries: &[ReconciliationEntry],
    ) -> Result<CommitReport, LinkError> {
        let institution = self
            .discovered
            .read()
            .await
            .as_ref()
            .map(|round| round.institution.clone())
            .ok_or_else(|| {
                LinkError::NoDiscovery("commit requested before account discovery".to_string())
            })?;

        let report =
            discovery::commit_reconciliation(self.accounts.as_ref(), &institution, entries).await;
        info!(
            created = report.created.len(),
            linked = report.linked,
            unlinked = report.unlinked,
            failures = report.failures.len(),
            "reconciliation committed"
        );
        Ok(report)
    }

    async fn run_round(&self, kind: RoundKind, institution: InstitutionDraft) -> RoundReport {
        info!(
            dialog_id = %self.dialog_id,
            kind = kind.name(),
            institution = %institution.institution_id,
            "round started"
        );
        let mut credentials = self.vault.read().await.draft();
        let mut pending_mfa: Vec<MfaChallengeAnswer> = Vec::new();

        'round: loop {
            // Capabilities are fetched fresh every round; institution policy
            // can change between rounds.
            let token = self.tracker.issue();
            self.publish(token, kind, RoundPhase::FetchingProfile, Some("sign-on capabilities".to_string()));
            let capabilities: SignOnCapabilities;
            let outcome = self.transport.get_signon_capabilities(&institution).await;
            if !self.tracker.is_current(token) {
                return self.stale_report(kind);
            }
            match outcome {
                Ok(caps) => capabilities = caps,
                Err(fault) => {
                    // No capability block yet; remediate against defaults.
                    match self
                        .remediate(
                            token,
                            &institution,
                            &fault,
                            &SignOnCapabilities::default(),
                            &mut credentials,
                            &mut pending_mfa,
                        )
                        .await
                    {
                        RemediationOutcome::Resubmit => continue 'round,
                        RemediationOutcome::Cancelled => {
                            return self.finish_cancelled(token, kind).await
                        }
                        RemediationOutcome::Fatal(fault) => {
                            return self.finish_failed(token, kind, credentials, fault).await
                        }
                        RemediationOutcome::Superseded => return self.stale_report(kind),
                    }
                }
            }

            let token = self.tracker.issue();
            self.publish(token, kind, RoundPhase::FetchingProfile, Some("institution profile".to_string()));
            let outcome = self.transport.get_profile(&institution).await;
            if !self.tracker.is_current(token) {
                return self.stale_report(kind);
            }
            let profile: ProfileInfo = match outcome {
                Ok(fetch) => fetch.profile,
                Err(fault) => {
                    // A fault here remediates and restarts from the profile
                    // fetch itself, not from sign-on.
                    match self
                        .remediate(
                            token,
                            &institution,
                            &fault,
                            &capabilities,
                            &mut credentials,
                            &mut pending_mfa,
                        )
                        .await
                    {
                        RemediationOutcome::Resubmit => continue 'round,
                        RemediationOutcome::Cancelled => {
                            return self.finish_cancelled(token, kind).await
                        }
                        RemediationOutcome::Fatal(fault) => {
                            return self.finish_failed(token, kind, credentials, fault).await
                        }
                        RemediationOutcome::Superseded => return self.stale_report(kind),
                    }
                }
            };

            // First-contact signup prompts for a required auth token up front
            // instead of waiting for the guaranteed fault. Verify remediates
            // reactively.
            if kind == RoundKind::Signup
                && policy::preemptive_step(&capabilities, &credentials).is_some()
            {
                let token = self.tracker.issue();
                let outcome = AuthTokenResolver::new(self.prompts.auth_token.clone())
                    .resolve(&capabilities)
                    .await;
                if !self.tracker.is_current(token) {
                    return self.stale_report(kind);
                }
                match outcome {
                    PromptOutcome::Accepted(auth_token) => {
                        credentials.auth_token = auth_token;
                        credentials.access_key.clear();
                    }
                    PromptOutcome::Cancelled => return self.finish_cancelled(token, kind).await,
                }
            }

            // Sign on, resubmitting the same request after each accepted
            // remediation.
            loop {
                let token = self.tracker.issue();
                self.publish(token, kind, RoundPhase::SigningOn, None);
                let outcome = self
                    .transport
                    .sign_on(&institution, &credentials, &pending_mfa)
                    .await;
                if !self.tracker.is_current(token) {
                    return self.stale_report(kind);
                }
                match outcome {
                    Ok(result) => {
                        if let Some(access_key) = result.access_key {
                            credentials.access_key = access_key;
                        }
                        pending_mfa.clear();
                        break;
                    }
                    Err(fault) => {
                        match self
                            .remediate(
                                token,
                                &institution,
                                &fault,
                                &capabilities,
                                &mut credentials,
                                &mut pending_mfa,
                            )
                            .await
                        {
                            RemediationOutcome::Resubmit => continue,
                            RemediationOutcome::Cancelled => {
                                return self.finish_cancelled(token, kind).await
                            }
                            RemediationOutcome::Fatal(fault) => {
                                return self.finish_failed(token, kind, credentials, fault).await
                            }
                            RemediationOutcome::Superseded => return self.stale_report(kind),
                        }
                    }
                }
            }

            // Account discovery (signup only); verify succeeds with an empty
            // reconciliation list.
            let entries = if kind == RoundKind::Signup {
                loop {
                    let token = self.tracker.issue();
                    self.publish(token, kind, RoundPhase::Discovering, None);
                    let outcome = self
                        .transport
                        .discover_accounts(&institution, &credentials, &pending_mfa)
                        .await;
                    if !self.tracker.is_current(token) {
                        return self.stale_report(kind);
                    }
                    match outcome {
                        Ok(remote_accounts) => {
                            let local_accounts = match self.accounts.accounts().await {
                                Ok(accounts) => accounts,
                                Err(err) => {
                                    let fault =
                                        Fault::new("client", format!("account store: {err}"));
                                    return self
                                        .finish_failed(token, kind, credentials, fault)
                                        .await;
                                }
                            };
                            break discovery::match_accounts(
                                &remote_accounts,
                                &local_accounts,
                                &institution.institution_id,
                            );
                        }
                        Err(fault) => {
                            match self
                                .remediate(
                                    token,
                                    &institution,
                                    &fault,
                                    &capabilities,
                                    &mut credentials,
                                    &mut pending_mfa,
                                )
                                .await
                            {
                                RemediationOutcome::Resubmit => continue,
                                RemediationOutcome::Cancelled => {
                                    return self.finish_cancelled(token, kind).await
                                }
                                RemediationOutcome::Fatal(fault) => {
                                    return self
                                        .finish_failed(token, kind, credentials, fault)
                                        .await
                                }
                                RemediationOutcome::Superseded => {
                                    return self.stale_report(kind)
                                }
                            }
                        }
                    }
                }
            } else {
                Vec::new()
            };

            let token = self.tracker.issue();
            return self
                .finish_discovered(token, kind, institution, profile, credentials, entries)
                .await;
        }
    }

    /// Classify a fault and run the matching resolver. Remediable faults never
    /// escape this function; anything else comes back `Fatal` for verbatim
    /// presentation.
    async fn remediate(
        &self,
        token: RoundToken,
        institution: &InstitutionDraft,
        fault: &Fault,
        capabilities: &SignOnCapabilities,
        credentials: &mut Credentials,
        pending_mfa: &mut Vec<MfaChallengeAnswer>,
    ) -> RemediationOutcome {
        let code = policy::classify(fault);
        let step = policy::remediation_for(&code, capabilities, credentials);
        info!(
            code = code.name(),
            raw = %fault.code,
            step = step.name(),
            "server fault classified"
        );

        match step {
            RemediationStep::None => RemediationOutcome::Fatal(fault.clone()),
            RemediationStep::PromptCredentials => {
                let outcome = CredentialResolver::new(self.prompts.credentials.clone())
                    .resolve(institution, capabilities, credentials)
                    .await;
                if !self.tracker.is_current(token) {
                    return RemediationOutcome::Superseded;
                }
                match outcome {
                    PromptOutcome::Accepted(input) => {
                        credentials.user_id = input.user_id;
                        credentials.password = input.password;
                        credentials.credential_1 = input.credential_1;
                        credentials.credential_2 = input.credential_2;
                        RemediationOutcome::Resubmit
                    }
                    PromptOutcome::Cancelled => RemediationOutcome::Cancelled,
                }
            }
            RemediationStep::PromptAuthToken => {
                let outcome = AuthTokenResolver::new(self.prompts.auth_token.clone())
                    .resolve(capabilities)
                    .await;
                if !self.tracker.is_current(token) {
                    return RemediationOutcome::Superseded;
                }
                match outcome {
                    PromptOutcome::Accepted(auth_token) => {
                        credentials.auth_token = auth_token;
                        // Any cached access key was minted for the old token.
                        credentials.access_key.clear();
                        RemediationOutcome::Resubmit
                    }
                    PromptOutcome::Cancelled => RemediationOutcome::Cancelled,
                }
            }
            RemediationStep::PromptMfaChallenge => {
                let challenge = self.tracker.issue_challenge();
                let outcome = MfaChallengeResolver::new(self.prompts.mfa.clone())
                    .resolve(self.transport.as_ref(), &fault.challenges)
                    .await;
                // A newer challenge supersedes this one's answers outright.
                if !self.tracker.is_current_challenge(challenge)
                    || !self.tracker.is_current(token)
                {
                    return RemediationOutcome::Superseded;
                }
                self.tracker.retire_challenge(challenge);
                match outcome {
                    Ok(PromptOutcome::Accepted(answers)) => {
                        *pending_mfa = answers;
                        RemediationOutcome::Resubmit
                    }
                    Ok(PromptOutcome::Cancelled) => RemediationOutcome::Cancelled,
                    Err(err) => {
                        // Contract violation from the prompt surface: present
                        // it like any other fatal fault instead of crashing
                        // the round.
                        warn!(error = %err, "mfa prompt violated the answer contract");
                        RemediationOutcome::Fatal(Fault::new("client", err.to_string()))
                    }
                }
            }
            RemediationStep::PromptNewPassword => {
                let outcome = NewPasswordResolver::new(self.prompts.new_password.clone())
                    .resolve(self.transport.as_ref(), institution, credentials, capabilities)
                    .await;
                if !self.tracker.is_current(token) {
                    return RemediationOutcome::Superseded;
                }
                match outcome {
                    Ok(PromptOutcome::Accepted(new_password)) => {
                        credentials.password = new_password;
                        RemediationOutcome::Resubmit
                    }
                    Ok(PromptOutcome::Cancelled) => RemediationOutcome::Cancelled,
                    Err(change_fault) => RemediationOutcome::Fatal(change_fault),
                }
            }
        }
    }

    async fn finish_discovered(
        &self,
        token: RoundToken,
        kind: RoundKind,
        institution: InstitutionDraft,
        profile: ProfileInfo,
        credentials: Credentials,
        entries: Vec<ReconciliationEntry>,
    ) -> RoundReport {
        if !self.tracker.is_current(token) {
            return self.stale_report(kind);
        }

        // Success is the only point where the draft becomes the committed
        // record.
        self.vault.write().await.commit(credentials);

        // One full-list directory write per successful round. A persist
        // failure does not demote the round; the link itself succeeded.
        if let Err(err) = self
            .directory
            .write()
            .await
            .record_successful_round(&institution, &profile)
            .await
        {
            warn!(error = %err, "institution directory write-back failed");
        }

        let count = entries.len();
        *self.discovered.write().await = Some(DiscoveredRound {
            institution,
            entries,
        });

        self.publish(
            token,
            kind,
            RoundPhase::Discovered,
            Some(format!("{count} remote accounts")),
        );
        self.tracker.retire(token);
        info!(kind = kind.name(), accounts = count, "round discovered");
        RoundReport {
            kind,
            status: RoundStatus::Discovered { entries: count },
        }
    }

    async fn finish_failed(
        &self,
        token: RoundToken,
        kind: RoundKind,
        credentials: Credentials,
        fault: Fault,
    ) -> RoundReport {
        if !self.tracker.is_current(token) {
            return self.stale_report(kind);
        }

        // Keep everything the operator entered (including accepted remediation
        // material) in the draft so a manual retry needs no retyping. The
        // committed record stays untouched.
        self.vault.write().await.reset(Some(&credentials));

        warn!(
            kind = kind.name(),
            code = %fault.code,
            html = fault.has_html_body(),
            diagnostic_log = ?fault.diagnostic_log,
            "round failed"
        );
        self.publish(token, kind, RoundPhase::Failed, Some(fault.message.clone()));
        self.tracker.retire(token);
        RoundReport {
            kind,
            status: RoundStatus::Failed { fault },
        }
    }

    async fn finish_cancelled(&self, token: RoundToken, kind: RoundKind) -> RoundReport {
        if self.tracker.is_current(token) {
            self.publish(token, kind, RoundPhase::Cancelled, Some("User cancelled".to_string()));
            self.tracker.retire(token);
        } else {
            // Dialog-close cancellation already published its own snapshot.
            let _ = self.tracker.take_cancel_request();
        }
        info!(kind = kind.name(), "round cancelled");
        RoundReport {
            kind,
            status: RoundStatus::Cancelled,
        }
    }

    /// Terminal report for a completion that lost the current-token race.
    fn stale_report(&self, kind: RoundKind) -> RoundReport {
        if self.tracker.take_cancel_request() {
            info!(kind = kind.name(), "round cancelled while suspended");
            return RoundReport {
                kind,
                status: RoundStatus::Cancelled,
            };
        }
        debug!(kind = kind.name(), "stale round completion discarded");
        RoundReport {
            kind,
            status: RoundStatus::Superseded,
        }
    }

    fn publish(&self, token: RoundToken, kind: RoundKind, phase: RoundPhase, detail: Option<String>) {
        if !self.tracker.is_current(token) {
            return;
        }
        debug!(token = %token, phase = phase.name(), "round phase");
        self.updates.send_replace(RoundSnapshot {
            token,
            kind: Some(kind),
            phase,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{
        AuthTokenPrompt, AuthTokenRequest, CredentialInput, CredentialPrompt, CredentialRequest,
        MfaInput, MfaPrompt, MfaRequest, NewPasswordInput, NewPasswordPrompt, NewPasswordRequest,
    };
    use crate::types::{
        AccountType, LocalAccount, MfaChallenge, PasswordChange, ProfileFetch, RemoteAccount,
        SignOnResult,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    struct Scripted<T> {
        tag: &'static str,
        events: Events,
        queue: Mutex<VecDeque<PromptOutcome<T>>>,
    }

    impl<T> Scripted<T> {
        fn new(tag: &'static str, events: Events, responses: Vec<PromptOutcome<T>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                events,
                queue: Mutex::new(responses.into()),
            })
        }

        fn next(&self) -> PromptOutcome<T> {
            record(&self.events, format!("prompt:{}", self.tag));
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PromptOutcome::Cancelled)
        }
    }

    #[async_trait]
    impl CredentialPrompt for Scripted<CredentialInput> {
        async fn request(&self, _request: CredentialRequest) -> PromptOutcome<CredentialInput> {
            self.next()
        }
    }

    #[async_trait]
    impl AuthTokenPrompt for Scripted<String> {
        async fn request(&self, _request: AuthTokenRequest) -> PromptOutcome<String> {
            self.next()
        }
    }

    #[async_trait]
    impl MfaPrompt for Scripted<MfaInput> {
        async fn request(&self, _request: MfaRequest) -> PromptOutcome<MfaInput> {
            self.next()
        }
    }

    #[async_trait]
    impl NewPasswordPrompt for Scripted<NewPasswordInput> {
        async fn request(&self, _request: NewPasswordRequest) -> PromptOutcome<NewPasswordInput> {
            self.next()
        }
    }

    struct SurfaceScripts {
        credentials: Vec<PromptOutcome<CredentialInput>>,
        auth_token: Vec<PromptOutcome<String>>,
        mfa: Vec<PromptOutcome<MfaInput>>,
        new_password: Vec<PromptOutcome<NewPasswordInput>>,
    }

    impl Default for SurfaceScripts {
        fn default() -> Self {
            Self {
                credentials: Vec::new(),
                auth_token: Vec::new(),
                mfa: Vec::new(),
                new_password: Vec::new(),
            }
        }
    }

    fn surfaces(events: &Events, scripts: SurfaceScripts) -> PromptSurfaces {
        PromptSurfaces {
            credentials: Scripted::new("credentials", events.clone(), scripts.credentials),
            auth_token: Scripted::new("auth_token", events.clone(), scripts.auth_token),
            mfa: Scripted::new("mfa", events.clone(), scripts.mfa),
            new_password: Scripted::new("new_password", events.clone(), scripts.new_password),
        }
    }

    /// Transport fixture: scriptable sign-on results, plus an optional gate
    /// that parks the first sign-on call until released.
    struct TestTransport {
        events: Events,
        capabilities: SignOnCapabilities,
        remote_accounts: Vec<RemoteAccount>,
        sign_on_script: Mutex<VecDeque<Result<SignOnResult, Fault>>>,
        sign_on_calls: AtomicUsize,
        last_sign_on: Mutex<Option<(Credentials, Vec<MfaChallengeAnswer>)>>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl TestTransport {
        fn new(events: Events) -> Self {
            Self {
                events,
                capabilities: SignOnCapabilities::default(),
                remote_accounts: vec![RemoteAccount::deposit(
                    "12345",
                    AccountType::Checking,
                    "111000025",
                )],
                sign_on_script: Mutex::new(VecDeque::new()),
                sign_on_calls: AtomicUsize::new(0),
                last_sign_on: Mutex::new(None),
                gate: None,
            }
        }

        fn script_sign_on(&self, results: Vec<Result<SignOnResult, Fault>>) {
            *self.sign_on_script.lock().unwrap() = results.into();
        }
    }

    #[async_trait]
    impl BankTransport for TestTransport {
        async fn get_signon_capabilities(
            &self,
            _institution: &InstitutionDraft,
        ) -> Result<SignOnCapabilities, Fault> {
            record(&self.events, "transport:capabilities");
            Ok(self.capabilities.clone())
        }

        async fn get_profile(
            &self,
            _institution: &InstitutionDraft,
        ) -> Result<ProfileFetch, Fault> {
            record(&self.events, "transport:profile");
            Ok(ProfileFetch::default())
        }

        async fn sign_on(
            &self,
            _institution: &InstitutionDraft,
            credentials: &Credentials,
            mfa_answers: &[MfaChallengeAnswer],
        ) -> Result<SignOnResult, Fault> {
            let call = self.sign_on_calls.fetch_add(1, Ordering::SeqCst);
            record(&self.events, "transport:sign_on");
            *self.last_sign_on.lock().unwrap() =
                Some((credentials.clone(), mfa_answers.to_vec()));

            if call == 0 {
                if let Some((entered, release)) = &self.gate {
                    entered.notify_one();
                    release.notified().await;
                }
            }

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
            record(&self.events, "transport:discover");
            Ok(self.remote_accounts.clone())
        }

        async fn change_password(
            &self,
            _institution: &InstitutionDraft,
            _credentials: &Credentials,
            _new_password: &str,
        ) -> Result<PasswordChange, Fault> {
            record(&self.events, "transport:change_password");
            Ok(PasswordChange::default())
        }
    }

    struct TestStore {
        accounts: Vec<LocalAccount>,
    }

    #[async_trait]
    impl LocalAccountStore for TestStore {
        async fn accounts(&self) -> Result<Vec<LocalAccount>, LinkError> {
            Ok(self.accounts.clone())
        }

        async fn create_and_link(
            &self,
            _name: &str,
            _account_type: AccountType,
            _remote: &RemoteAccount,
            _link_id: &str,
        ) -> Result<String, LinkError> {
            Ok("acct-new".to_string())
        }

        async fn link(
            &self,
            _account_ref: &str,
            _link_id: &str,
            _corrected_type: Option<AccountType>,
        ) -> Result<(), LinkError> {
            Ok(())
        }

        async fn unlink(&self, _account_ref: &str) -> Result<(), LinkError> {
            Ok(())
        }
    }

    fn institution() -> InstitutionDraft {
        InstitutionDraft::new("fi-1", "First Bank", "https://ofx.fbank.example")
    }

    async fn engine_with(
        transport: Arc<TestTransport>,
        prompts: PromptSurfaces,
    ) -> Arc<LinkEngine> {
        Arc::new(
            LinkEngine::bootstrap(
                transport,
                prompts,
                Arc::new(TestStore { accounts: Vec::new() }),
                LinkEngineConfig::default(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn signup_round_reaches_discovered_and_commits_the_vault() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        let engine = engine_with(transport, surfaces(&events, SurfaceScripts::default())).await;

        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_signup(institution()).await;

        assert_eq!(report.status, RoundStatus::Discovered { entries: 1 });
        assert_eq!(engine.credentials().await.user_id, "alice");
        assert_eq!(engine.reconciliation_entries().await.unwrap().len(), 1);
        assert_eq!(engine.subscribe().borrow().phase, RoundPhase::Discovered);
    }

    #[tokio::test]
    async fn verify_round_succeeds_without_discovery_or_preemptive_prompt() {
        let events: Events = Events::default();
        let mut transport = TestTransport::new(events.clone());
        // Token advertised as required: the verify path still must not prompt
        // up front.
        transport.capabilities.auth_token_required = true;
        let transport = Arc::new(transport);
        let engine =
            engine_with(transport.clone(), surfaces(&events, SurfaceScripts::default())).await;

        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_verify(institution()).await;

        assert_eq!(report.status, RoundStatus::Discovered { entries: 0 });
        let seen = events.lock().unwrap();
        assert!(!seen.iter().any(|e| e == "prompt:auth_token"));
        assert!(!seen.iter().any(|e| e == "transport:discover"));
    }

    #[tokio::test]
    async fn signup_prompts_for_required_token_before_any_sign_on() {
        let events: Events = Events::default();
        let mut transport = TestTransport::new(events.clone());
        transport.capabilities.auth_token_required = true;
        let transport = Arc::new(transport);

        let scripts = SurfaceScripts {
            auth_token: vec![PromptOutcome::Accepted("123456".to_string())],
            ..SurfaceScripts::default()
        };
        let engine = engine_with(transport.clone(), surfaces(&events, scripts)).await;

        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_signup(institution()).await;
        assert!(matches!(report.status, RoundStatus::Discovered { .. }));

        let seen = events.lock().unwrap();
        let prompt_at = seen.iter().position(|e| e == "prompt:auth_token").unwrap();
        let sign_on_at = seen.iter().position(|e| e == "transport:sign_on").unwrap();
        assert!(prompt_at < sign_on_at);

        let (credentials, _) = transport.last_sign_on.lock().unwrap().clone().unwrap();
        assert_eq!(credentials.auth_token, "123456");
    }

    #[tokio::test]
    async fn signon_invalid_reprompts_credentials_and_resubmits_once() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        transport.script_sign_on(vec![
            Err(Fault::new("15500", "invalid signon")),
            Ok(SignOnResult::default()),
        ]);

        let corrected = CredentialInput {
            user_id: "alice".to_string(),
            password: "pw2".to_string(),
            credential_1: String::new(),
            credential_2: String::new(),
        };
        let scripts = SurfaceScripts {
            credentials: vec![PromptOutcome::Accepted(corrected)],
            ..SurfaceScripts::default()
        };
        let engine = engine_with(transport.clone(), surfaces(&events, scripts)).await;

        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_signup(institution()).await;

        assert!(matches!(report.status, RoundStatus::Discovered { .. }));
        assert_eq!(transport.sign_on_calls.load(Ordering::SeqCst), 2);
        // The accepted remediation material is what got committed.
        assert_eq!(engine.credentials().await.password, "pw2");
    }

    #[tokio::test]
    async fn fatal_fault_fails_the_round_and_keeps_the_draft() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        transport.script_sign_on(vec![Err(Fault::new("2000", "maintenance window")
            .with_body("<html><body>down for maintenance</body></html>"))]);

        let engine =
            engine_with(transport.clone(), surfaces(&events, SurfaceScripts::default())).await;
        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_signup(institution()).await;

        match report.status {
            RoundStatus::Failed { fault } => {
                assert_eq!(fault.code, "2000");
                assert!(fault.has_html_body());
            }
            other => panic!("expected failed round, got {other:?}"),
        }
        // Entered credentials survive the failure so the operator can retry
        // without retyping; nothing was committed.
        assert_eq!(engine.credentials_draft().await.password, "pw1");
        assert_eq!(engine.credentials().await, Credentials::default());
        assert_eq!(engine.subscribe().borrow().phase, RoundPhase::Failed);
    }

    #[tokio::test]
    async fn stale_completion_is_discarded_without_observable_state_change() {
        let events: Events = Events::default();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut transport = TestTransport::new(events.clone());
        transport.gate = Some((entered.clone(), release.clone()));
        let transport = Arc::new(transport);

        let engine =
            engine_with(transport.clone(), surfaces(&events, SurfaceScripts::default())).await;
        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;

        // Round A parks inside its sign-on call.
        let round_a = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_signup(institution()).await })
        };
        entered.notified().await;

        // Round B supersedes A and runs to completion.
        let report_b = engine.start_signup(institution()).await;
        assert_eq!(report_b.status, RoundStatus::Discovered { entries: 1 });
        let snapshot_after_b = engine.subscribe().borrow().clone();

        // A's sign-on finally returns; its completion must change nothing.
        release.notify_one();
        let report_a = round_a.await.unwrap();
        assert_eq!(report_a.status, RoundStatus::Superseded);

        assert_eq!(engine.subscribe().borrow().clone(), snapshot_after_b);
        assert_eq!(engine.reconciliation_entries().await.unwrap().len(), 1);
        assert_eq!(transport.sign_on_calls.load(Ordering::SeqCst), 2);
    }

    /// Gated MFA prompt: parks until released so the dialog can close first.
    struct GatedMfa {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MfaPrompt for GatedMfa {
        async fn request(&self, _request: MfaRequest) -> PromptOutcome<MfaInput> {
            self.entered.notify_one();
            self.release.notified().await;
            PromptOutcome::Accepted(vec![MfaChallengeAnswer::new("Q1", "blue")])
        }
    }

    #[tokio::test]
    async fn closing_the_dialog_mid_mfa_cancels_without_resubmission() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        transport.script_sign_on(vec![Err(Fault::new("15510", "challenge issued")
            .with_challenges(vec![MfaChallenge::new("Q1")]))]);

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut prompts = surfaces(&events, SurfaceScripts::default());
        prompts.mfa = Arc::new(GatedMfa {
            entered: entered.clone(),
            release: release.clone(),
        });

        let engine = engine_with(transport.clone(), prompts).await;
        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;

        let round = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start_signup(institution()).await })
        };
        entered.notified().await;

        // Dialog closes while the MFA prompt is open.
        engine.cancel_current_round();
        release.notify_one();

        let report = round.await.unwrap();
        assert_eq!(report.status, RoundStatus::Cancelled);
        // No resubmission happened and the draft is untouched.
        assert_eq!(transport.sign_on_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.credentials_draft().await.password, "pw1");
        assert_eq!(engine.subscribe().borrow().phase, RoundPhase::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_credential_prompt_ends_the_round_neutrally() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        transport.script_sign_on(vec![Err(Fault::new("15500", "invalid signon"))]);

        // Empty credential script: the prompt answers Cancelled.
        let engine =
            engine_with(transport.clone(), surfaces(&events, SurfaceScripts::default())).await;
        engine
            .set_credentials_draft(Credentials::new("alice", "pw1"))
            .await;
        let report = engine.start_signup(institution()).await;

        assert_eq!(report.status, RoundStatus::Cancelled);
        assert_eq!(transport.sign_on_calls.load(Ordering::SeqCst), 1);
        let snapshot = engine.subscribe().borrow().clone();
        assert_eq!(snapshot.phase, RoundPhase::Cancelled);
        assert_eq!(snapshot.detail.as_deref(), Some("User cancelled"));
    }

    #[tokio::test]
    async fn reconciliation_access_requires_a_discovered_round() {
        let events: Events = Events::default();
        let transport = Arc::new(TestTransport::new(events.clone()));
        let engine = engine_with(transport, surfaces(&events, SurfaceScripts::default())).await;

        let err = engine.reconciliation_entries().await.unwrap_err();
        assert!(matches!(err, LinkError::NoDiscovery(_)));
        let err = engine.commit_reconciliation(&[]).await.unwrap_err();
        assert!(matches!(err, LinkError::NoDiscovery(_)));
    }
}
