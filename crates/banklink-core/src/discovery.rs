use crate::error::LinkError;
use crate::types::{AccountType, InstitutionDraft, LocalAccount, RemoteAccount};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Link identity recorded on a local account once it is connected to a remote
/// account at an institution.
pub fn online_link_id(institution_id: &str, remote_account_id: &str) -> String {
    format!("{institution_id}:{remote_account_id}")
}

/// Read/write access to local accounts, as needed by discovery matching and
/// the reconciliation commit pass.
#[async_trait]
pub trait LocalAccountStore: Send + Sync {
    async fn accounts(&self) -> Result<Vec<LocalAccount>, LinkError>;

    /// Create a placeholder local account and link it in one step. Returns the
    /// new account ref.
    async fn create_and_link(
        &self,
        name: &str,
        account_type: AccountType,
        remote: &RemoteAccount,
        link_id: &str,
    ) -> Result<String, LinkError>;

    /// Link an existing local account. `corrected_type` carries an operator
    /// type correction to apply together with the link.
    async fn link(
        &self,
        account_ref: &str,
        link_id: &str,
        corrected_type: Option<AccountType>,
    ) -> Result<(), LinkError>;

    async fn unlink(&self, account_ref: &str) -> Result<(), LinkError>;
}

/// Per-remote-account reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationState {
    New,
    Matched,
    TypeMismatch,
    AlreadyConnectedElsewhere,
    UserAdded,
    Disconnected,
}

impl ReconciliationState {
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Matched => "matched",
            Self::TypeMismatch => "type_mismatch",
            Self::AlreadyConnectedElsewhere => "already_connected_elsewhere",
            Self::UserAdded => "user_added",
            Self::Disconnected => "disconnected",
        }
    }
}

/// One remote account with its matched local account (if any) and the operator
/// decisions taken so far. Entries are rebuilt fresh for every successful
/// discovery response and discarded if the dialog closes without committing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    pub remote: RemoteAccount,
    pub local_ref: Option<String>,
    pub local_name: Option<String>,
    pub state: ReconciliationState,
    /// Set when the operator corrected a type mismatch; the correction is
    /// applied at commit, together with the link.
    pub type_corrected: bool,
}

impl ReconciliationEntry {
    fn action_error(&self, action: &str) -> LinkError {
        LinkError::ReconciliationAction(format!(
            "cannot {action} '{}' in state '{}'",
            self.remote.account_id,
            self.state.name()
        ))
    }

    /// New -> UserAdded.
    pub fn mark_added(&mut self) -> Result<(), LinkError> {
        if self.state != ReconciliationState::New {
            return Err(self.action_error("add"));
        }
        self.state = ReconciliationState::UserAdded;
        Ok(())
    }

    /// UserAdded -> New.
    pub fn undo_added(&mut self) -> Result<(), LinkError> {
        if self.state != ReconciliationState::UserAdded {
            return Err(self.action_error("undo add of"));
        }
        self.state = ReconciliationState::New;
        Ok(())
    }

    /// AlreadyConnectedElsewhere -> Disconnected.
    pub fn mark_disconnected(&mut self) -> Result<(), LinkError> {
        if self.state != ReconciliationState::AlreadyConnectedElsewhere {
            return Err(self.action_error("disconnect"));
        }
        self.state = ReconciliationState::Disconnected;
        Ok(())
    }

    /// Disconnected -> AlreadyConnectedElsewhere.
    pub fn reconnect(&mut self) -> Result<(), LinkError> {
        if self.state != ReconciliationState::Disconnected {
            return Err(self.action_error("reconnect"));
        }
        self.state = ReconciliationState::AlreadyConnectedElsewhere;
        Ok(())
    }

    /// TypeMismatch -> Matched, with the correction applied at commit. The
    /// correction does not by itself change connection state.
    pub fn correct_type(&mut self) -> Result<(), LinkError> {
        if self.state != ReconciliationState::TypeMismatch {
            return Err(self.action_error("correct type of"));
        }
        self.state = ReconciliationState::Matched;
        self.type_corrected = true;
        Ok(())
    }
}

/// Reconcile a discovery response against the local account list.
///
/// A remote account matches a local account when the local primary number or
/// the institution-assigned alternate id equals the remote account id. When
/// the server reports the same remote id twice, the later entry wins.
pub fn match_accounts(
    remote_accounts: &[RemoteAccount],
    local_accounts: &[LocalAccount],
    institution_id: &str,
) -> Vec<ReconciliationEntry> {
    let mut entries: Vec<ReconciliationEntry> = Vec::new();
    let mut by_remote_id: HashMap<String, usize> = HashMap::new();

    for remote in remote_accounts {
        let entry = classify(remote, local_accounts, institution_id);
        match by_remote_id.get(&remote.account_id) {
            Some(&index) => {
                debug!(
                    remote_id = %remote.account_id,
                    "duplicate remote account id in discovery response, keeping later entry"
                );
                entries[index] = entry;
            }
            None => {
                by_remote_id.insert(remote.account_id.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    entries
}

fn classify(
    remote: &RemoteAccount,
    local_accounts: &[LocalAccount],
    institution_id: &str,
) -> ReconciliationEntry {
    let matched = local_accounts.iter().find(|local| {
        local.number == remote.account_id
            || local.institution_assigned_id.as_deref() == Some(remote.account_id.as_str())
    });

    let Some(local) = matched else {
        return ReconciliationEntry {
            remote: remote.clone(),
            local_ref: None,
            local_name: None,
            state: ReconciliationState::New,
            type_corrected: false,
        };
    };

    let this_link = online_link_id(institution_id, &remote.account_id);
    let state = match &local.online_link {
        Some(link) if *link != this_link => ReconciliationState::AlreadyConnectedElsewhere,
        _ if local.account_type != remote.account_type => ReconciliationState::TypeMismatch,
        _ => ReconciliationState::Matched,
    };

    ReconciliationEntry {
        remote: remote.clone(),
        local_ref: Some(local.account_ref.clone()),
        local_name: Some(local.name.clone()),
        state,
        type_corrected: false,
    }
}

/// One entry that failed to apply during the commit pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFailure {
    pub remote_account_id: String,
    pub detail: String,
}

/// Result of a reconciliation commit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub created: Vec<String>,
    pub linked: usize,
    pub unlinked: usize,
    pub skipped: usize,
    pub failures: Vec<CommitFailure>,
}

/// Apply every entry in one pass: create-and-link, link, unlink, or no-op.
///
/// A failing entry is recorded and the pass continues; failures are reported
/// together afterwards, never as a per-entry interrupt.
pub async fn commit_reconciliation(
    store: &dyn LocalAccountStore,
    institution: &InstitutionDraft,
    entries: &[ReconciliationEntry],
) -> CommitReport {
    let mut report = CommitReport::default();
    let mut added_index = 0usize;

    for entry in entries {
        let link_id = online_link_id(&institution.institution_id, &entry.remote.account_id);
        match entry.state {
            ReconciliationState::UserAdded => {
                let name = placeholder_name(&institution.name, added_index);
                added_index += 1;
                match store
                    .create_and_link(&name, entry.remote.account_type, &entry.remote, &link_id)
                    .await
                {
                    Ok(account_ref) => report.created.push(account_ref),
                    Err(err) => report.failures.push(CommitFailure {
                        remote_account_id: entry.remote.account_id.clone(),
                        detail: err.to_string(),
                    }),
                }
            }
            ReconciliationState::Matched => match &entry.local_ref {
                Some(account_ref) => {
                    let corrected = entry
                        .type_corrected
                        .then_some(entry.remote.account_type);
                    match store.link(account_ref, &link_id, corrected).await {
                        Ok(()) => report.linked += 1,
                        Err(err) => report.failures.push(CommitFailure {
                            remote_account_id: entry.remote.account_id.clone(),
                            detail: err.to_string(),
                        }),
                    }
                }
                None => report.failures.push(CommitFailure {
                    remote_account_id: entry.remote.account_id.clone(),
                    detail: "matched entry has no local account ref".to_string(),
                }),
            },
            ReconciliationState::Disconnected => match &entry.local_ref {
                Some(account_ref) => match store.unlink(account_ref).await {
                    Ok(()) => report.unlinked += 1,
                    Err(err) => report.failures.push(CommitFailure {
                        remote_account_id: entry.remote.account_id.clone(),
                        detail: err.to_string(),
                    }),
                },
                None => report.failures.push(CommitFailure {
                    remote_account_id: entry.remote.account_id.clone(),
                    detail: "disconnected entry has no local account ref".to_string(),
                }),
            },
            ReconciliationState::New
            | ReconciliationState::TypeMismatch
            | ReconciliationState::AlreadyConnectedElsewhere => report.skipped += 1,
        }
    }

    report
}

/// Placeholder name for an operator-added account: the institution's display
/// name, suffixed with an incrementing index from the second account on.
fn placeholder_name(institution_name: &str, index: usize) -> String {
    if index == 0 {
        institution_name.to_string()
    } else {
        format!("{} {}", institution_name, index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn remote_checking(id: &str) -> RemoteAccount {
        RemoteAccount::deposit(id, AccountType::Checking, "111000025")
    }

    fn local_checking(account_ref: &str, number: &str) -> LocalAccount {
        LocalAccount::new(account_ref, "Everyday Checking", AccountType::Checking, number)
    }

    #[test]
    fn unmatched_remote_account_is_new() {
        let entries = match_accounts(&[remote_checking("12345")], &[], "fi-1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, ReconciliationState::New);
        assert!(entries[0].local_ref.is_none());
    }

    #[test]
    fn unlinked_local_match_is_matched() {
        let entries = match_accounts(
            &[remote_checking("12345")],
            &[local_checking("acct-1", "12345")],
            "fi-1",
        );
        assert_eq!(entries[0].state, ReconciliationState::Matched);
        assert_eq!(entries[0].local_ref.as_deref(), Some("acct-1"));
    }

    #[test]
    fn alternate_institution_assigned_id_also_matches() {
        let local = local_checking("acct-1", "999").with_institution_assigned_id("12345");
        let entries = match_accounts(&[remote_checking("12345")], &[local], "fi-1");
        assert_eq!(entries[0].state, ReconciliationState::Matched);
    }

    #[test]
    fn link_to_a_different_online_account_is_already_connected_elsewhere() {
        let local = local_checking("acct-1", "12345").with_online_link("fi-other:777");
        let entries = match_accounts(&[remote_checking("12345")], &[local], "fi-1");
        assert_eq!(
            entries[0].state,
            ReconciliationState::AlreadyConnectedElsewhere
        );
    }

    #[test]
    fn link_to_the_same_online_account_stays_matched() {
        let local = local_checking("acct-1", "12345").with_online_link("fi-1:12345");
        let entries = match_accounts(&[remote_checking("12345")], &[local], "fi-1");
        assert_eq!(entries[0].state, ReconciliationState::Matched);
    }

    #[test]
    fn declared_type_difference_is_type_mismatch() {
        let local = LocalAccount::new("acct-1", "Rainy Day", AccountType::Savings, "12345");
        let entries = match_accounts(&[remote_checking("12345")], &[local], "fi-1");
        assert_eq!(entries[0].state, ReconciliationState::TypeMismatch);
    }

    #[test]
    fn duplicate_remote_id_keeps_the_later_entry() {
        let first = RemoteAccount::deposit("12345", AccountType::Checking, "111000025");
        let second = RemoteAccount::deposit("12345", AccountType::Savings, "111000025");
        let entries = match_accounts(&[first, second], &[], "fi-1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote.account_type, AccountType::Savings);
    }

    #[test]
    fn operator_actions_are_reversible() {
        let mut entry = match_accounts(&[remote_checking("12345")], &[], "fi-1").remove(0);
        entry.mark_added().unwrap();
        assert_eq!(entry.state, ReconciliationState::UserAdded);
        entry.undo_added().unwrap();
        assert_eq!(entry.state, ReconciliationState::New);

        let local = local_checking("acct-1", "12345").with_online_link("fi-other:777");
        let mut entry = match_accounts(&[remote_checking("12345")], &[local], "fi-1").remove(0);
        entry.mark_disconnected().unwrap();
        assert_eq!(entry.state, ReconciliationState::Disconnected);
        entry.reconnect().unwrap();
        assert_eq!(entry.state, ReconciliationState::AlreadyConnectedElsewhere);
    }

    #[test]
    fn type_correction_clears_mismatch_without_connecting() {
        let local = LocalAccount::new("acct-1", "Rainy Day", AccountType::Savings, "12345");
        let mut entry = match_accounts(&[remote_checking("12345")], &[local], "fi-1").remove(0);

        entry.correct_type().unwrap();
        assert_eq!(entry.state, ReconciliationState::Matched);
        assert!(entry.type_corrected);
    }

    #[test]
    fn actions_reject_entries_in_the_wrong_state() {
        let mut entry = match_accounts(&[remote_checking("12345")], &[], "fi-1").remove(0);
        let err = entry.undo_added().unwrap_err();
        assert!(matches!(err, LinkError::ReconciliationAction(_)));
        let err = entry.mark_disconnected().unwrap_err();
        assert!(matches!(err, LinkError::ReconciliationAction(_)));
    }

    #[derive(Default)]
    struct RecordingStore {
        created: Mutex<Vec<String>>,
        linked: Mutex<Vec<(String, Option<AccountType>)>>,
        unlinked: Mutex<Vec<String>>,
        fail_unlink: bool,
    }

    #[async_trait]
    impl LocalAccountStore for RecordingStore {
        async fn accounts(&self) -> Result<Vec<LocalAccount>, LinkError> {
            Ok(Vec::new())
        }

        async fn create_and_link(
            &self,
            name: &str,
            _account_type: AccountType,
            _remote: &RemoteAccount,
            _link_id: &str,
        ) -> Result<String, LinkError> {
            let mut created = self.created.lock().unwrap();
            created.push(name.to_string());
            Ok(format!("acct-{}", created.len()))
        }

        async fn link(
            &self,
            account_ref: &str,
            _link_id: &str,
            corrected_type: Option<AccountType>,
        ) -> Result<(), LinkError> {
            self.linked
                .lock()
                .unwrap()
                .push((account_ref.to_string(), corrected_type));
            Ok(())
        }

        async fn unlink(&self, account_ref: &str) -> Result<(), LinkError> {
            if self.fail_unlink {
                return Err(LinkError::account_store("store rejected unlink"));
            }
            self.unlinked.lock().unwrap().push(account_ref.to_string());
            Ok(())
        }
    }

    fn institution() -> InstitutionDraft {
        InstitutionDraft::new("fi-1", "First Bank", "https://ofx.firstbank.example")
    }

    #[tokio::test]
    async fn commit_applies_exactly_one_operation_per_entry() {
        let store = RecordingStore::default();

        let remotes = vec![
            remote_checking("new-1"),
            remote_checking("new-2"),
            remote_checking("match-1"),
            remote_checking("conn-1"),
            remote_checking("untouched-1"),
        ];
        let locals = vec![
            local_checking("acct-m", "match-1"),
            local_checking("acct-c", "conn-1").with_online_link("fi-other:9"),
        ];
        let mut entries = match_accounts(&remotes, &locals, "fi-1");
        entries[0].mark_added().unwrap();
        entries[1].mark_added().unwrap();
        entries[3].mark_disconnected().unwrap();
        // entries[4] stays New: no-op.

        let report = commit_reconciliation(&store, &institution(), &entries).await;

        assert_eq!(report.created.len(), 2);
        assert_eq!(report.linked, 1);
        assert_eq!(report.unlinked, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());

        // Placeholder naming: first added keeps the institution name, the
        // second gets an index.
        let created = store.created.lock().unwrap();
        assert_eq!(created.as_slice(), ["First Bank", "First Bank 2"]);
    }

    #[tokio::test]
    async fn commit_collects_failures_without_blocking_other_entries() {
        let mut store = RecordingStore::default();
        store.fail_unlink = true;

        let remotes = vec![remote_checking("conn-1"), remote_checking("match-1")];
        let locals = vec![
            local_checking("acct-c", "conn-1").with_online_link("fi-other:9"),
            local_checking("acct-m", "match-1"),
        ];
        let mut entries = match_accounts(&remotes, &locals, "fi-1");
        entries[0].mark_disconnected().unwrap();

        let report = commit_reconciliation(&store, &institution(), &entries).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].remote_account_id, "conn-1");
        // The failing unlink did not stop the link that followed it.
        assert_eq!(report.linked, 1);
    }

    #[tokio::test]
    async fn commit_link_carries_operator_type_correction() {
        let store = RecordingStore::default();
        let local = LocalAccount::new("acct-1", "Rainy Day", AccountType::Savings, "12345");
        let mut entries = match_accounts(&[remote_checking("12345")], &[local], "fi-1");
        entries[0].correct_type().unwrap();

        let report = commit_reconciliation(&store, &institution(), &entries).await;
        assert_eq!(report.linked, 1);

        let linked = store.linked.lock().unwrap();
        assert_eq!(linked[0].1, Some(AccountType::Checking));
    }
}
