use crate::types::Credentials;

/// Mutable draft of the online-account record being edited.
///
/// The draft is what the connection dialog edits and what a round works from;
/// the committed copy is what the rest of the application sees. `commit` is
/// only called by the orchestrator after a round reaches a success terminal
/// state, so no partial writes are ever visible mid-round.
#[derive(Debug, Clone, Default)]
pub struct CredentialVault {
    draft: Credentials,
    committed: Credentials,
}

impl CredentialVault {
    pub fn new(committed: Credentials) -> Self {
        Self {
            draft: committed.clone(),
            committed,
        }
    }

    pub fn draft(&self) -> Credentials {
        self.draft.clone()
    }

    pub fn draft_mut(&mut self) -> &mut Credentials {
        &mut self.draft
    }

    pub fn committed(&self) -> &Credentials {
        &self.committed
    }

    /// Make `credentials` the committed record and the new draft baseline.
    pub fn commit(&mut self, credentials: Credentials) {
        self.draft = credentials.clone();
        self.committed = credentials;
    }

    /// Replace the draft. `None` clears every field, used when the operator
    /// switches to an institution with no prior online-account link.
    pub fn reset(&mut self, source: Option<&Credentials>) {
        self.draft = source.cloned().unwrap_or_default();
    }
}
