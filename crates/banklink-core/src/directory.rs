use crate::error::LinkError;
use crate::types::{InstitutionDraft, ProfileInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum DirectoryStorageConfig {
    /// Keep the institution list in process memory only.
    #[default]
    Memory,
    /// Load from and rewrite a JSON file on disk.
    File { path: PathBuf },
}

impl DirectoryStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
        }
    }
}

/// One known institution, with the last-known-good profile fields captured
/// after a successful round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionRecord {
    pub institution_id: String,
    pub name: String,
    pub url: String,
    pub org: String,
    pub fid: String,
    pub last_profile: Option<ProfileInfo>,
    pub updated_at: DateTime<Utc>,
}

impl InstitutionRecord {
    pub fn from_draft(draft: &InstitutionDraft) -> Self {
        Self {
            institution_id: draft.institution_id.clone(),
            name: draft.name.clone(),
            url: draft.url.clone(),
            org: draft.org.clone(),
            fid: draft.fid.clone(),
            last_profile: None,
            updated_at: Utc::now(),
        }
    }

    pub fn draft(&self) -> InstitutionDraft {
        InstitutionDraft {
            institution_id: self.institution_id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            org: self.org.clone(),
            fid: self.fid.clone(),
        }
    }
}

/// Cached, filterable list of known institutions.
///
/// Reads are served from memory; every write rewrites the full list, so there
/// is no row-level state to race with concurrent filter changes in the UI.
#[derive(Debug)]
pub struct InstitutionDirectory {
    records: Vec<InstitutionRecord>,
    backend: DirectoryStorageConfig,
}

impl InstitutionDirectory {
    /// Open the directory, hydrating from the file backend when one is
    /// configured and the file exists.
    pub async fn bootstrap(backend: DirectoryStorageConfig) -> Result<Self, LinkError> {
        let records = match &backend {
            DirectoryStorageConfig::Memory => Vec::new(),
            DirectoryStorageConfig::File { path } => {
                if tokio::fs::try_exists(path)
                    .await
                    .map_err(|e| LinkError::Directory(format!("stat {}: {e}", path.display())))?
                {
                    let raw = tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| LinkError::Directory(format!("read {}: {e}", path.display())))?;
                    serde_json::from_str(&raw)
                        .map_err(|e| LinkError::Serialization(e.to_string()))?
                } else {
                    Vec::new()
                }
            }
        };

        Ok(Self { records, backend })
    }

    pub fn backend_label(&self) -> &'static str {
        self.backend.label()
    }

    pub fn records(&self) -> &[InstitutionRecord] {
        &self.records
    }

    pub fn find(&self, institution_id: &str) -> Option<&InstitutionRecord> {
        self.records
            .iter()
            .find(|record| record.institution_id == institution_id)
    }

    /// Case-insensitive substring filter over name and org.
    pub fn filter(&self, text: &str) -> Vec<InstitutionRecord> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return self.records.clone();
        }
        self.records
            .iter()
            .filter(|record| {
                record.name.to_lowercase().contains(&needle)
                    || record.org.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    /// Insert or replace the record for an institution and rewrite the backend.
    pub async fn upsert(&mut self, record: InstitutionRecord) -> Result<(), LinkError> {
        match self
            .records
            .iter_mut()
            .find(|existing| existing.institution_id == record.institution_id)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        self.persist().await
    }

    /// Refresh an institution's record from a freshly fetched profile. Called
    /// at most once per successful round.
    pub async fn record_successful_round(
        &mut self,
        draft: &InstitutionDraft,
        profile: &ProfileInfo,
    ) -> Result<(), LinkError> {
        let mut record = self
            .find(&draft.institution_id)
            .cloned()
            .unwrap_or_else(|| InstitutionRecord::from_draft(draft));

        if !profile.name.is_empty() {
            record.name = profile.name.clone();
        }
        if let Some(url) = &profile.url {
            if !url.is_empty() {
                record.url = url.clone();
            }
        }
        record.last_profile = Some(profile.clone());
        record.updated_at = Utc::now();

        self.upsert(record).await
    }

    async fn persist(&self) -> Result<(), LinkError> {
        let DirectoryStorageConfig::File { path } = &self.backend else {
            return Ok(());
        };

        let raw = serde_json::to_string_pretty(&self.records)
            .map_err(|e| LinkError::Serialization(e.to_string()))?;
        tokio::fs::write(path, raw)
            .await
            .map_err(|e| LinkError::Directory(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, org: &str) -> InstitutionRecord {
        InstitutionRecord {
            institution_id: id.to_string(),
            name: name.to_string(),
            url: format!("https://ofx.{org}.example"),
            org: org.to_string(),
            fid: "1001".to_string(),
            last_profile: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn filter_matches_name_and_org_case_insensitively() {
        let mut directory = InstitutionDirectory::bootstrap(DirectoryStorageConfig::memory())
            .await
            .unwrap();
        directory.upsert(record("fi-1", "First Bank", "FBANK")).await.unwrap();
        directory.upsert(record("fi-2", "Coastal Credit Union", "COASTAL")).await.unwrap();

        assert_eq!(directory.filter("first").len(), 1);
        assert_eq!(directory.filter("coastal").len(), 1);
        assert_eq!(directory.filter("").len(), 2);
        assert!(directory.filter("nowhere").is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_institution_id() {
        let mut directory = InstitutionDirectory::bootstrap(DirectoryStorageConfig::memory())
            .await
            .unwrap();
        directory.upsert(record("fi-1", "First Bank", "FBANK")).await.unwrap();
        directory.upsert(record("fi-1", "First Bank, N.A.", "FBANK")).await.unwrap();

        assert_eq!(directory.records().len(), 1);
        assert_eq!(directory.records()[0].name, "First Bank, N.A.");
    }

    #[tokio::test]
    async fn file_backend_round_trips_the_full_list() {
        let path = std::env::temp_dir().join(format!(
            "banklink-directory-{}.json",
            uuid::Uuid::new_v4()
        ));

        {
            let mut directory =
                InstitutionDirectory::bootstrap(DirectoryStorageConfig::file(&path))
                    .await
                    .unwrap();
            directory.upsert(record("fi-1", "First Bank", "FBANK")).await.unwrap();
            directory.upsert(record("fi-2", "Coastal Credit Union", "COASTAL")).await.unwrap();
        }

        let reopened = InstitutionDirectory::bootstrap(DirectoryStorageConfig::file(&path))
            .await
            .unwrap();
        assert_eq!(reopened.records().len(), 2);
        assert!(reopened.find("fi-2").is_some());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn successful_round_refreshes_profile_fields() {
        let mut directory = InstitutionDirectory::bootstrap(DirectoryStorageConfig::memory())
            .await
            .unwrap();
        let draft = InstitutionDraft::new("fi-1", "First Bank", "https://ofx.fbank.example");

        let profile = ProfileInfo {
            name: "First Bank, N.A.".to_string(),
            url: Some("https://ofx2.fbank.example".to_string()),
            ..ProfileInfo::default()
        };
        directory.record_successful_round(&draft, &profile).await.unwrap();

        let stored = directory.find("fi-1").unwrap();
        assert_eq!(stored.name, "First Bank, N.A.");
        assert_eq!(stored.url, "https://ofx2.fbank.example");
        assert_eq!(stored.last_profile.as_ref().unwrap().name, "First Bank, N.A.");
    }
}
