//! Persistence of artifact records, one TOML file per artifact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::record::ArtifactRecord;
use crate::storage::{BackendKind, artifact_key};

/// Directory-backed store of [`ArtifactRecord`]s.
///
/// Records are written atomically (write tmp + rename), so a crash never
/// leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, artifact_id: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", artifact_key(artifact_id)))
    }

    /// Loads the record for `artifact_id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub async fn load(&self, artifact_id: &str) -> Result<Option<ArtifactRecord>> {
        let path = self.record_path(artifact_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::Metadata(format!("{}: {e}", path.display())))
    }

    /// Saves `record` under its artifact id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot
    /// be written.
    pub async fn save(&self, record: &ArtifactRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&record.artifact_id);
        let tmp_path = path.with_extension("toml.tmp");

        let toml_str = toml::to_string(record).map_err(|e| Error::Metadata(e.to_string()))?;
        tokio::fs::write(&tmp_path, toml_str).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Applies `f` to the record for `artifact_id` and persists the result.
    ///
    /// A fresh record for `backend` is used when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be loaded or saved.
    pub async fn update<F>(
        &self,
        artifact_id: &str,
        backend: BackendKind,
        f: F,
    ) -> Result<ArtifactRecord>
    where
        F: FnOnce(&mut ArtifactRecord),
    {
        let mut record = self
            .load(artifact_id)
            .await?
            .unwrap_or_else(|| ArtifactRecord::new(artifact_id, backend));
        f(&mut record);
        record.updated_at = Utc::now();
        self.save(&record).await?;
        Ok(record)
    }

    /// Removes the record for `artifact_id`. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub async fn remove(&self, artifact_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(artifact_id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Loads every record in the store, sorted by artifact id.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub async fn list(&self) -> Result<Vec<ArtifactRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|s| toml::from_str::<ArtifactRecord>(&s).map_err(|e| e.to_string()));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable record {}: {e}", path.display()),
            }
        }
        records.sort_by(|a, b| a.artifact_id.cmp(&b.artifact_id));
        Ok(records)
    }
}
