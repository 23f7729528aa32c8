use std::path::PathBuf;

use anyhow::Result;
use identity_core::{Contact, ContactId, IdentifyRequest, IdentifyResponse, ResolverError, Submission};
use identity_store_sqlite::{into_resolver_error, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// In-process entry point shared by the HTTP service and the CLI.
///
/// Every call opens its own connection, so one value can be cloned freely across
/// request handlers.
#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Resolve one identify request against the database.
    ///
    /// The request is validated before the database is opened.
    ///
    /// # Errors
    /// Returns [`ResolverError::Validation`] when neither field is present,
    /// [`ResolverError::Store`] on database failures, and
    /// [`ResolverError::DataIntegrity`] when stored links are inconsistent.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse, ResolverError> {
        let submission = Submission::from_request(request)?;
        let mut store = self.open_migrated_store().map_err(into_resolver_error)?;
        let contact = store.identify(&submission, OffsetDateTime::now_utc)?;
        Ok(IdentifyResponse { contact })
    }

    /// Consolidated view of the cluster containing `contact_id`.
    ///
    /// # Errors
    /// Returns [`ResolverError::NotFound`] for unknown ids and
    /// [`ResolverError::Store`] on database failures.
    pub fn contact(&self, contact_id: ContactId) -> Result<IdentifyResponse, ResolverError> {
        let mut store = self.open_migrated_store().map_err(into_resolver_error)?;
        let contact = store.consolidate(contact_id)?;
        Ok(IdentifyResponse { contact })
    }

    /// Every stored contact row in id order.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, migrated, or read.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.open_migrated_store()?.list_contacts()
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the store's integrity probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }
}
