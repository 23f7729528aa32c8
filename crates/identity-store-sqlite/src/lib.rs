use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use identity_core::{
    resolve, ConsolidatedContact, Contact, ContactId, ContactRepository, LinkPrecedence,
    NewContact, ResolverError, Submission,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
CREATE INDEX IF NOT EXISTS idx_contacts_created_at ON contacts(created_at);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A live secondary whose `linked_id` does not lead straight to a primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageViolation {
    pub contact_id: ContactId,
    pub linked_id: Option<ContactId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub linkage_violations: Vec<LinkageViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create contacts schema")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        tracing::info!(version = 1, "applied schema migration");
        Ok(())
    }

    /// Resolve one submission inside a single write transaction.
    ///
    /// The transaction takes the database write lock before the lookup, so concurrent
    /// resolutions serialize; `now` is read once the lock is held so creation times
    /// follow commit order. Any error rolls back every write of the resolution.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] on database failures and
    /// [`ResolverError::DataIntegrity`] when stored links are inconsistent.
    pub fn identify<F>(
        &mut self,
        submission: &Submission,
        now: F,
    ) -> Result<ConsolidatedContact, ResolverError>
    where
        F: FnOnce() -> OffsetDateTime,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identify transaction")
            .map_err(into_resolver_error)?;

        let mut repo = SqliteContactRepository::new(&tx);
        let contact = match resolve(&mut repo, submission, now()) {
            Ok(contact) => contact,
            Err(err) => {
                tracing::warn!(error = %err, "identify transaction rolled back");
                return Err(err);
            }
        };

        tx.commit().context("failed to commit identify transaction").map_err(into_resolver_error)?;
        Ok(contact)
    }

    /// Consolidate the cluster containing `contact_id` from one consistent snapshot.
    ///
    /// # Errors
    /// Returns [`ResolverError::NotFound`] for unknown ids, plus the errors of
    /// [`identity_core::consolidate`].
    pub fn consolidate(
        &mut self,
        contact_id: ContactId,
    ) -> Result<ConsolidatedContact, ResolverError> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start read transaction")
            .map_err(into_resolver_error)?;
        let contact = identity_core::consolidate(&SqliteContactRepository::new(&tx), contact_id)?;
        tx.commit().context("failed to finish read transaction").map_err(into_resolver_error)?;
        Ok(contact)
    }

    /// Load every stored contact, soft-deleted rows included, in id order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        load_contacts(
            &self.conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"),
            [],
        )
    }

    /// Create a `SQLite` backup file of the current database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, linkage audit, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let linkage_violations = if table_exists(&self.conn, "contacts")? {
            audit_linkage(&self.conn)?
        } else {
            Vec::new()
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            linkage_violations,
            schema_status,
        })
    }
}

/// Convert a store failure into the resolver's error, keeping the context chain.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn into_resolver_error(err: anyhow::Error) -> ResolverError {
    ResolverError::Store(format!("{err:#}"))
}

/// [`ContactRepository`] over one open connection or transaction.
struct SqliteContactRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteContactRepository<'conn> {
    fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ContactRepository for SqliteContactRepository<'_> {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, ResolverError> {
        // NULL never compares equal, so an absent field matches nothing.
        load_contacts(
            self.conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (email = ?1 OR phone_number = ?2)
                 ORDER BY created_at ASC, id ASC"
            ),
            params![email, phone_number],
        )
        .map_err(into_resolver_error)
    }

    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, ResolverError> {
        load_contact_by_id(self.conn, id).map_err(into_resolver_error)
    }

    fn find_by_linked_id(&self, id: ContactId) -> Result<Vec<Contact>, ResolverError> {
        load_contacts(
            self.conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND linked_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ),
            params![id.0],
        )
        .map_err(into_resolver_error)
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>, ResolverError> {
        load_contacts(
            self.conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
                 ORDER BY created_at ASC, id ASC"
            ),
            params![primary_id.0],
        )
        .map_err(into_resolver_error)
    }

    fn create_contact(&mut self, contact: &NewContact) -> Result<Contact, ResolverError> {
        contact.validate()?;
        insert_contact(self.conn, contact).map_err(into_resolver_error)
    }

    fn relink_contact(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: OffsetDateTime,
    ) -> Result<(), ResolverError> {
        update_contact_link(self.conn, id, link_precedence, linked_id, updated_at)
            .map_err(into_resolver_error)
    }
}

fn insert_contact(conn: &Connection, contact: &NewContact) -> Result<Contact> {
    let created_at = timestamp(contact.created_at)?;
    conn.execute(
        "INSERT INTO contacts(
            email, phone_number, linked_id, link_precedence, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            contact.email,
            contact.phone_number,
            contact.linked_id.map(|id| id.0),
            contact.link_precedence.as_str(),
            created_at,
        ],
    )
    .context("failed to insert contact")?;

    Ok(Contact {
        id: ContactId(conn.last_insert_rowid()),
        email: contact.email.clone(),
        phone_number: contact.phone_number.clone(),
        linked_id: contact.linked_id,
        link_precedence: contact.link_precedence,
        created_at: contact.created_at,
        updated_at: contact.created_at,
        deleted_at: None,
    })
}

fn update_contact_link(
    conn: &Connection,
    id: ContactId,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
    updated_at: OffsetDateTime,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE contacts SET link_precedence = ?2, linked_id = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id.0,
                link_precedence.as_str(),
                linked_id.map(|linked| linked.0),
                timestamp(updated_at)?
            ],
        )
        .with_context(|| format!("failed to relink contact {id}"))?;

    if changed == 0 {
        return Err(anyhow!("cannot relink missing contact {id}"));
    }
    Ok(())
}

fn load_contact_by_id(conn: &Connection, id: ContactId) -> Result<Option<Contact>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"))
        .context("failed to prepare contact lookup")?;
    let mut rows = stmt.query(params![id.0])?;
    match rows.next()? {
        Some(row) => Ok(Some(contact_from_row(row)?)),
        None => Ok(None),
    }
}

fn load_contacts<P>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Contact>>
where
    P: rusqlite::Params,
{
    let mut stmt = conn.prepare(sql).context("failed to prepare contact query")?;
    let mut rows = stmt.query(params)?;
    let mut contacts = Vec::new();

    while let Some(row) = rows.next()? {
        contacts.push(contact_from_row(row)?);
    }

    Ok(contacts)
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> Result<Contact> {
    let link_precedence_raw: String = row.get(4)?;
    let deleted_at_raw: Option<String> = row.get(7)?;

    Ok(Contact {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get::<_, Option<i64>>(3)?.map(ContactId),
        link_precedence: LinkPrecedence::parse(&link_precedence_raw)
            .ok_or_else(|| anyhow!("unknown link_precedence: {link_precedence_raw}"))?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(6)?)?,
        deleted_at: deleted_at_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn audit_linkage(conn: &Connection) -> Result<Vec<LinkageViolation>> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.linked_id, p.id, p.link_precedence
             FROM contacts c
             LEFT JOIN contacts p ON p.id = c.linked_id
             WHERE c.link_precedence = 'secondary'
               AND c.deleted_at IS NULL
               AND (c.linked_id IS NULL OR p.id IS NULL OR p.link_precedence <> 'primary')
             ORDER BY c.id ASC",
        )
        .context("failed to prepare linkage audit")?;
    let mut rows = stmt.query([])?;
    let mut violations = Vec::new();

    while let Some(row) = rows.next()? {
        let linked_id = row.get::<_, Option<i64>>(1)?.map(ContactId);
        let parent_id: Option<i64> = row.get(2)?;
        let reason = match (linked_id, parent_id) {
            (None, _) => "secondary has no linked_id",
            (Some(_), None) => "linked contact does not exist",
            (Some(_), Some(_)) => "linked contact is not a primary",
        };
        violations.push(LinkageViolation {
            contact_id: ContactId(row.get(0)?),
            linked_id,
            reason: reason.to_string(),
        });
    }

    Ok(violations)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, timestamp(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

// Fixed-width UTC text so lexical order in SQL equals chronological order.
fn timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
