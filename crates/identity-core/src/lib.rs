use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

mod memory_store;

pub use memory_store::InMemoryContactStore;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolverError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    #[error("contact not found: {0}")]
    NotFound(ContactId),
}

impl ResolverError {
    /// Whether the failure was caused by the caller's input rather than the store.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// One stored contact row. A primary is the root of its cluster; a secondary
/// always links directly to a primary.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Check the shape invariants of a stored contact.
    ///
    /// # Errors
    /// Returns [`ResolverError::DataIntegrity`] when the row carries no identifying
    /// field or its precedence and `linked_id` disagree.
    pub fn validate(&self) -> Result<(), ResolverError> {
        match shape_violation(
            self.email.as_deref(),
            self.phone_number.as_deref(),
            self.link_precedence,
            self.linked_id,
        ) {
            Some(reason) => {
                Err(ResolverError::DataIntegrity(format!("contact {}: {reason}", self.id)))
            }
            None => Ok(()),
        }
    }
}

/// A contact about to be inserted; the store assigns the id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: OffsetDateTime,
}

impl NewContact {
    #[must_use]
    pub fn primary(submission: &Submission, created_at: OffsetDateTime) -> Self {
        Self {
            email: submission.email.clone(),
            phone_number: submission.phone_number.clone(),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
            created_at,
        }
    }

    #[must_use]
    pub fn secondary(
        submission: &Submission,
        primary_id: ContactId,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            email: submission.email.clone(),
            phone_number: submission.phone_number.clone(),
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
            created_at,
        }
    }

    /// Validate a contact before it is written.
    ///
    /// # Errors
    /// Returns [`ResolverError::Validation`] when no identifying field is present or
    /// precedence and `linked_id` disagree.
    pub fn validate(&self) -> Result<(), ResolverError> {
        match shape_violation(
            self.email.as_deref(),
            self.phone_number.as_deref(),
            self.link_precedence,
            self.linked_id,
        ) {
            Some(reason) => Err(ResolverError::Validation(reason.to_string())),
            None => Ok(()),
        }
    }
}

fn shape_violation(
    email: Option<&str>,
    phone_number: Option<&str>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Option<&'static str> {
    if email.is_none() && phone_number.is_none() {
        return Some("email or phoneNumber MUST be present");
    }
    match (link_precedence, linked_id) {
        (LinkPrecedence::Primary, Some(_)) => Some("primary contact MUST NOT carry a linkedId"),
        (LinkPrecedence::Secondary, None) => Some("secondary contact MUST carry a linkedId"),
        _ => None,
    }
}

/// Inbound identify payload as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_phone_number")]
    pub phone_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PhoneNumberInput {
    Text(String),
    Integer(u64),
}

fn deserialize_phone_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PhoneNumberInput>::deserialize(deserializer)?;
    Ok(value.map(|input| match input {
        PhoneNumberInput::Text(text) => text,
        PhoneNumberInput::Integer(number) => number.to_string(),
    }))
}

/// A normalized submission: both fields trimmed, blanks dropped, at least one present.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Submission {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Submission {
    /// Normalize raw email and phone values.
    ///
    /// # Errors
    /// Returns [`ResolverError::Validation`] when both values are absent after trimming.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, ResolverError> {
        let email = normalize_field(email);
        let phone_number = normalize_field(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(ResolverError::Validation(
                "email or phoneNumber MUST be provided".to_string(),
            ));
        }
        Ok(Self { email, phone_number })
    }

    /// Normalize an [`IdentifyRequest`].
    ///
    /// # Errors
    /// Returns [`ResolverError::Validation`] when both fields are absent after trimming.
    pub fn from_request(request: &IdentifyRequest) -> Result<Self, ResolverError> {
        Self::new(request.email.as_deref(), request.phone_number.as_deref())
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

// Byte order marks count as blank, like Unicode whitespace.
fn normalize_field(value: Option<&str>) -> Option<String> {
    value
        .map(|raw| raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}'))
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    #[serde(rename = "primaryContatctId")]
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

impl ConsolidatedContact {
    /// The zero payload returned alongside every failure.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}

impl IdentifyResponse {
    #[must_use]
    pub fn empty() -> Self {
        Self { contact: ConsolidatedContact::empty() }
    }
}

/// Storage operations the resolver needs. Implementations run every call of one
/// resolution against the same transaction.
pub trait ContactRepository {
    /// Non-deleted contacts whose email or phone equals a present submitted value,
    /// ordered by `created_at` then id.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] when the lookup fails.
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, ResolverError>;

    /// Unique lookup by id, including soft-deleted rows.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] when the lookup fails.
    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, ResolverError>;

    /// Non-deleted contacts whose `linked_id` equals `id`, in creation order.
    ///
    /// Merges re-point only these rows, so a soft-deleted child of a demoted primary
    /// keeps its old `linked_id`.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] when the lookup fails.
    fn find_by_linked_id(&self, id: ContactId) -> Result<Vec<Contact>, ResolverError>;

    /// Non-deleted contacts that are `primary_id` itself or link to it, in creation order.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] when the lookup fails.
    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>, ResolverError>;

    /// Insert a contact and return the stored row.
    ///
    /// # Errors
    /// Returns [`ResolverError::Validation`] for malformed rows and
    /// [`ResolverError::Store`] when the insert fails.
    fn create_contact(&mut self, contact: &NewContact) -> Result<Contact, ResolverError>;

    /// Reassign precedence and `linked_id`; the only mutation the resolver performs.
    ///
    /// # Errors
    /// Returns [`ResolverError::Store`] when the update fails or no row has `id`.
    fn relink_contact(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: OffsetDateTime,
    ) -> Result<(), ResolverError>;
}

/// Creation order used everywhere contacts are sorted: `created_at`, then id.
#[must_use]
pub fn creation_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

/// Resolve one normalized submission against `repo`.
///
/// The caller owns the transaction: every read and write below must land in the same
/// unit of work so a failed merge leaves nothing behind.
///
/// # Errors
/// Returns [`ResolverError::DataIntegrity`] when a matched secondary cannot be resolved
/// to a primary, and [`ResolverError::Store`] on any store failure.
pub fn resolve<R>(
    repo: &mut R,
    submission: &Submission,
    now: OffsetDateTime,
) -> Result<ConsolidatedContact, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    let matches = repo.find_matching(submission.email(), submission.phone_number())?;
    tracing::debug!(matches = matches.len(), "looked up contacts matching submission");

    if matches.is_empty() {
        let created = repo.create_contact(&NewContact::primary(submission, now))?;
        tracing::info!(contact_id = %created.id, "created primary contact");
        return consolidate(repo, created.id);
    }

    let primaries = matched_primaries(repo, &matches)?;
    match primaries.len() {
        0 => Err(ResolverError::DataIntegrity(
            "matched contacts resolved to no primary contact".to_string(),
        )),
        1 => attach_to_primary(repo, &primaries[0], submission, now),
        _ => merge_primaries(repo, primaries, submission, now),
    }
}

/// Build the consolidated view of the cluster that `contact_id` belongs to.
///
/// # Errors
/// Returns [`ResolverError::NotFound`] for an unknown id,
/// [`ResolverError::DataIntegrity`] when a secondary does not link to a primary, and
/// [`ResolverError::Store`] on lookup failures.
pub fn consolidate<R>(repo: &R, contact_id: ContactId) -> Result<ConsolidatedContact, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    let contact = repo.find_by_id(contact_id)?.ok_or(ResolverError::NotFound(contact_id))?;
    let primary = if contact.is_primary() { contact } else { primary_of(repo, &contact)? };
    primary.validate()?;
    let members = repo.find_cluster(primary.id)?;
    Ok(build_consolidated_contact(&primary, &members))
}

/// Shape cluster members into the response, the primary's values first.
#[must_use]
pub fn build_consolidated_contact(primary: &Contact, members: &[Contact]) -> ConsolidatedContact {
    let mut emails = OrderedUnique::default();
    let mut phone_numbers = OrderedUnique::default();

    if let Some(listed_primary) = members.iter().find(|member| member.id == primary.id) {
        emails.push(listed_primary.email.as_deref());
        phone_numbers.push(listed_primary.phone_number.as_deref());
    }
    for member in members {
        emails.push(member.email.as_deref());
        phone_numbers.push(member.phone_number.as_deref());
    }

    ConsolidatedContact {
        primary_contact_id: primary.id,
        emails: emails.into_vec(),
        phone_numbers: phone_numbers.into_vec(),
        secondary_contact_ids: members
            .iter()
            .filter(|member| member.link_precedence == LinkPrecedence::Secondary)
            .map(|member| member.id)
            .collect(),
    }
}

fn matched_primaries<R>(repo: &R, matches: &[Contact]) -> Result<Vec<Contact>, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    let primaries = matches.iter().filter(|contact| contact.is_primary()).cloned().collect::<Vec<_>>();
    if !primaries.is_empty() {
        return Ok(primaries);
    }

    let mut seen = BTreeSet::new();
    let mut resolved = Vec::new();
    for secondary in matches {
        let primary = primary_of(repo, secondary)?;
        if seen.insert(primary.id) {
            resolved.push(primary);
        }
    }
    Ok(resolved)
}

// Exactly one hop: secondaries are flattened onto their primary.
fn primary_of<R>(repo: &R, secondary: &Contact) -> Result<Contact, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    let Some(linked_id) = secondary.linked_id else {
        return Err(ResolverError::DataIntegrity(format!(
            "secondary contact {} has no linkedId",
            secondary.id
        )));
    };

    let Some(primary) = repo.find_by_id(linked_id)? else {
        return Err(ResolverError::DataIntegrity(format!(
            "secondary contact {} links to missing contact {linked_id}",
            secondary.id
        )));
    };

    if !primary.is_primary() {
        return Err(ResolverError::DataIntegrity(format!(
            "secondary contact {} links to contact {linked_id}, which is not a primary",
            secondary.id
        )));
    }

    Ok(primary)
}

fn attach_to_primary<R>(
    repo: &mut R,
    primary: &Contact,
    submission: &Submission,
    now: OffsetDateTime,
) -> Result<ConsolidatedContact, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    let new_email =
        submission.email().is_some_and(|email| primary.email.as_deref() != Some(email));
    let new_phone_number = submission
        .phone_number()
        .is_some_and(|phone_number| primary.phone_number.as_deref() != Some(phone_number));

    if new_email || new_phone_number {
        let created = repo.create_contact(&NewContact::secondary(submission, primary.id, now))?;
        tracing::info!(
            contact_id = %created.id,
            primary_id = %primary.id,
            "attached secondary contact"
        );
    }

    consolidate(repo, primary.id)
}

fn merge_primaries<R>(
    repo: &mut R,
    mut primaries: Vec<Contact>,
    submission: &Submission,
    now: OffsetDateTime,
) -> Result<ConsolidatedContact, ResolverError>
where
    R: ContactRepository + ?Sized,
{
    primaries.sort_by(creation_order);
    let mut ordered = primaries.into_iter();
    let Some(survivor) = ordered.next() else {
        return Err(ResolverError::DataIntegrity("merge requires a primary contact".to_string()));
    };

    for target in ordered {
        repo.relink_contact(target.id, LinkPrecedence::Secondary, Some(survivor.id), now)?;

        let orphans = repo.find_by_linked_id(target.id)?;
        for orphan in &orphans {
            repo.relink_contact(orphan.id, LinkPrecedence::Secondary, Some(survivor.id), now)?;
        }

        tracing::info!(
            surviving_primary_id = %survivor.id,
            demoted_primary_id = %target.id,
            repointed_secondaries = orphans.len(),
            "merged identity clusters"
        );
    }

    // Merges always record the submission, even when it repeats known values.
    let created = repo.create_contact(&NewContact::secondary(submission, survivor.id, now))?;
    tracing::debug!(contact_id = %created.id, primary_id = %survivor.id, "recorded merge submission");

    consolidate(repo, survivor.id)
}

#[derive(Debug, Default)]
struct OrderedUnique {
    values: Vec<String>,
    seen: BTreeSet<String>,
}

impl OrderedUnique {
    fn push(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        if self.seen.insert(value.to_string()) {
            self.values.push(value.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.values
    }
}
