use time::OffsetDateTime;

use crate::{
    creation_order, resolve, ConsolidatedContact, Contact, ContactId, ContactRepository,
    LinkPrecedence, NewContact, ResolverError, Submission,
};

/// Process-local [`ContactRepository`] for tests and benchmarks.
///
/// `identify` stages every write on a copy and publishes it only when the whole
/// resolution succeeded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContactStore {
    contacts: Vec<Contact>,
    last_id: i64,
}

impl InMemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored rows in id order, soft-deleted ones included.
    #[must_use]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Resolve a submission atomically.
    ///
    /// # Errors
    /// Propagates any [`ResolverError`] from [`resolve`]; the store is left unchanged.
    pub fn identify(
        &mut self,
        submission: &Submission,
        now: OffsetDateTime,
    ) -> Result<ConsolidatedContact, ResolverError> {
        let mut staged = self.clone();
        let contact = resolve(&mut staged, submission, now)?;
        *self = staged;
        Ok(contact)
    }

    /// Mark a contact deleted so it stops matching and consolidating.
    ///
    /// # Errors
    /// Returns [`ResolverError::NotFound`] when no row has `id`.
    pub fn soft_delete(&mut self, id: ContactId, at: OffsetDateTime) -> Result<(), ResolverError> {
        let contact = self.row_mut(id).ok_or(ResolverError::NotFound(id))?;
        contact.deleted_at = Some(at);
        contact.updated_at = at;
        Ok(())
    }

    fn row_mut(&mut self, id: ContactId) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|contact| contact.id == id)
    }

    fn live(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|contact| !contact.is_deleted())
    }
}

fn in_creation_order(mut contacts: Vec<Contact>) -> Vec<Contact> {
    contacts.sort_by(creation_order);
    contacts
}

impl ContactRepository for InMemoryContactStore {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, ResolverError> {
        let matches = self
            .live()
            .filter(|contact| {
                let email_match = email.is_some() && contact.email.as_deref() == email;
                let phone_match =
                    phone_number.is_some() && contact.phone_number.as_deref() == phone_number;
                email_match || phone_match
            })
            .cloned()
            .collect();
        Ok(in_creation_order(matches))
    }

    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, ResolverError> {
        Ok(self.contacts.iter().find(|contact| contact.id == id).cloned())
    }

    fn find_by_linked_id(&self, id: ContactId) -> Result<Vec<Contact>, ResolverError> {
        let linked = self.live().filter(|contact| contact.linked_id == Some(id)).cloned().collect();
        Ok(in_creation_order(linked))
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>, ResolverError> {
        let members = self
            .live()
            .filter(|contact| contact.id == primary_id || contact.linked_id == Some(primary_id))
            .cloned()
            .collect();
        Ok(in_creation_order(members))
    }

    fn create_contact(&mut self, contact: &NewContact) -> Result<Contact, ResolverError> {
        contact.validate()?;
        self.last_id += 1;
        let stored = Contact {
            id: ContactId(self.last_id),
            email: contact.email.clone(),
            phone_number: contact.phone_number.clone(),
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: contact.created_at,
            updated_at: contact.created_at,
            deleted_at: None,
        };
        self.contacts.push(stored.clone());
        Ok(stored)
    }

    fn relink_contact(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
        updated_at: OffsetDateTime,
    ) -> Result<(), ResolverError> {
        let Some(contact) = self.row_mut(id) else {
            return Err(ResolverError::Store(format!("cannot relink missing contact {id}")));
        };
        contact.link_precedence = link_precedence;
        contact.linked_id = linked_id;
        contact.updated_at = updated_at;
        Ok(())
    }
}
