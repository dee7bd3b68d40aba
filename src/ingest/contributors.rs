//! Author deduplication by email

use crate::classify::{infer_role, infer_team};
use crate::error::StoreError;
use crate::store::CommitStore;
use crate::types::{Contributor, DEFAULT_UNKNOWN, NewContributor};
use std::collections::HashMap;

/// Run-scoped contributor cache, keyed by the email exactly as recorded
///
/// Seeded once from the store; after that the cache is authoritative and the
/// store is only touched to insert contributors seen for the first time.
pub struct ContributorResolver {
    by_email: HashMap<String, Contributor>,
    infer_attributes: bool,
    created: usize,
}

impl ContributorResolver {
    pub fn seed<S: CommitStore + ?Sized>(
        store: &mut S,
        infer_attributes: bool,
    ) -> Result<Self, StoreError> {
        let mut resolver = Self {
            by_email: HashMap::new(),
            infer_attributes,
            created: 0,
        };
        resolver.reload(store)?;
        tracing::debug!("Seeded contributor cache with {} entries", resolver.len());
        Ok(resolver)
    }

    /// Contributor for `email`, created with default attributes on first sight
    pub fn resolve<S: CommitStore + ?Sized>(
        &mut self,
        store: &mut S,
        name: &str,
        email: &str,
    ) -> Result<&Contributor, StoreError> {
        if !self.by_email.contains_key(email) {
            match store.insert_contributor(&self.new_contributor(name, email)) {
                Ok(contributor) => {
                    tracing::debug!("New contributor {} <{}>", name, email);
                    self.created += 1;
                    self.by_email.insert(email.to_string(), contributor);
                }
                // Inserted by someone else since the cache was seeded
                Err(StoreError::Duplicate(_)) => {
                    self.reload(store)?;
                    if !self.by_email.contains_key(email) {
                        return Err(StoreError::NotFound(format!("contributor <{}>", email)));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.by_email
            .get(email)
            .ok_or_else(|| StoreError::NotFound(format!("contributor <{}>", email)))
    }

    /// Number of contributors this resolver inserted
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }

    fn new_contributor(&self, name: &str, email: &str) -> NewContributor {
        let mut contributor = NewContributor::with_defaults(name, email);
        if self.infer_attributes {
            contributor.role = infer_role(email).to_string();
            contributor.team = infer_team(email).to_string();
            contributor.experience_level = DEFAULT_UNKNOWN.to_string();
        }
        contributor
    }

    fn reload<S: CommitStore + ?Sized>(&mut self, store: &mut S) -> Result<(), StoreError> {
        for contributor in store.load_contributors()? {
            self.by_email.insert(contributor.email.clone(), contributor);
        }
        Ok(())
    }
}
