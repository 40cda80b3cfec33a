use crate::config::WritabilityMode;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::operation::{Operation, SearchRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// The storage partition a subtree of the DN namespace lives in. Durable
/// storage and indexing are implemented elsewhere; this is the call contract
/// the execution core drives commits through.
pub trait Backend: Send + Sync {
    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError>;

    fn entry_exists(&self, dn: &Dn) -> Result<bool, DirectoryError> {
        Ok(self.get_entry(dn)?.is_some())
    }

    fn add_entry(&self, entry: Entry, operation: &Operation) -> Result<(), DirectoryError>;

    fn delete_entry(&self, dn: &Dn, operation: &Operation) -> Result<(), DirectoryError>;

    fn replace_entry(&self, entry: Entry, operation: &Operation) -> Result<(), DirectoryError>;

    fn rename_entry(
        &self,
        current_dn: &Dn,
        entry: Entry,
        operation: &Operation,
    ) -> Result<(), DirectoryError>;

    /// Runs a search and returns the matching entries in no particular
    /// order. Filter evaluation belongs to the search engine behind this
    /// seam.
    fn search(&self, request: &SearchRequest) -> Result<Vec<Entry>, DirectoryError>;

    fn has_subordinates(&self, dn: &Dn) -> Result<bool, DirectoryError>;

    /// Private backends hold server-internal data (configuration, schema,
    /// monitoring) and reject external mutation.
    fn is_private_backend(&self) -> bool {
        false
    }

    fn writability_mode(&self) -> WritabilityMode {
        WritabilityMode::Enabled
    }

    /// Whether this backend natively supports a request control the core
    /// does not recognize.
    fn supports_control(&self, _oid: &str) -> bool {
        false
    }
}

/// The access-control decision engine seam.
pub trait AccessControlHandler: Send + Sync {
    /// Whether the operation as a whole is allowed.
    fn is_allowed(&self, operation: &Operation) -> bool;

    /// Whether one specific request control may be used against the target.
    fn is_control_allowed(&self, target: &Dn, operation: &Operation, oid: &str) -> bool;
}

/// Allows everything; the default when no access-control engine is wired in.
pub struct AllowAllAccessControl;

impl AccessControlHandler for AllowAllAccessControl {
    fn is_allowed(&self, _operation: &Operation) -> bool {
        true
    }

    fn is_control_allowed(&self, _target: &Dn, _operation: &Operation, _oid: &str) -> bool {
        true
    }
}

/// Change notification fan-out seam. Best effort: listener failures are
/// logged by the caller, never propagated.
pub trait ChangeNotificationListener: Send + Sync {
    fn handle_add(&self, operation: &Operation, entry: &Entry);
    fn handle_delete(&self, operation: &Operation, entry: &Entry);
    fn handle_modify(&self, operation: &Operation, before: &Entry, after: &Entry);
    fn handle_modify_dn(&self, operation: &Operation, before: &Entry, after: &Entry);
}

/// The entry change types a persistent search subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PersistentChangeType {
    Add,
    Delete,
    Modify,
    ModifyDn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSearchSpec {
    pub change_types: BTreeSet<PersistentChangeType>,
    /// When set, the initial search is suppressed and only subsequent
    /// changes are streamed.
    pub changes_only: bool,
    pub return_entry_change_controls: bool,
}

#[derive(Debug, Clone)]
pub struct PersistentSearchRegistration {
    pub id: u64,
    pub base_dn: Dn,
    pub spec: PersistentSearchSpec,
}

/// Standing persistent-search subscriptions. Insert/remove is the only
/// mutation and happens outside any entry lock; change fan-out itself is an
/// external collaborator.
#[derive(Default)]
pub struct PersistentSearchRegistry {
    next_id: AtomicU64,
    registrations: Mutex<Vec<PersistentSearchRegistration>>,
}

impl PersistentSearchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, base_dn: Dn, spec: PersistentSearchSpec) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .push(PersistentSearchRegistration { id, base_dn, spec });
        id
    }

    pub fn deregister(&self, id: u64) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn registrations(&self) -> Vec<PersistentSearchRegistration> {
        self.registrations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle type used throughout the core for registry entries.
pub type BackendRef = Arc<dyn Backend>;

#[cfg(test)]
mod tests {
    use super::{PersistentChangeType, PersistentSearchRegistry, PersistentSearchSpec};
    use crate::dn::Dn;
    use std::collections::BTreeSet;

    #[test]
    fn registry_insert_and_remove() {
        let registry = PersistentSearchRegistry::new();
        let spec = PersistentSearchSpec {
            change_types: BTreeSet::from([PersistentChangeType::Add]),
            changes_only: true,
            return_entry_change_controls: false,
        };
        let id = registry.register(Dn::parse("o=example").unwrap(), spec);
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister(id));
        assert!(registry.is_empty());
        assert!(!registry.deregister(id));
    }
}
