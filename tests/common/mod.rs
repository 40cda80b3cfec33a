#![allow(dead_code)]

use dircore::attribute::Attribute;
use dircore::backend::Backend;
use dircore::config::{CoreConfig, WritabilityMode};
use dircore::context::CoreContext;
use dircore::dn::Dn;
use dircore::entry::Entry;
use dircore::error::{DirectoryError, ResultCode};
use dircore::operation::{
    EntryMatcher, Operation, SearchRequest, SearchScope,
};
use dircore::pwpolicy::state::parse_generalized_time;
use dircore::schema::CoreSchema;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory backend keyed by normalized DN. Just enough storage semantics
/// to drive the executors.
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Entry>>,
    pub writability: Mutex<WritabilityMode>,
    pub private: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            writability: Mutex::new(WritabilityMode::Enabled),
            private: Mutex::new(false),
        }
    }

    pub fn seed(&self, entry: Entry) {
        self.entries
            .lock()
            .insert(entry.dn().normalized().to_string(), entry);
    }

    pub fn stored(&self, dn: &Dn) -> Option<Entry> {
        self.entries.lock().get(dn.normalized()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Backend for MemoryBackend {
    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
        Ok(self.entries.lock().get(dn.normalized()).cloned())
    }

    fn add_entry(&self, entry: Entry, _operation: &Operation) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(entry.dn().normalized()) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {} already exists", entry.dn()),
            ));
        }
        entries.insert(entry.dn().normalized().to_string(), entry);
        Ok(())
    }

    fn delete_entry(&self, dn: &Dn, _operation: &Operation) -> Result<(), DirectoryError> {
        self.entries
            .lock()
            .remove(dn.normalized())
            .map(|_| ())
            .ok_or_else(|| {
                DirectoryError::new(
                    ResultCode::NoSuchObject,
                    format!("entry {dn} does not exist"),
                )
            })
    }

    fn replace_entry(&self, entry: Entry, _operation: &Operation) -> Result<(), DirectoryError> {
        self.entries
            .lock()
            .insert(entry.dn().normalized().to_string(), entry);
        Ok(())
    }

    fn rename_entry(
        &self,
        current_dn: &Dn,
        entry: Entry,
        _operation: &Operation,
    ) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock();
        entries.remove(current_dn.normalized()).ok_or_else(|| {
            DirectoryError::new(
                ResultCode::NoSuchObject,
                format!("entry {current_dn} does not exist"),
            )
        })?;
        entries.insert(entry.dn().normalized().to_string(), entry);
        Ok(())
    }

    fn search(&self, request: &SearchRequest) -> Result<Vec<Entry>, DirectoryError> {
        let entries = self.entries.lock();
        let mut matched = Vec::new();
        for entry in entries.values() {
            let in_scope = match request.scope {
                SearchScope::BaseObject => entry.dn() == &request.base_dn,
                SearchScope::SingleLevel => entry
                    .dn()
                    .parent()
                    .is_some_and(|p| p == request.base_dn),
                SearchScope::WholeSubtree => {
                    entry.dn() == &request.base_dn
                        || entry.dn().is_descendant_of(&request.base_dn)
                }
            };
            if in_scope && request.filter.matches(entry)? {
                matched.push(entry.clone());
            }
        }
        Ok(matched)
    }

    fn has_subordinates(&self, dn: &Dn) -> Result<bool, DirectoryError> {
        Ok(self
            .entries
            .lock()
            .values()
            .any(|e| e.dn().is_descendant_of(dn)))
    }

    fn writability_mode(&self) -> WritabilityMode {
        *self.writability.lock()
    }

    fn is_private_backend(&self) -> bool {
        *self.private.lock()
    }
}

/// Matches every entry.
pub struct MatchAll;

impl EntryMatcher for MatchAll {
    fn matches(&self, _entry: &Entry) -> Result<bool, DirectoryError> {
        Ok(true)
    }
}

/// Matches entries holding a specific attribute value.
pub struct HasValue {
    pub attr_type: String,
    pub value: String,
}

impl EntryMatcher for HasValue {
    fn matches(&self, entry: &Entry) -> Result<bool, DirectoryError> {
        Ok(entry
            .get_attribute(&self.attr_type)
            .iter()
            .any(|a| a.contains(&self.value.as_str().into())))
    }
}

pub fn dn(text: &str) -> Dn {
    Dn::parse(text).expect("test DN parses")
}

/// A schema with the object classes the fixtures use.
pub fn test_schema() -> CoreSchema {
    let mut schema = CoreSchema::new();
    schema.define_object_class("top", "2.5.6.0", None, &[]);
    schema.define_object_class("organization", "2.5.6.4", Some("top"), &[]);
    schema.define_object_class("organizationalUnit", "2.5.6.5", Some("top"), &[]);
    schema.define_object_class("person", "2.5.6.6", Some("top"), &["sn"]);
    schema.define_integer_attribute("loginCount");
    schema
}

/// Builds an entry from `(attribute, values)` pairs, expanding object
/// classes through the schema.
pub fn entry_with(dn_text: &str, attrs: &[(&str, &[&str])]) -> Entry {
    let schema = test_schema();
    let mut entry = Entry::new(dn(dn_text));
    let mut sink = Vec::new();
    for (name, values) in attrs {
        let attr = Attribute::of(name, values);
        if name.eq_ignore_ascii_case("objectclass") {
            entry
                .add_object_classes(attr.values(), &schema)
                .expect("object classes");
        } else {
            entry.add_attribute(&attr, &mut sink);
        }
    }
    entry
}

pub fn person(dn_text: &str, sn: &str) -> Entry {
    let cn = dn(dn_text)
        .rdn()
        .and_then(|r| r.value_for("cn").or(r.value_for("uid")).cloned())
        .map(|v| v.raw().to_string())
        .unwrap_or_else(|| "x".to_string());
    entry_with(
        dn_text,
        &[
            ("objectClass", &["person"]),
            ("cn", &[cn.as_str()]),
            ("sn", &[sn]),
        ],
    )
}

/// A context over a seeded memory backend with a pinned clock and the test
/// schema.
pub fn seeded_context(entries: Vec<Entry>) -> (Arc<MemoryBackend>, CoreContext) {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(entry_with("o=example", &[("objectClass", &["organization"]), ("o", &["example"])]));
    backend.seed(entry_with(
        "ou=people,o=example",
        &[("objectClass", &["organizationalUnit"]), ("ou", &["people"])],
    ));
    for entry in entries {
        backend.seed(entry);
    }
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(|| test_now());
    (backend, ctx)
}

/// The pinned instant every test context runs at.
pub fn test_now() -> chrono::DateTime<chrono::Utc> {
    parse_generalized_time("20260801120000Z").expect("pinned clock")
}
