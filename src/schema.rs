use crate::attribute::{AttributeValue, normalize};
use crate::entry::Entry;
use std::collections::HashMap;

/// Metadata the execution core needs about an attribute type. The schema
/// engine that defines syntaxes and hierarchies lives elsewhere; this is the
/// call contract.
#[derive(Debug, Clone)]
pub struct AttributeTypeInfo {
    pub name: String,
    pub oid: String,
    /// Operational attributes live in the entry's operational map and are
    /// not returned to clients by default.
    pub operational: bool,
    /// NO-USER-MODIFICATION types reject external modification.
    pub no_user_modification: bool,
    /// OBSOLETE types reject value-bearing modifications.
    pub obsolete: bool,
    pub single_value: bool,
}

impl AttributeTypeInfo {
    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            oid: String::new(),
            operational: false,
            no_user_modification: false,
            obsolete: false,
            single_value: false,
        }
    }

    pub fn operational(name: &str) -> Self {
        Self {
            operational: true,
            ..Self::user(name)
        }
    }
}

/// The schema engine seam. Implementations decide attribute metadata,
/// per-value syntax acceptability and whole-entry object-class conformance.
pub trait Schema: Send + Sync {
    fn attribute_type(&self, name: &str) -> AttributeTypeInfo;

    /// Validates one value against the attribute's syntax. `Err` carries the
    /// human-readable reason.
    fn value_is_acceptable(&self, attr_type: &str, value: &AttributeValue)
    -> Result<(), String>;

    /// Validates the whole entry against its object classes.
    fn entry_conforms(&self, entry: &Entry) -> Result<(), String>;

    /// Resolves an object class and its superior chain as (name, oid) pairs,
    /// most specific first. Unknown classes resolve to themselves with an
    /// empty OID.
    fn object_class_chain(&self, name: &str) -> Vec<(String, String)>;
}

pub fn is_objectclass_type(attr_type: &str) -> bool {
    normalize(attr_type) == "objectclass"
}

#[derive(Debug, Clone, Default)]
struct ObjectClassDef {
    oid: String,
    superior: Option<String>,
    required_attributes: Vec<String>,
}

/// An in-memory schema with explicit registrations, permissive for anything
/// it has not been told about. Production deployments plug in the real
/// schema engine; this one backs the test suites.
#[derive(Default)]
pub struct CoreSchema {
    attributes: HashMap<String, AttributeTypeInfo>,
    object_classes: HashMap<String, ObjectClassDef>,
    integer_attributes: Vec<String>,
}

impl CoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_attribute(&mut self, info: AttributeTypeInfo) {
        self.attributes.insert(normalize(&info.name), info);
    }

    /// Marks an attribute as integer-syntax; non-integer values for it are
    /// rejected by `value_is_acceptable`.
    pub fn define_integer_attribute(&mut self, name: &str) {
        self.integer_attributes.push(normalize(name));
    }

    pub fn define_object_class(
        &mut self,
        name: &str,
        oid: &str,
        superior: Option<&str>,
        required_attributes: &[&str],
    ) {
        self.object_classes.insert(
            normalize(name),
            ObjectClassDef {
                oid: oid.to_string(),
                superior: superior.map(|s| normalize(s)),
                required_attributes: required_attributes.iter().map(|a| normalize(a)).collect(),
            },
        );
    }
}

impl Schema for CoreSchema {
    fn attribute_type(&self, name: &str) -> AttributeTypeInfo {
        self.attributes
            .get(&normalize(name))
            .cloned()
            .unwrap_or_else(|| AttributeTypeInfo::user(name))
    }

    fn value_is_acceptable(
        &self,
        attr_type: &str,
        value: &AttributeValue,
    ) -> Result<(), String> {
        if self.integer_attributes.contains(&normalize(attr_type))
            && value.as_i64().is_none()
        {
            return Err(format!("value '{}' is not a valid integer", value.raw()));
        }
        Ok(())
    }

    fn entry_conforms(&self, entry: &Entry) -> Result<(), String> {
        for (name, _) in entry.object_classes() {
            let Some(def) = self.object_classes.get(name) else {
                continue;
            };
            for required in &def.required_attributes {
                if entry.get_attribute(required).is_empty()
                    && !entry
                        .dn()
                        .rdn()
                        .is_some_and(|rdn| rdn.has_attribute_type(required))
                {
                    return Err(format!(
                        "entry is missing attribute '{required}' required by object class '{name}'"
                    ));
                }
            }
        }
        Ok(())
    }

    fn object_class_chain(&self, name: &str) -> Vec<(String, String)> {
        let mut chain = Vec::new();
        let mut current = Some(normalize(name));
        while let Some(oc) = current {
            match self.object_classes.get(&oc) {
                Some(def) => {
                    chain.push((oc, def.oid.clone()));
                    current = def.superior.clone();
                }
                None => {
                    chain.push((oc, String::new()));
                    current = None;
                }
            }
            // Defend against registration cycles.
            if chain.len() > 32 {
                break;
            }
        }
        chain
    }
}
