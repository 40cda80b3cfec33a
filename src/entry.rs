use crate::attribute::{Attribute, AttributeValue, normalize};
use crate::dn::Dn;
use crate::error::{DirectoryError, ResultCode};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A directory entry: a DN, an object-class set and user/operational
/// attribute maps. Each map holds one `Attribute` instance per distinct
/// option set of a type.
///
/// During Modify and ModifyDN two instances exist at once: the immutable
/// current entry read from the backend and the working duplicate mutated by
/// the pipeline. Only the working entry is ever committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    /// Normalized object-class name mapped to its OID.
    object_classes: BTreeMap<String, String>,
    user_attributes: BTreeMap<String, Vec<Attribute>>,
    operational_attributes: BTreeMap<String, Vec<Attribute>>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            object_classes: BTreeMap::new(),
            user_attributes: BTreeMap::new(),
            operational_attributes: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// A mutable copy for pipeline processing.
    pub fn duplicate(&self) -> Entry {
        self.clone()
    }

    pub fn object_classes(&self) -> &BTreeMap<String, String> {
        &self.object_classes
    }

    pub fn has_object_class(&self, name: &str) -> bool {
        self.object_classes.contains_key(&normalize(name))
    }

    /// Merges object-class values into the entry, extending each with its
    /// superior chain. A class that is already directly present is a
    /// duplicate-value failure.
    pub fn add_object_classes(
        &mut self,
        values: &[AttributeValue],
        schema: &dyn Schema,
    ) -> Result<(), DirectoryError> {
        for value in values {
            if self.object_classes.contains_key(value.normalized()) {
                return Err(DirectoryError::new(
                    ResultCode::AttributeOrValueExists,
                    format!(
                        "entry {} already has object class {}",
                        self.dn,
                        value.raw()
                    ),
                ));
            }
            for (name, oid) in schema.object_class_chain(value.normalized()) {
                self.object_classes.entry(name).or_insert(oid);
            }
        }
        Ok(())
    }

    /// Replaces the object-class set wholesale, expanding superior chains.
    pub fn set_object_classes(&mut self, values: &[AttributeValue], schema: &dyn Schema) {
        self.object_classes.clear();
        for value in values {
            for (name, oid) in schema.object_class_chain(value.normalized()) {
                self.object_classes.entry(name).or_insert(oid);
            }
        }
    }

    /// All instances of an attribute type, searching user attributes first
    /// and operational attributes second.
    pub fn get_attribute(&self, attr_type: &str) -> Vec<&Attribute> {
        let attr_type = normalize(attr_type);
        self.user_attributes
            .get(&attr_type)
            .into_iter()
            .chain(self.operational_attributes.get(&attr_type))
            .flatten()
            .collect()
    }

    /// The instance of a type whose option set matches exactly.
    pub fn get_attribute_with_options(
        &self,
        attr_type: &str,
        options: &BTreeSet<String>,
    ) -> Option<&Attribute> {
        self.get_attribute(attr_type)
            .into_iter()
            .find(|a| a.options_equal(options))
    }

    pub fn has_attribute(&self, attr_type: &str) -> bool {
        !self.get_attribute(attr_type).is_empty()
    }

    pub fn has_value(
        &self,
        attr_type: &str,
        options: &BTreeSet<String>,
        value: &AttributeValue,
    ) -> bool {
        self.get_attribute_with_options(attr_type, options)
            .is_some_and(|a| a.contains(value))
    }

    /// First value of an attribute type, across all option sets.
    pub fn first_value(&self, attr_type: &str) -> Option<&AttributeValue> {
        self.get_attribute(attr_type)
            .into_iter()
            .flat_map(|a| a.values())
            .next()
    }

    fn map_for(&mut self, operational: bool) -> &mut BTreeMap<String, Vec<Attribute>> {
        if operational {
            &mut self.operational_attributes
        } else {
            &mut self.user_attributes
        }
    }

    fn map_containing(&mut self, attr_type: &str) -> &mut BTreeMap<String, Vec<Attribute>> {
        if self.operational_attributes.contains_key(attr_type) {
            &mut self.operational_attributes
        } else {
            &mut self.user_attributes
        }
    }

    /// Merges an attribute into the entry, reporting values that were
    /// already present for the same type and option set into `duplicates`.
    pub fn add_attribute(&mut self, attr: &Attribute, duplicates: &mut Vec<AttributeValue>) {
        self.add_attribute_in(attr, duplicates, false);
    }

    pub fn add_operational_attribute(
        &mut self,
        attr: &Attribute,
        duplicates: &mut Vec<AttributeValue>,
    ) {
        self.add_attribute_in(attr, duplicates, true);
    }

    fn add_attribute_in(
        &mut self,
        attr: &Attribute,
        duplicates: &mut Vec<AttributeValue>,
        operational: bool,
    ) {
        let attr_type = attr.attr_type().to_string();
        let operational = operational || self.operational_attributes.contains_key(&attr_type);
        let instances = self.map_for(operational).entry(attr_type).or_default();
        if let Some(existing) = instances
            .iter_mut()
            .find(|a| a.options_equal(attr.options()))
        {
            for value in attr.values() {
                if !existing.add_value(value.clone()) {
                    duplicates.push(value.clone());
                }
            }
        } else {
            instances.push(attr.clone());
        }
    }

    /// Removes attribute values (or, when `attr` carries no values, whole
    /// instances) from the entry. Values that were not present are reported
    /// into `missing`. Returns false when the attribute type was absent
    /// entirely.
    pub fn remove_attribute(
        &mut self,
        attr: &Attribute,
        missing: &mut Vec<AttributeValue>,
    ) -> bool {
        let attr_type = attr.attr_type().to_string();
        let map = self.map_containing(&attr_type);
        let Some(instances) = map.get_mut(&attr_type) else {
            return false;
        };
        if !attr.has_value() {
            if attr.has_options() {
                let before = instances.len();
                instances.retain(|a| !a.options_equal(attr.options()));
                let removed = instances.len() != before;
                if instances.is_empty() {
                    map.remove(&attr_type);
                }
                return removed;
            }
            map.remove(&attr_type);
            return true;
        }
        let Some(existing) = instances
            .iter_mut()
            .find(|a| a.options_equal(attr.options()))
        else {
            missing.extend(attr.values().iter().cloned());
            return true;
        };
        for value in attr.values() {
            if !existing.remove_value(value) {
                missing.push(value.clone());
            }
        }
        if !existing.has_value() {
            instances.retain(|a| a.has_value());
        }
        if instances.is_empty() {
            map.remove(&attr_type);
        }
        true
    }

    /// Removes every instance of a type matching the option set exactly
    /// (or all instances when no options are given).
    pub fn remove_attribute_type(&mut self, attr_type: &str, options: &BTreeSet<String>) {
        let attr_type = normalize(attr_type);
        let map = self.map_containing(&attr_type);
        if options.is_empty() {
            map.remove(&attr_type);
            return;
        }
        if let Some(instances) = map.get_mut(&attr_type) {
            instances.retain(|a| !a.options_equal(options));
            if instances.is_empty() {
                map.remove(&attr_type);
            }
        }
    }

    /// Replaces the full instance list for a type.
    pub fn put_attribute(&mut self, attr_type: &str, instances: Vec<Attribute>) {
        let attr_type = normalize(attr_type);
        let map = self.map_containing(&attr_type);
        if instances.is_empty() {
            map.remove(&attr_type);
        } else {
            map.insert(attr_type, instances);
        }
    }

    /// Overwrites the instance of a type matching the attribute's option set
    /// exactly, or appends a new instance when no match exists.
    pub fn replace_attribute_instance(&mut self, attr: &Attribute) {
        let attr_type = attr.attr_type().to_string();
        let map = self.map_containing(&attr_type);
        let instances = map.entry(attr_type).or_default();
        match instances
            .iter_mut()
            .find(|a| a.options_equal(attr.options()))
        {
            Some(existing) => *existing = attr.clone(),
            None => instances.push(attr.clone()),
        }
    }

    pub fn user_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.user_attributes.values().flatten()
    }

    pub fn operational_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.operational_attributes.values().flatten()
    }

    pub fn all_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.user_attributes().chain(self.operational_attributes())
    }

    /// Whether every RDN attribute value is still present among the entry's
    /// attribute values for the corresponding type.
    pub fn rdn_values_present(&self) -> bool {
        let Some(rdn) = self.dn.rdn() else {
            return true;
        };
        rdn.avas().iter().all(|ava| {
            self.get_attribute(&ava.attr_type)
                .iter()
                .any(|a| a.contains(&ava.value))
        })
    }
}
