use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single attribute value. Equality and hashing use the normalized form
/// (case-folded, whitespace-trimmed) so that `CN=Foo` and `cn=foo` compare
/// equal the way directory matching rules expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeValue {
    raw: String,
    normalized: String,
}

impl AttributeValue {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let normalized = normalize(&raw);
        Self { raw, normalized }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.raw.trim().parse().ok()
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for AttributeValue {}

impl std::hash::Hash for AttributeValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for AttributeValue {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for AttributeValue {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

pub(crate) fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// One attribute instance: a type, an option set and an ordered value list.
/// Two instances of the same type with different option sets are distinct
/// attributes for modification purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Normalized attribute type name.
    attr_type: String,
    /// The name as the client supplied it, preserved for messages.
    name: String,
    options: BTreeSet<String>,
    values: Vec<AttributeValue>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<AttributeValue>) -> Self {
        let name = name.into();
        Self {
            attr_type: normalize(&name),
            name,
            options: BTreeSet::new(),
            values,
        }
    }

    pub fn with_options(
        name: impl Into<String>,
        options: impl IntoIterator<Item = String>,
        values: Vec<AttributeValue>,
    ) -> Self {
        let name = name.into();
        Self {
            attr_type: normalize(&name),
            name,
            options: options.into_iter().map(|o| normalize(&o)).collect(),
            values,
        }
    }

    pub fn of(name: &str, values: &[&str]) -> Self {
        Self::new(name, values.iter().map(|v| AttributeValue::new(*v)).collect())
    }

    pub fn attr_type(&self) -> &str {
        &self.attr_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BTreeSet<String> {
        &self.options
    }

    pub fn has_options(&self) -> bool {
        !self.options.is_empty()
    }

    pub fn options_equal(&self, other: &BTreeSet<String>) -> bool {
        self.options == *other
    }

    pub fn values(&self) -> &[AttributeValue] {
        &self.values
    }

    pub fn has_value(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn contains(&self, value: &AttributeValue) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn set_values(&mut self, values: Vec<AttributeValue>) {
        self.values = values;
    }

    /// Appends a value, keeping existing duplicates out. Returns false if the
    /// value was already present.
    pub fn add_value(&mut self, value: AttributeValue) -> bool {
        if self.contains(&value) {
            return false;
        }
        self.values.push(value);
        true
    }

    /// Removes one value. Returns false if it was not present.
    pub fn remove_value(&mut self, value: &AttributeValue) -> bool {
        let before = self.values.len();
        self.values.retain(|v| v != value);
        self.values.len() != before
    }
}

/// Renders a value list for inclusion in an error message.
pub(crate) fn join_values(values: &[AttributeValue]) -> String {
    values
        .iter()
        .map(AttributeValue::raw)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::{Attribute, AttributeValue};

    #[test]
    fn value_equality_is_case_insensitive() {
        assert_eq!(AttributeValue::new("Foo"), AttributeValue::new("  foo "));
        assert_ne!(AttributeValue::new("foo"), AttributeValue::new("bar"));
    }

    #[test]
    fn options_distinguish_instances() {
        let plain = Attribute::of("description", &["x"]);
        let tagged = Attribute::with_options(
            "description",
            vec!["lang-en".to_string()],
            vec![AttributeValue::new("x")],
        );
        assert_eq!(plain.attr_type(), tagged.attr_type());
        assert!(!plain.options_equal(tagged.options()));
    }

    #[test]
    fn add_value_rejects_duplicates() {
        let mut attr = Attribute::of("cn", &["alpha"]);
        assert!(!attr.add_value(AttributeValue::new("ALPHA")));
        assert!(attr.add_value(AttributeValue::new("beta")));
        assert_eq!(attr.values().len(), 2);
    }
}
