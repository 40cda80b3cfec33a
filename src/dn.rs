use crate::attribute::{AttributeValue, normalize};
use crate::error::{DirectoryError, ResultCode};
use serde::{Deserialize, Serialize};

/// One attribute-value assertion within an RDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ava {
    /// Attribute name as written in the DN.
    pub name: String,
    /// Normalized attribute type.
    pub attr_type: String,
    pub value: AttributeValue,
}

/// A relative distinguished name: one or more AVAs joined with `+`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    pub fn has_attribute_type(&self, attr_type: &str) -> bool {
        let attr_type = normalize(attr_type);
        self.avas.iter().any(|ava| ava.attr_type == attr_type)
    }

    pub fn value_for(&self, attr_type: &str) -> Option<&AttributeValue> {
        let attr_type = normalize(attr_type);
        self.avas
            .iter()
            .find(|ava| ava.attr_type == attr_type)
            .map(|ava| &ava.value)
    }
}

impl std::fmt::Display for Rdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.name, ava.value.raw())?;
        }
        Ok(())
    }
}

/// A distinguished name. Comparison, hashing and lock keying use the
/// normalized rendering; the raw rendering is preserved for messages and
/// response encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dn {
    raw: String,
    normalized: String,
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The null DN (the root DSE), used for anonymous authorization
    /// identities.
    pub fn null() -> Self {
        Self {
            raw: String::new(),
            normalized: String::new(),
            rdns: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DirectoryError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::null());
        }
        let mut rdns = Vec::new();
        for component in split_unescaped(trimmed, ',') {
            let component = component.trim();
            if component.is_empty() {
                return Err(invalid_dn(raw, "empty RDN component"));
            }
            let mut avas = Vec::new();
            for ava_text in split_unescaped(component, '+') {
                let Some((name, value)) = ava_text.split_once('=') else {
                    return Err(invalid_dn(raw, "attribute-value assertion missing '='"));
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(invalid_dn(raw, "empty attribute type"));
                }
                avas.push(Ava {
                    name: name.to_string(),
                    attr_type: normalize(name),
                    value: AttributeValue::new(unescape(value.trim())),
                });
            }
            rdns.push(Rdn { avas });
        }
        let normalized = rdns
            .iter()
            .map(|rdn| {
                rdn.avas
                    .iter()
                    .map(|ava| format!("{}={}", ava.attr_type, ava.value.normalized()))
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect::<Vec<_>>()
            .join(",");
        Ok(Self {
            raw: trimmed.to_string(),
            normalized,
            rdns,
        })
    }

    pub fn is_null(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// The leading RDN, or `None` for the null DN.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The immediate superior of this DN, or `None` at the namespace root.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.len() < 2 {
            return None;
        }
        let raw = split_unescaped(&self.raw, ',')
            .into_iter()
            .skip(1)
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Dn::parse(&raw).ok()
    }

    /// Walks from the immediate parent up to the namespace root.
    pub fn ancestors(&self) -> Vec<Dn> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(dn) = current {
            current = dn.parent();
            out.push(dn);
        }
        out
    }

    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        if ancestor.is_null() {
            return !self.is_null();
        }
        self.normalized.len() > ancestor.normalized.len()
            && self.normalized.ends_with(&ancestor.normalized)
            && self.normalized.as_bytes()[self.normalized.len() - ancestor.normalized.len() - 1]
                == b','
    }

    /// Builds the DN obtained by replacing this DN's RDN with `new_rdn`,
    /// optionally under a different superior.
    pub fn rename(&self, new_rdn: &Rdn, new_superior: Option<&Dn>) -> Result<Dn, DirectoryError> {
        let superior = match new_superior {
            Some(dn) => Some(dn.clone()),
            None => self.parent(),
        };
        let raw = match superior {
            Some(parent) if !parent.is_null() => format!("{},{}", new_rdn, parent.raw()),
            _ => new_rdn.to_string(),
        };
        Dn::parse(&raw)
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl std::fmt::Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn invalid_dn(raw: &str, reason: &str) -> DirectoryError {
    DirectoryError::new(
        ResultCode::InvalidDnSyntax,
        format!("invalid DN '{raw}': {reason}"),
    )
}

fn split_unescaped(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}
