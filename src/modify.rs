use crate::attribute::{Attribute, AttributeValue, join_values};
use crate::config::SyntaxEnforcementPolicy;
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::schema::{Schema, is_objectclass_type};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
    Increment,
}

impl std::fmt::Display for ModificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModificationType::Add => "add",
            ModificationType::Delete => "delete",
            ModificationType::Replace => "replace",
            ModificationType::Increment => "increment",
        };
        f.write_str(name)
    }
}

/// One attribute modification, owned by the operation for the duration of
/// processing and applied in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modification {
    pub mod_type: ModificationType,
    pub attribute: Attribute,
    /// Internal modifications (staged password-policy state updates) bypass
    /// the user-modification gates.
    pub internal: bool,
}

impl Modification {
    pub fn new(mod_type: ModificationType, attribute: Attribute) -> Self {
        Self {
            mod_type,
            attribute,
            internal: false,
        }
    }

    pub fn add(attribute: Attribute) -> Self {
        Self::new(ModificationType::Add, attribute)
    }

    pub fn delete(attribute: Attribute) -> Self {
        Self::new(ModificationType::Delete, attribute)
    }

    pub fn replace(attribute: Attribute) -> Self {
        Self::new(ModificationType::Replace, attribute)
    }

    pub fn increment(attribute: Attribute) -> Self {
        Self::new(ModificationType::Increment, attribute)
    }

    pub(crate) fn internal_replace(attribute: Attribute) -> Self {
        Self {
            internal: true,
            ..Self::replace(attribute)
        }
    }
}

/// Everything the modification engine needs besides the working entry.
#[derive(Clone, Copy)]
pub struct ModifyContext<'a> {
    pub schema: &'a dyn Schema,
    pub check_schema: bool,
    pub syntax_policy: SyntaxEnforcementPolicy,
    pub is_synchronization: bool,
}

impl ModifyContext<'_> {
    fn syntax_checked(&self) -> bool {
        self.check_schema && !self.is_synchronization
    }
}

/// Applies an ordered modification sequence to the working entry,
/// short-circuiting on the first failure. The caller must discard the
/// partially mutated entry on error and never commit it.
pub fn apply_modifications(
    entry: &mut Entry,
    modifications: &[Modification],
    ctx: ModifyContext<'_>,
) -> Result<(), DirectoryError> {
    for modification in modifications {
        apply_modification(entry, modification, ctx)?;
    }
    Ok(())
}

pub fn apply_modification(
    entry: &mut Entry,
    modification: &Modification,
    ctx: ModifyContext<'_>,
) -> Result<(), DirectoryError> {
    match modification.mod_type {
        ModificationType::Add => apply_add(entry, &modification.attribute, ctx),
        ModificationType::Delete => apply_delete(entry, &modification.attribute),
        ModificationType::Replace => apply_replace(entry, &modification.attribute, ctx),
        ModificationType::Increment => apply_increment(entry, &modification.attribute),
    }
}

/// After all modifications apply, the working entry must still conform to
/// the server schema before it is eligible for commit.
pub fn check_entry_conformance(
    entry: &Entry,
    ctx: ModifyContext<'_>,
) -> Result<(), DirectoryError> {
    if !ctx.syntax_checked() {
        return Ok(());
    }
    ctx.schema.entry_conforms(entry).map_err(|reason| {
        DirectoryError::new(
            ResultCode::ObjectClassViolation,
            format!("entry {} violates the server schema: {reason}", entry.dn()),
        )
    })
}

fn check_value_syntax(
    entry: &Entry,
    attr: &Attribute,
    ctx: ModifyContext<'_>,
    mod_type: ModificationType,
) -> Result<(), DirectoryError> {
    if !ctx.syntax_checked() {
        return Ok(());
    }
    for value in attr.values() {
        if let Err(reason) = ctx.schema.value_is_acceptable(attr.attr_type(), value) {
            match ctx.syntax_policy {
                SyntaxEnforcementPolicy::Reject => {
                    return Err(DirectoryError::new(
                        ResultCode::InvalidAttributeSyntax,
                        format!(
                            "value '{}' for attribute {} in entry {} violates the \
                             attribute syntax during {mod_type}: {reason}",
                            value.raw(),
                            attr.name(),
                            entry.dn(),
                        ),
                    ));
                }
                SyntaxEnforcementPolicy::Warn => {
                    warn!(
                        entry = %entry.dn(),
                        attribute = attr.name(),
                        value = value.raw(),
                        reason,
                        "attribute value violates its syntax"
                    );
                }
                SyntaxEnforcementPolicy::Accept => {}
            }
        }
    }
    Ok(())
}

fn apply_add(
    entry: &mut Entry,
    attr: &Attribute,
    ctx: ModifyContext<'_>,
) -> Result<(), DirectoryError> {
    if !attr.has_value() {
        return Err(DirectoryError::new(
            ResultCode::ProtocolError,
            format!(
                "add modification of attribute {} in entry {} contains no values",
                attr.name(),
                entry.dn()
            ),
        ));
    }
    check_value_syntax(entry, attr, ctx, ModificationType::Add)?;
    if is_objectclass_type(attr.attr_type()) {
        return entry.add_object_classes(attr.values(), ctx.schema);
    }
    let mut duplicates = Vec::new();
    entry.add_attribute(attr, &mut duplicates);
    if !duplicates.is_empty() {
        return Err(DirectoryError::new(
            ResultCode::AttributeOrValueExists,
            format!(
                "entry {} already contains values for attribute {}: {}",
                entry.dn(),
                attr.name(),
                join_values(&duplicates)
            ),
        ));
    }
    Ok(())
}

fn apply_delete(entry: &mut Entry, attr: &Attribute) -> Result<(), DirectoryError> {
    let mut missing = Vec::new();
    let existed = entry.remove_attribute(attr, &mut missing);
    if !existed {
        return Err(DirectoryError::new(
            ResultCode::NoSuchAttribute,
            format!(
                "entry {} has no attribute {} to delete",
                entry.dn(),
                attr.name()
            ),
        ));
    }
    if !missing.is_empty() {
        return Err(DirectoryError::new(
            ResultCode::NoSuchAttribute,
            format!(
                "entry {} does not contain values for attribute {}: {}",
                entry.dn(),
                attr.name(),
                join_values(&missing)
            ),
        ));
    }
    check_rdn_preserved(entry, attr)
}

fn apply_replace(
    entry: &mut Entry,
    attr: &Attribute,
    ctx: ModifyContext<'_>,
) -> Result<(), DirectoryError> {
    if is_objectclass_type(attr.attr_type()) {
        entry.set_object_classes(attr.values(), ctx.schema);
        return Ok(());
    }
    if !attr.has_value() {
        // An empty-valued replace removes the attribute, subject to the RDN
        // invariant.
        entry.remove_attribute_type(attr.attr_type(), attr.options());
        return check_rdn_preserved(entry, attr);
    }
    check_value_syntax(entry, attr, ctx, ModificationType::Replace)?;
    entry.replace_attribute_instance(attr);
    check_rdn_preserved(entry, attr)
}

fn apply_increment(entry: &mut Entry, attr: &Attribute) -> Result<(), DirectoryError> {
    if entry
        .dn()
        .rdn()
        .is_some_and(|rdn| rdn.has_attribute_type(attr.attr_type()))
    {
        return Err(DirectoryError::new(
            ResultCode::NotAllowedOnRdn,
            format!(
                "increment of attribute {} in entry {} targets an RDN attribute",
                attr.name(),
                entry.dn()
            ),
        ));
    }
    let amount = match attr.values() {
        [single] => single.as_i64().ok_or_else(|| {
            DirectoryError::new(
                ResultCode::InvalidAttributeSyntax,
                format!(
                    "increment amount '{}' for attribute {} in entry {} is not an integer",
                    single.raw(),
                    attr.name(),
                    entry.dn()
                ),
            )
        })?,
        [] => {
            return Err(DirectoryError::new(
                ResultCode::ProtocolError,
                format!(
                    "increment of attribute {} in entry {} requires a value",
                    attr.name(),
                    entry.dn()
                ),
            ));
        }
        _ => {
            return Err(DirectoryError::new(
                ResultCode::ProtocolError,
                format!(
                    "increment of attribute {} in entry {} requires exactly one value",
                    attr.name(),
                    entry.dn()
                ),
            ));
        }
    };
    let existing = entry
        .get_attribute_with_options(attr.attr_type(), attr.options())
        .cloned()
        .ok_or_else(|| constraint_violation_no_value(entry, attr))?;
    let current = match existing.values() {
        [single] => single.as_i64().ok_or_else(|| {
            DirectoryError::new(
                ResultCode::InvalidAttributeSyntax,
                format!(
                    "existing value '{}' of attribute {} in entry {} is not an integer",
                    single.raw(),
                    attr.name(),
                    entry.dn()
                ),
            )
        })?,
        _ => return Err(constraint_violation_no_value(entry, attr)),
    };
    let mut updated = existing;
    updated.set_values(vec![AttributeValue::new((current + amount).to_string())]);
    entry.replace_attribute_instance(&updated);
    Ok(())
}

fn constraint_violation_no_value(entry: &Entry, attr: &Attribute) -> DirectoryError {
    DirectoryError::new(
        ResultCode::ConstraintViolation,
        format!(
            "increment of attribute {} in entry {} requires exactly one existing integer value",
            attr.name(),
            entry.dn()
        ),
    )
}

fn check_rdn_preserved(entry: &Entry, attr: &Attribute) -> Result<(), DirectoryError> {
    let Some(rdn) = entry.dn().rdn() else {
        return Ok(());
    };
    if rdn.has_attribute_type(attr.attr_type())
        && rdn
            .value_for(attr.attr_type())
            .is_some_and(|value| !entry.has_value(attr.attr_type(), attr.options(), value))
    {
        return Err(DirectoryError::new(
            ResultCode::NotAllowedOnRdn,
            format!(
                "modification of attribute {} would remove an RDN value of entry {}",
                attr.name(),
                entry.dn()
            ),
        ));
    }
    Ok(())
}

/// Leniently merges staged state-update modifications (password-policy
/// counters and timestamps) into the working entry. Duplicates and missing
/// values are ignored; these updates never fail the primary operation.
pub fn apply_state_updates(entry: &mut Entry, modifications: &[Modification]) {
    for modification in modifications {
        match modification.mod_type {
            ModificationType::Add => {
                let mut duplicates = Vec::new();
                entry.add_attribute(&modification.attribute, &mut duplicates);
            }
            ModificationType::Delete => {
                let mut missing = Vec::new();
                entry.remove_attribute(&modification.attribute, &mut missing);
            }
            ModificationType::Replace => {
                if modification.attribute.has_value() {
                    entry.replace_attribute_instance(&modification.attribute);
                } else {
                    entry.remove_attribute_type(
                        modification.attribute.attr_type(),
                        modification.attribute.options(),
                    );
                }
            }
            ModificationType::Increment => {
                let _ = apply_increment(entry, &modification.attribute);
            }
        }
    }
}
