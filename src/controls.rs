//! Request/response control decoding and dispatch.
//!
//! Controls arrive already BER-decoded from the protocol layer; the
//! execution core sees typed payloads. The dispatcher walks the request
//! controls in order, applies each recognized control's semantics, and
//! fails the whole operation on the first control error.

use crate::backend::{AccessControlHandler, Backend, PersistentSearchSpec};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::operation::{EntryMatcher, Operation, Privilege};
use crate::pwpolicy::{PasswordPolicyErrorType, PasswordPolicyWarningType};
use std::sync::Arc;

pub const OID_ASSERTION: &str = "1.3.6.1.1.12";
pub const OID_NO_OP: &str = "1.3.6.1.4.1.4203.1.10.2";
pub const OID_PRE_READ: &str = "1.3.6.1.1.13.1";
pub const OID_POST_READ: &str = "1.3.6.1.1.13.2";
pub const OID_PROXIED_AUTH_V1: &str = "2.16.840.1.113730.3.4.12";
pub const OID_PROXIED_AUTH_V2: &str = "2.16.840.1.113730.3.4.18";
pub const OID_PERSISTENT_SEARCH: &str = "2.16.840.1.113730.3.4.3";
pub const OID_ENTRY_CHANGE_NOTIFICATION: &str = "2.16.840.1.113730.3.4.7";
pub const OID_MATCHED_VALUES: &str = "1.2.826.0.1.3344810.2.3";
pub const OID_SUBENTRIES_DRAFT: &str = "1.3.6.1.4.1.7628.5.101.1";
pub const OID_SUBENTRIES: &str = "1.3.6.1.4.1.4203.1.10.1";
pub const OID_ACCOUNT_USABLE: &str = "1.3.6.1.4.1.42.2.27.9.5.8";
pub const OID_PASSWORD_POLICY: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
pub const OID_NS_PASSWORD_EXPIRED: &str = "2.16.840.1.113730.3.4.4";
pub const OID_NS_PASSWORD_EXPIRING: &str = "2.16.840.1.113730.3.4.5";
pub const OID_REAL_ATTRS_ONLY: &str = "2.16.840.1.113730.3.4.17";
pub const OID_VIRTUAL_ATTRS_ONLY: &str = "2.16.840.1.113730.3.4.19";

/// Account usability figures returned by the account-usable response
/// control.
#[derive(Debug, Clone, Default)]
pub struct AccountUsability {
    pub is_usable: bool,
    pub seconds_before_expiration: Option<i64>,
    pub inactive: bool,
    pub reset: bool,
    pub expired: bool,
    pub remaining_grace_logins: Option<u32>,
    pub seconds_before_unlock: Option<i64>,
}

/// A control's decoded body. `Opaque` carries bytes the core does not
/// interpret; backends may still act on them.
#[derive(Clone)]
pub enum ControlPayload {
    None,
    Opaque(Vec<u8>),
    Assertion(Arc<dyn EntryMatcher>),
    ProxiedAuthV1 { authorization_dn: Dn },
    ProxiedAuthV2 { authorization_id: String },
    PersistentSearch(PersistentSearchSpec),
    ReadEntryRequest { attributes: Vec<String> },
    MatchedValues(Arc<dyn EntryMatcher>),
    SubentriesVisibility(bool),
    // Response payloads.
    ReadEntryResponse(Entry),
    PasswordPolicyResponse {
        warning: Option<PasswordPolicyWarningType>,
        error: Option<PasswordPolicyErrorType>,
    },
    AccountUsableResponse(AccountUsability),
    EntryChangeNotification {
        change_type: crate::backend::PersistentChangeType,
        previous_dn: Option<Dn>,
    },
}

impl std::fmt::Debug for ControlPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPayload::None => f.write_str("None"),
            ControlPayload::Opaque(bytes) => write!(f, "Opaque({} bytes)", bytes.len()),
            ControlPayload::Assertion(_) => f.write_str("Assertion(..)"),
            ControlPayload::ProxiedAuthV1 { authorization_dn } => f
                .debug_struct("ProxiedAuthV1")
                .field("authorization_dn", authorization_dn)
                .finish(),
            ControlPayload::ProxiedAuthV2 { authorization_id } => f
                .debug_struct("ProxiedAuthV2")
                .field("authorization_id", authorization_id)
                .finish(),
            ControlPayload::PersistentSearch(spec) => {
                f.debug_tuple("PersistentSearch").field(spec).finish()
            }
            ControlPayload::ReadEntryRequest { attributes } => f
                .debug_struct("ReadEntryRequest")
                .field("attributes", attributes)
                .finish(),
            ControlPayload::MatchedValues(_) => f.write_str("MatchedValues(..)"),
            ControlPayload::SubentriesVisibility(v) => {
                f.debug_tuple("SubentriesVisibility").field(v).finish()
            }
            ControlPayload::ReadEntryResponse(entry) => {
                f.debug_tuple("ReadEntryResponse").field(entry.dn()).finish()
            }
            ControlPayload::PasswordPolicyResponse { warning, error } => f
                .debug_struct("PasswordPolicyResponse")
                .field("warning", warning)
                .field("error", error)
                .finish(),
            ControlPayload::AccountUsableResponse(u) => {
                f.debug_tuple("AccountUsableResponse").field(u).finish()
            }
            ControlPayload::EntryChangeNotification {
                change_type,
                previous_dn,
            } => f
                .debug_struct("EntryChangeNotification")
                .field("change_type", change_type)
                .field("previous_dn", previous_dn)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub payload: ControlPayload,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, payload: ControlPayload) -> Self {
        Self {
            oid: oid.into(),
            critical,
            payload,
        }
    }

    pub fn flag(oid: impl Into<String>, critical: bool) -> Self {
        Self::new(oid, critical, ControlPayload::None)
    }
}

/// What the recognized request controls asked for. The executor consults
/// this after dispatch; controls with immediate effect (assertion, proxied
/// authorization) have already been applied.
#[derive(Default)]
pub struct ControlDecisions {
    /// Validate everything, commit nothing.
    pub no_op: bool,
    pub pre_read_attributes: Option<Vec<String>>,
    pub post_read_attributes: Option<Vec<String>>,
    pub matched_values: Option<Arc<dyn EntryMatcher>>,
    pub persistent_search: Option<PersistentSearchSpec>,
    /// Draft-style subentries control: return only subentries.
    pub subentries_only: bool,
    /// RFC-style visibility flag, when supplied.
    pub subentries_visibility: Option<bool>,
    pub real_attrs_only: bool,
    pub virtual_attrs_only: bool,
    pub account_usable_requested: bool,
    pub password_policy_requested: bool,
}

/// A control-processing failure plus how it affects the rest of the
/// pipeline.
pub struct ControlError {
    pub error: DirectoryError,
    /// Access denials on a control skip the post-operation hooks, matching
    /// the treatment of operation-level access denials.
    pub skip_post_operation: bool,
}

impl From<DirectoryError> for ControlError {
    fn from(error: DirectoryError) -> Self {
        Self {
            error,
            skip_post_operation: false,
        }
    }
}

fn decode_error(oid: &str, expected: &str) -> DirectoryError {
    DirectoryError::new(
        ResultCode::ProtocolError,
        format!("control {oid} does not carry a valid {expected} payload"),
    )
}

/// Resolves an RFC 4370 authorization identity. The `dn:` form resolves
/// directly; a bare string is also treated as a DN. The `u:` form requires
/// an identity mapper, which is outside this core.
fn resolve_authorization_id(authorization_id: &str) -> Result<Dn, DirectoryError> {
    if let Some(user_id) = authorization_id.strip_prefix("u:") {
        return Err(DirectoryError::new(
            ResultCode::AuthorizationDenied,
            format!("authorization identity u:{user_id} cannot be mapped to an entry"),
        ));
    }
    let dn_text = authorization_id
        .strip_prefix("dn:")
        .unwrap_or(authorization_id);
    if dn_text.is_empty() {
        return Ok(Dn::null());
    }
    Dn::parse(dn_text)
}

/// Walks the request controls in order and applies each recognized
/// control. An unrecognized critical control fails the operation unless
/// the backend claims native support for it.
pub fn process_request_controls(
    operation: &mut Operation,
    access_control: &dyn AccessControlHandler,
    backend: &dyn Backend,
    current_entry: Option<&Entry>,
) -> Result<ControlDecisions, ControlError> {
    let mut decisions = ControlDecisions::default();
    let target = operation.target_dn().clone();
    let controls = operation.request_controls().to_vec();
    for control in &controls {
        if !operation.is_internal()
            && !access_control.is_control_allowed(&target, operation, &control.oid)
        {
            return Err(ControlError {
                error: DirectoryError::new(
                    ResultCode::InsufficientAccessRights,
                    format!("the {} control is not allowed for this target", control.oid),
                ),
                skip_post_operation: true,
            });
        }
        match control.oid.as_str() {
            OID_ASSERTION => {
                let ControlPayload::Assertion(matcher) = &control.payload else {
                    return Err(decode_error(&control.oid, "assertion filter").into());
                };
                let entry = current_entry.ok_or_else(|| {
                    ControlError::from(DirectoryError::new(
                        ResultCode::ProtocolError,
                        "no entry is available to evaluate the assertion against",
                    ))
                })?;
                match matcher.matches(entry) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(DirectoryError::new(
                            ResultCode::AssertionFailed,
                            format!("the assertion is not satisfied by entry {}", entry.dn()),
                        )
                        .into());
                    }
                    Err(err) => {
                        return Err(DirectoryError::new(
                            ResultCode::ProtocolError,
                            format!("the assertion filter could not be evaluated: {err}"),
                        )
                        .into());
                    }
                }
            }
            OID_NO_OP => decisions.no_op = true,
            OID_PRE_READ => {
                let ControlPayload::ReadEntryRequest { attributes } = &control.payload else {
                    return Err(decode_error(&control.oid, "attribute list").into());
                };
                decisions.pre_read_attributes = Some(attributes.clone());
            }
            OID_POST_READ => {
                let ControlPayload::ReadEntryRequest { attributes } = &control.payload else {
                    return Err(decode_error(&control.oid, "attribute list").into());
                };
                decisions.post_read_attributes = Some(attributes.clone());
            }
            OID_PROXIED_AUTH_V1 => {
                let ControlPayload::ProxiedAuthV1 { authorization_dn } = &control.payload else {
                    return Err(decode_error(&control.oid, "authorization DN").into());
                };
                apply_proxied_authorization(operation, authorization_dn.clone())?;
            }
            OID_PROXIED_AUTH_V2 => {
                let ControlPayload::ProxiedAuthV2 { authorization_id } = &control.payload else {
                    return Err(decode_error(&control.oid, "authorization identity").into());
                };
                let dn = resolve_authorization_id(authorization_id)?;
                apply_proxied_authorization(operation, dn)?;
            }
            OID_PERSISTENT_SEARCH => {
                let ControlPayload::PersistentSearch(spec) = &control.payload else {
                    return Err(decode_error(&control.oid, "persistent search body").into());
                };
                decisions.persistent_search = Some(spec.clone());
            }
            OID_MATCHED_VALUES => {
                let ControlPayload::MatchedValues(matcher) = &control.payload else {
                    return Err(decode_error(&control.oid, "matched-values filter").into());
                };
                decisions.matched_values = Some(Arc::clone(matcher));
            }
            OID_SUBENTRIES_DRAFT => decisions.subentries_only = true,
            OID_SUBENTRIES => {
                let visibility = match &control.payload {
                    ControlPayload::SubentriesVisibility(v) => *v,
                    ControlPayload::None => true,
                    _ => return Err(decode_error(&control.oid, "visibility flag").into()),
                };
                decisions.subentries_visibility = Some(visibility);
            }
            OID_ACCOUNT_USABLE => decisions.account_usable_requested = true,
            OID_PASSWORD_POLICY => decisions.password_policy_requested = true,
            OID_REAL_ATTRS_ONLY => decisions.real_attrs_only = true,
            OID_VIRTUAL_ATTRS_ONLY => decisions.virtual_attrs_only = true,
            oid => {
                if control.critical && !backend.supports_control(oid) {
                    return Err(DirectoryError::new(
                        ResultCode::UnavailableCriticalExtension,
                        format!("the critical control {oid} is not supported"),
                    )
                    .into());
                }
            }
        }
    }
    Ok(decisions)
}

fn apply_proxied_authorization(
    operation: &mut Operation,
    authorization_dn: Dn,
) -> Result<(), ControlError> {
    if !operation.client.has_privilege(Privilege::ProxiedAuth) {
        return Err(DirectoryError::new(
            ResultCode::AuthorizationDenied,
            "the connection lacks the proxied-authorization privilege",
        )
        .into());
    }
    operation.set_proxied_authorization_dn(authorization_dn);
    Ok(())
}

/// Projects an entry snapshot down to the attribute selection of a pre- or
/// post-read control: `*` for all user attributes, `+` for all operational
/// attributes, `1.1` for none, otherwise the named types.
pub fn read_entry_snapshot(entry: &Entry, attributes: &[String]) -> Entry {
    let mut snapshot = Entry::new(entry.dn().clone());
    let all_user = attributes.is_empty() || attributes.iter().any(|a| a == "*");
    let all_operational = attributes.iter().any(|a| a == "+");
    if attributes.iter().any(|a| a == "1.1") && attributes.len() == 1 {
        return snapshot;
    }
    let named: Vec<String> = attributes
        .iter()
        .filter(|a| *a != "*" && *a != "+" && *a != "1.1")
        .map(|a| crate::attribute::normalize(a))
        .collect();
    let mut sink = Vec::new();
    for attr in entry.user_attributes() {
        if all_user || named.contains(&attr.attr_type().to_string()) {
            snapshot.add_attribute(attr, &mut sink);
        }
    }
    for attr in entry.operational_attributes() {
        if all_operational || named.contains(&attr.attr_type().to_string()) {
            snapshot.add_operational_attribute(attr, &mut sink);
        }
    }
    snapshot
}

/// Builds the pre/post-read response control for a snapshot.
pub fn read_entry_response(oid: &str, entry: &Entry, attributes: &[String]) -> Control {
    Control::new(
        oid,
        false,
        ControlPayload::ReadEntryResponse(read_entry_snapshot(entry, attributes)),
    )
}

pub fn password_policy_response(
    warning: Option<PasswordPolicyWarningType>,
    error: Option<PasswordPolicyErrorType>,
) -> Control {
    Control::new(
        OID_PASSWORD_POLICY,
        false,
        ControlPayload::PasswordPolicyResponse { warning, error },
    )
}

pub fn account_usable_response(usability: AccountUsability) -> Control {
    Control::new(
        OID_ACCOUNT_USABLE,
        false,
        ControlPayload::AccountUsableResponse(usability),
    )
}

#[cfg(test)]
mod tests {
    use super::{
        Control, ControlPayload, OID_ASSERTION, OID_NO_OP, OID_PROXIED_AUTH_V2,
        process_request_controls, read_entry_snapshot, resolve_authorization_id,
    };
    use crate::attribute::Attribute;
    use crate::backend::{AccessControlHandler, AllowAllAccessControl, Backend};
    use crate::dn::Dn;
    use crate::entry::Entry;
    use crate::error::{DirectoryError, ResultCode};
    use crate::operation::{
        ClientState, DeleteRequest, EntryMatcher, Operation, OperationKind, Privilege,
    };
    use std::sync::Arc;

    struct NullBackend;

    impl Backend for NullBackend {
        fn get_entry(&self, _dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
            Ok(None)
        }
        fn add_entry(&self, _e: Entry, _o: &Operation) -> Result<(), DirectoryError> {
            Ok(())
        }
        fn delete_entry(&self, _d: &Dn, _o: &Operation) -> Result<(), DirectoryError> {
            Ok(())
        }
        fn replace_entry(&self, _e: Entry, _o: &Operation) -> Result<(), DirectoryError> {
            Ok(())
        }
        fn rename_entry(
            &self,
            _d: &Dn,
            _e: Entry,
            _o: &Operation,
        ) -> Result<(), DirectoryError> {
            Ok(())
        }
        fn search(
            &self,
            _r: &crate::operation::SearchRequest,
        ) -> Result<Vec<Entry>, DirectoryError> {
            Ok(Vec::new())
        }
        fn has_subordinates(&self, _d: &Dn) -> Result<bool, DirectoryError> {
            Ok(false)
        }
    }

    struct MatchIf(bool);

    impl EntryMatcher for MatchIf {
        fn matches(&self, _entry: &Entry) -> Result<bool, DirectoryError> {
            Ok(self.0)
        }
    }

    fn op_with(controls: Vec<Control>) -> Operation {
        Operation::new(
            OperationKind::Delete(DeleteRequest {
                entry_dn: Dn::parse("cn=x,o=example").unwrap(),
            }),
            Dn::null(),
        )
        .with_controls(controls)
    }

    fn entry() -> Entry {
        let mut e = Entry::new(Dn::parse("cn=x,o=example").unwrap());
        let mut sink = Vec::new();
        e.add_attribute(&Attribute::of("cn", &["x"]), &mut sink);
        e.add_attribute(&Attribute::of("description", &["d"]), &mut sink);
        e.add_operational_attribute(&Attribute::of("createTimestamp", &["t"]), &mut sink);
        e
    }

    #[test]
    fn satisfied_assertion_passes() {
        let mut op = op_with(vec![Control::new(
            OID_ASSERTION,
            true,
            ControlPayload::Assertion(Arc::new(MatchIf(true))),
        )]);
        let decisions =
            process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, Some(&entry()))
                .map_err(|e| e.error)
                .unwrap();
        assert!(!decisions.no_op);
    }

    #[test]
    fn failed_assertion_is_assertion_failed() {
        let mut op = op_with(vec![Control::new(
            OID_ASSERTION,
            true,
            ControlPayload::Assertion(Arc::new(MatchIf(false))),
        )]);
        let err =
            process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, Some(&entry()))
                .map(|_| ())
                .unwrap_err();
        assert_eq!(err.error.result_code, ResultCode::AssertionFailed);
        assert!(!err.skip_post_operation);
    }

    #[test]
    fn unknown_critical_control_is_rejected() {
        let mut op = op_with(vec![Control::flag("1.2.3.4.5", true)]);
        let err = process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, None)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(
            err.error.result_code,
            ResultCode::UnavailableCriticalExtension
        );
    }

    #[test]
    fn unknown_noncritical_control_is_ignored() {
        let mut op = op_with(vec![Control::flag("1.2.3.4.5", false)]);
        assert!(
            process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, None)
                .map_err(|e| e.error)
                .is_ok()
        );
    }

    #[test]
    fn no_op_control_is_flagged() {
        let mut op = op_with(vec![Control::flag(OID_NO_OP, true)]);
        let decisions =
            process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, None)
                .map_err(|e| e.error)
                .unwrap();
        assert!(decisions.no_op);
    }

    #[test]
    fn proxied_auth_requires_privilege() {
        let control = Control::new(
            OID_PROXIED_AUTH_V2,
            true,
            ControlPayload::ProxiedAuthV2 {
                authorization_id: "dn:cn=proxy,o=example".to_string(),
            },
        );
        let mut op = op_with(vec![control.clone()]);
        let err = process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, None)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.error.result_code, ResultCode::AuthorizationDenied);

        let mut privileged = ClientState::default();
        privileged.privileges.insert(Privilege::ProxiedAuth);
        let mut op = op_with(vec![control]).with_client(privileged);
        process_request_controls(&mut op, &AllowAllAccessControl, &NullBackend, None)
            .map_err(|e| e.error)
            .unwrap();
        assert_eq!(op.authorization_dn().raw(), "cn=proxy,o=example");
    }

    #[test]
    fn authorization_id_forms() {
        assert_eq!(
            resolve_authorization_id("dn:cn=a,o=b").unwrap().raw(),
            "cn=a,o=b"
        );
        assert!(resolve_authorization_id("dn:").unwrap().is_null());
        let err = resolve_authorization_id("u:someone").unwrap_err();
        assert_eq!(err.result_code, ResultCode::AuthorizationDenied);
    }

    #[test]
    fn control_access_denial_skips_post_operation() {
        struct DenyControls;
        impl AccessControlHandler for DenyControls {
            fn is_allowed(&self, _operation: &Operation) -> bool {
                true
            }
            fn is_control_allowed(&self, _t: &Dn, _o: &Operation, _oid: &str) -> bool {
                false
            }
        }
        let mut op = op_with(vec![Control::flag(OID_NO_OP, true)]);
        let err = process_request_controls(&mut op, &DenyControls, &NullBackend, None)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.error.result_code, ResultCode::InsufficientAccessRights);
        assert!(err.skip_post_operation);
    }

    #[test]
    fn snapshot_attribute_selection() {
        let e = entry();
        let all = read_entry_snapshot(&e, &[]);
        assert!(all.has_attribute("cn") && all.has_attribute("description"));
        assert!(!all.has_attribute("createTimestamp"));

        let none = read_entry_snapshot(&e, &["1.1".to_string()]);
        assert!(none.all_attributes().next().is_none());

        let named = read_entry_snapshot(&e, &["cn".to_string()]);
        assert!(named.has_attribute("cn"));
        assert!(!named.has_attribute("description"));

        let operational = read_entry_snapshot(&e, &["+".to_string()]);
        assert!(operational.has_attribute("createTimestamp"));
        assert!(!operational.has_attribute("cn"));
    }
}
