use crate::dn::Dn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// LDAP result codes produced by the execution core.
///
/// The numeric values are fixed by the protocol and cross the wire verbatim;
/// `NoOperation` is the non-standard OpenLDAP-assigned value echoed to
/// clients that request the no-op control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongAuthRequired,
    Referral,
    ConfidentialityRequired,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    NoSuchAttribute,
    UndefinedAttributeType,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    SortControlMissing,
    OffsetRangeError,
    Other,
    TooLate,
    Canceled,
    CannotCancel,
    AssertionFailed,
    AuthorizationDenied,
    NoOperation,
}

impl ResultCode {
    /// The protocol-level integer value for this result code.
    pub fn int_value(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::SortControlMissing => 60,
            ResultCode::OffsetRangeError => 61,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
            ResultCode::TooLate => 112,
            ResultCode::Canceled => 118,
            ResultCode::CannotCancel => 121,
            ResultCode::AssertionFailed => 122,
            ResultCode::AuthorizationDenied => 123,
            ResultCode::NoOperation => 16654,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operations_error",
            ResultCode::ProtocolError => "protocol_error",
            ResultCode::TimeLimitExceeded => "time_limit_exceeded",
            ResultCode::SizeLimitExceeded => "size_limit_exceeded",
            ResultCode::CompareFalse => "compare_false",
            ResultCode::CompareTrue => "compare_true",
            ResultCode::AuthMethodNotSupported => "auth_method_not_supported",
            ResultCode::StrongAuthRequired => "strong_auth_required",
            ResultCode::Referral => "referral",
            ResultCode::ConfidentialityRequired => "confidentiality_required",
            ResultCode::AdminLimitExceeded => "admin_limit_exceeded",
            ResultCode::UnavailableCriticalExtension => "unavailable_critical_extension",
            ResultCode::NoSuchAttribute => "no_such_attribute",
            ResultCode::UndefinedAttributeType => "undefined_attribute_type",
            ResultCode::ConstraintViolation => "constraint_violation",
            ResultCode::AttributeOrValueExists => "attribute_or_value_exists",
            ResultCode::InvalidAttributeSyntax => "invalid_attribute_syntax",
            ResultCode::NoSuchObject => "no_such_object",
            ResultCode::AliasProblem => "alias_problem",
            ResultCode::InvalidDnSyntax => "invalid_dn_syntax",
            ResultCode::InappropriateAuthentication => "inappropriate_authentication",
            ResultCode::InvalidCredentials => "invalid_credentials",
            ResultCode::InsufficientAccessRights => "insufficient_access_rights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwilling_to_perform",
            ResultCode::SortControlMissing => "sort_control_missing",
            ResultCode::OffsetRangeError => "offset_range_error",
            ResultCode::ObjectClassViolation => "objectclass_violation",
            ResultCode::NotAllowedOnNonLeaf => "not_allowed_on_nonleaf",
            ResultCode::NotAllowedOnRdn => "not_allowed_on_rdn",
            ResultCode::EntryAlreadyExists => "entry_already_exists",
            ResultCode::ObjectClassModsProhibited => "objectclass_mods_prohibited",
            ResultCode::AffectsMultipleDsas => "affects_multiple_dsas",
            ResultCode::Other => "other",
            ResultCode::TooLate => "too_late",
            ResultCode::Canceled => "canceled",
            ResultCode::CannotCancel => "cannot_cancel",
            ResultCode::AssertionFailed => "assertion_failed",
            ResultCode::AuthorizationDenied => "authorization_denied",
            ResultCode::NoOperation => "no_operation",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::CompareTrue)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.int_value())
    }
}

/// A structured directory failure: a result code, a human-readable message,
/// and optionally the matched DN / referral URLs that accompany it on the
/// wire. Raised by the backend, schema checks and control decoding; always
/// caught at the executor boundary and converted into the operation's final
/// result.
#[derive(Debug, Clone, Error)]
#[error("{result_code}: {message}")]
pub struct DirectoryError {
    pub result_code: ResultCode,
    pub message: String,
    pub matched_dn: Option<Dn>,
    pub referral_urls: Vec<String>,
}

impl DirectoryError {
    pub fn new(result_code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result_code,
            message: message.into(),
            matched_dn: None,
            referral_urls: Vec::new(),
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: Option<Dn>) -> Self {
        self.matched_dn = matched_dn;
        self
    }

    pub fn with_referrals(mut self, referral_urls: Vec<String>) -> Self {
        self.referral_urls = referral_urls;
        self
    }
}

/// Raised by a blocking call once a cancellation request has been observed.
/// Converted into the operation's cancel result and a terminal state,
/// bypassing normal result-code logic.
#[derive(Debug, Clone, Error)]
#[error("operation cancelled: {message}")]
pub struct OperationCancelled {
    pub cancel_result: ResultCode,
    pub message: String,
}

impl OperationCancelled {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            cancel_result: ResultCode::Canceled,
            message: message.into(),
        }
    }
}

/// Lock-manager acquisition exhaustion. Treated as a server-internal error,
/// not attributable to the request.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("unable to obtain a {mode} lock on entry {dn} after {attempts} attempts")]
    Exhausted {
        dn: String,
        mode: &'static str,
        attempts: u32,
    },
    #[error("lock manager poisoned, rejecting all new acquisitions")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::{DirectoryError, ResultCode};

    #[test]
    fn result_code_wire_values_are_stable() {
        assert_eq!(ResultCode::Success.int_value(), 0);
        assert_eq!(ResultCode::NoSuchObject.int_value(), 32);
        assert_eq!(ResultCode::NotAllowedOnRdn.int_value(), 67);
        assert_eq!(ResultCode::AttributeOrValueExists.int_value(), 20);
        assert_eq!(ResultCode::UnavailableCriticalExtension.int_value(), 12);
        assert_eq!(ResultCode::AssertionFailed.int_value(), 122);
        assert_eq!(ResultCode::AuthorizationDenied.int_value(), 123);
        assert_eq!(ResultCode::NoOperation.int_value(), 16654);
    }

    #[test]
    fn result_code_strings_are_stable() {
        assert_eq!(ResultCode::NoOperation.as_str(), "no_operation");
        assert_eq!(
            ResultCode::ObjectClassViolation.as_str(),
            "objectclass_violation"
        );
    }

    #[test]
    fn directory_error_carries_matched_dn() {
        let err = DirectoryError::new(ResultCode::NoSuchObject, "entry does not exist")
            .with_matched_dn(Some(crate::dn::Dn::parse("o=test").unwrap()));
        assert_eq!(err.result_code, ResultCode::NoSuchObject);
        assert!(err.matched_dn.is_some());
    }
}
