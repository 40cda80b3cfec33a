//! Password policy evaluation and per-entry policy state.
//!
//! The policy itself is configuration. All per-entry state (failure times,
//! grace-use times, change time, reset flag) lives in operational attributes
//! of the account entry, read at evaluation time and written back through
//! staged modifications that commit with the triggering operation.

pub mod scheme;
pub mod state;

pub use scheme::{ClearScheme, PasswordStorageScheme, SaltedSha256Scheme};
pub use state::{PasswordPolicyState, PolicyAssessment, evaluate};

use crate::dn::Dn;
use crate::entry::Entry;
use std::sync::Arc;

pub const ATTR_PASSWORD_CHANGED_TIME: &str = "pwdchangedtime";
pub const ATTR_PASSWORD_FAILURE_TIME: &str = "pwdfailuretime";
pub const ATTR_PASSWORD_GRACE_USE_TIME: &str = "pwdgraceusetime";
pub const ATTR_PASSWORD_HISTORY: &str = "pwdhistory";
pub const ATTR_PASSWORD_RESET: &str = "pwdreset";
pub const ATTR_ACCOUNT_DISABLED: &str = "ds-pwp-account-disabled";
pub const ATTR_ACCOUNT_EXPIRATION_TIME: &str = "ds-pwp-account-expiration-time";
pub const ATTR_LAST_LOGIN_TIME: &str = "ds-pwp-last-login-time";
pub const ATTR_WARNED_TIME: &str = "ds-pwp-warned-time";

/// Entry attributes that override session resource limits at bind time.
pub const ATTR_SIZE_LIMIT: &str = "ds-rlim-size-limit";
pub const ATTR_TIME_LIMIT: &str = "ds-rlim-time-limit";
pub const ATTR_IDLE_TIME_LIMIT: &str = "ds-rlim-idle-time-limit";
pub const ATTR_LOOKTHROUGH_LIMIT: &str = "ds-rlim-lookthrough-limit";

/// Rejects proposed passwords that fail quality requirements. Validators run
/// on user password changes; administrative resets may bypass them.
pub trait PasswordValidator: Send + Sync {
    /// `Err` carries the reason reported back to the client.
    fn validate(&self, clear: &str, entry: &Entry) -> Result<(), String>;
}

/// The error component of the password policy response control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyErrorType {
    PasswordExpired,
    AccountLocked,
    ChangeAfterReset,
    PasswordModNotAllowed,
    MustSupplyOldPassword,
    InsufficientPasswordQuality,
    PasswordTooShort,
    PasswordTooYoung,
    PasswordInHistory,
}

impl PasswordPolicyErrorType {
    pub fn int_value(self) -> u8 {
        match self {
            PasswordPolicyErrorType::PasswordExpired => 0,
            PasswordPolicyErrorType::AccountLocked => 1,
            PasswordPolicyErrorType::ChangeAfterReset => 2,
            PasswordPolicyErrorType::PasswordModNotAllowed => 3,
            PasswordPolicyErrorType::MustSupplyOldPassword => 4,
            PasswordPolicyErrorType::InsufficientPasswordQuality => 5,
            PasswordPolicyErrorType::PasswordTooShort => 6,
            PasswordPolicyErrorType::PasswordTooYoung => 7,
            PasswordPolicyErrorType::PasswordInHistory => 8,
        }
    }
}

/// The warning component of the password policy response control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyWarningType {
    TimeBeforeExpiration(i64),
    GraceLoginsRemaining(u32),
}

/// Account state transitions surfaced to notification handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatusNotificationType {
    AccountTemporarilyLocked,
    AccountPermanentlyLocked,
    AccountUnlocked,
    AccountIdleLocked,
    AccountResetLocked,
    AccountDisabled,
    AccountEnabled,
    AccountExpired,
    PasswordExpired,
    PasswordExpiring,
    PasswordReset,
    PasswordChanged,
}

#[derive(Debug, Clone)]
pub struct AccountStatusNotification {
    pub notification_type: AccountStatusNotificationType,
    pub entry_dn: Dn,
    pub message: String,
}

/// Receives account status notifications. Delivery is best effort and never
/// affects the triggering operation's outcome.
pub trait AccountStatusNotificationHandler: Send + Sync {
    fn handle(&self, notification: &AccountStatusNotification);
}

/// Password policy configuration applied to an account entry. Interval
/// fields use seconds; zero disables the corresponding check.
#[derive(Clone)]
pub struct PasswordPolicy {
    /// Attribute holding the credential, usually `userPassword`.
    pub password_attribute: String,
    /// Consecutive failures before lockout; zero disables failure lockout.
    pub lockout_failure_count: u32,
    /// How long a failure lockout lasts; zero means until administrative
    /// unlock.
    pub lockout_duration_secs: u64,
    /// Window after which recorded failures no longer count; zero keeps them
    /// until a successful bind.
    pub lockout_failure_expiration_secs: u64,
    pub max_password_age_secs: u64,
    /// How far ahead of expiration warnings begin.
    pub warning_interval_secs: u64,
    /// When false, a password cannot expire until the client has been warned
    /// at least once.
    pub expire_passwords_without_warning: bool,
    pub grace_login_count: u32,
    pub idle_lockout_interval_secs: u64,
    /// Maximum time allowed between an administrative reset and the user's
    /// own change; zero disables.
    pub max_password_reset_age_secs: u64,
    pub min_password_age_secs: u64,
    /// Prior passwords retained for reuse prevention; zero disables history.
    pub history_count: u32,
    pub allow_user_password_changes: bool,
    pub allow_pre_encoded_passwords: bool,
    pub allow_multiple_password_values: bool,
    pub require_current_password: bool,
    pub require_secure_authentication: bool,
    pub require_secure_password_changes: bool,
    pub force_change_on_reset: bool,
    pub storage_schemes: Vec<Arc<dyn PasswordStorageScheme>>,
    pub validators: Vec<Arc<dyn PasswordValidator>>,
}

impl PasswordPolicy {
    /// Encodes a cleartext password with every configured storage scheme.
    pub fn encode_password(&self, clear: &str) -> Vec<String> {
        self.storage_schemes
            .iter()
            .map(|s| scheme::tag_value(s.as_ref(), &s.encode(clear)))
            .collect()
    }
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            password_attribute: "userpassword".to_string(),
            lockout_failure_count: 0,
            lockout_duration_secs: 0,
            lockout_failure_expiration_secs: 0,
            max_password_age_secs: 0,
            warning_interval_secs: 5 * 86_400,
            expire_passwords_without_warning: false,
            grace_login_count: 0,
            idle_lockout_interval_secs: 0,
            max_password_reset_age_secs: 0,
            min_password_age_secs: 0,
            history_count: 0,
            allow_user_password_changes: true,
            allow_pre_encoded_passwords: false,
            allow_multiple_password_values: false,
            require_current_password: false,
            require_secure_authentication: false,
            require_secure_password_changes: false,
            force_change_on_reset: false,
            storage_schemes: vec![Arc::new(SaltedSha256Scheme)],
            validators: Vec::new(),
        }
    }
}

impl std::fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordPolicy")
            .field("password_attribute", &self.password_attribute)
            .field("lockout_failure_count", &self.lockout_failure_count)
            .field("max_password_age_secs", &self.max_password_age_secs)
            .field("grace_login_count", &self.grace_login_count)
            .field("force_change_on_reset", &self.force_change_on_reset)
            .finish_non_exhaustive()
    }
}
