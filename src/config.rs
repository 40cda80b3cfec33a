use crate::error::ResultCode;
use serde::{Deserialize, Serialize};

/// How strictly attribute-value syntax violations are treated during
/// modification processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyntaxEnforcementPolicy {
    Accept,
    Reject,
    Warn,
}

/// Whether a backend (or the server as a whole) accepts write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritabilityMode {
    Enabled,
    /// External writes are rejected; internal and synchronization writes
    /// still go through.
    InternalOnly,
    Disabled,
}

/// Runtime configuration for the execution core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Whether entries are validated against the server schema.
    pub check_schema: bool,
    pub syntax_policy: SyntaxEnforcementPolicy,
    /// Server-wide writability, checked alongside the backend's own mode.
    pub writability_mode: WritabilityMode,
    /// Whether Add silently injects missing RDN attribute values instead of
    /// rejecting the request.
    pub add_missing_rdn_attributes: bool,
    /// Whether a simple bind that supplies a DN must also supply a password.
    pub bind_with_dn_requires_password: bool,
    /// When true, only root users may authenticate or issue operations.
    pub lockdown_mode: bool,
    /// Result code reported for failures internal to the server, such as
    /// lock acquisition exhaustion.
    pub server_error_result_code: ResultCode,
    /// Attempts made to acquire an entry lock before giving up.
    pub lock_retry_attempts: u32,
    /// Per-attempt lock wait in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            check_schema: true,
            syntax_policy: SyntaxEnforcementPolicy::Reject,
            writability_mode: WritabilityMode::Enabled,
            add_missing_rdn_attributes: true,
            bind_with_dn_requires_password: true,
            lockdown_mode: false,
            server_error_result_code: ResultCode::Other,
            lock_retry_attempts: 3,
            lock_timeout_ms: 9_000,
        }
    }
}

impl CoreConfig {
    /// Strict profile: schema checking with syntax rejection.
    pub fn strict() -> Self {
        Self {
            check_schema: true,
            syntax_policy: SyntaxEnforcementPolicy::Reject,
            ..Self::default()
        }
    }

    /// Permissive profile: schema checking off, syntax violations logged.
    pub fn permissive() -> Self {
        Self {
            check_schema: false,
            syntax_policy: SyntaxEnforcementPolicy::Warn,
            ..Self::default()
        }
    }

    pub fn writes_disabled(&self) -> bool {
        matches!(self.writability_mode, WritabilityMode::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreConfig, SyntaxEnforcementPolicy};

    #[test]
    fn default_profile_is_strict() {
        let config = CoreConfig::default();
        assert!(config.check_schema);
        assert_eq!(config.syntax_policy, SyntaxEnforcementPolicy::Reject);
        assert_eq!(config.lock_retry_attempts, 3);
    }

    #[test]
    fn permissive_profile_relaxes_schema() {
        let config = CoreConfig::permissive();
        assert!(!config.check_schema);
        assert_eq!(config.syntax_policy, SyntaxEnforcementPolicy::Warn);
    }
}
