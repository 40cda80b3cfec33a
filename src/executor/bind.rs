use super::{CoreOutcome, check_cancel, fetch_entry, finish_operation, persist_state_updates};
use crate::context::{CoreContext, lock_failure_error};
use crate::lock::LockMode;
use crate::modify::Modification;
use crate::controls::{
    Control, OID_NS_PASSWORD_EXPIRED, OID_NS_PASSWORD_EXPIRING, OID_PASSWORD_POLICY,
    password_policy_response, process_request_controls,
};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::operation::{
    BindCredentials, BindRequest, Operation, OperationKind, ResourceLimits,
};
use crate::pwpolicy::{
    ATTR_IDLE_TIME_LIMIT, ATTR_LOOKTHROUGH_LIMIT, ATTR_SIZE_LIMIT, ATTR_TIME_LIMIT,
    AccountStatusNotificationType, PasswordPolicyErrorType, PasswordPolicyState,
    PasswordPolicyWarningType,
};
use tracing::info;

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Bind(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &BindRequest) -> CoreOutcome {
    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    if ctx.config.lockdown_mode && !operation.client.is_root {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the server is in lockdown mode and rejects non-root binds",
        ));
        return CoreOutcome::halted();
    }

    match &request.credentials {
        BindCredentials::Simple { password } => {
            simple_bind(ctx, operation, &request.bind_dn, password)
        }
        BindCredentials::Sasl {
            mechanism,
            credentials,
        } => sasl_bind(ctx, operation, mechanism, credentials.as_deref()),
    }
}

fn simple_bind(
    ctx: &CoreContext,
    operation: &mut Operation,
    bind_dn: &Dn,
    password: &str,
) -> CoreOutcome {
    if bind_dn.is_null() && password.is_empty() {
        operation.authenticated_dn = Some(Dn::null());
        operation.set_result_code(ResultCode::Success);
        return CoreOutcome::completed(false);
    }
    if password.is_empty() {
        if ctx.config.bind_with_dn_requires_password {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::UnwillingToPerform,
                "a bind that names an entry must supply a password",
            ));
            return CoreOutcome::halted();
        }
        operation.authenticated_dn = Some(Dn::null());
        operation.set_result_code(ResultCode::Success);
        return CoreOutcome::completed(false);
    }
    if bind_dn.is_null() {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InvalidCredentials,
            "a password was supplied without a bind DN",
        ));
        return CoreOutcome::halted();
    }

    // Credentials and policy state are evaluated under a read lock; the
    // staged state updates are persisted afterwards, against a fresh read
    // of the entry, so the guard never has to be upgraded.
    let (outcome, updates) = {
        let _guard = match ctx.locks.acquire_with_retry(
            bind_dn,
            LockMode::Read,
            ctx.config.lock_retry_attempts,
        ) {
            Ok(guard) => guard,
            Err(err) => {
                operation.set_response_data(&lock_failure_error(&ctx.config, err));
                return CoreOutcome::halted();
            }
        };
        check_simple_credentials(ctx, operation, bind_dn, password)
    };
    persist_state_updates(ctx, bind_dn, &updates, operation);
    outcome
}

fn check_simple_credentials(
    ctx: &CoreContext,
    operation: &mut Operation,
    bind_dn: &Dn,
    password: &str,
) -> (CoreOutcome, Vec<Modification>) {
    // A missing account is indistinguishable from a wrong password.
    let entry = match fetch_entry(ctx, bind_dn) {
        Ok(entry) => entry,
        Err(_) => {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::InvalidCredentials,
                "invalid credentials",
            ));
            return (CoreOutcome::halted(), Vec::new());
        }
    };

    let pwp_requested = has_password_policy_control(operation);
    if let Err(err) = process_request_controls(
        operation,
        ctx.access_control.as_ref(),
        ctx.backend.as_ref(),
        Some(&entry),
    ) {
        operation.set_response_data(&err.error);
        let outcome = if err.skip_post_operation {
            CoreOutcome::halted_skipping_post_op()
        } else {
            CoreOutcome::halted()
        };
        return (outcome, Vec::new());
    }

    let mut state = PasswordPolicyState::new(&entry, &ctx.password_policy, ctx.now());

    if let Err(err) = check_account_gates(ctx, operation, &state, true, pwp_requested) {
        operation.set_response_data(&err);
        return (CoreOutcome::halted(), Vec::new());
    }

    if !state.password_matches(password) {
        let crossed = state.update_auth_failure_times();
        if crossed {
            let (kind, message) = match state.assessment().seconds_until_unlock {
                Some(seconds) => (
                    AccountStatusNotificationType::AccountTemporarilyLocked,
                    format!("too many failed authentications; unlocks in {seconds} seconds"),
                ),
                None => (
                    AccountStatusNotificationType::AccountPermanentlyLocked,
                    "too many failed authentications; administrative unlock required".to_string(),
                ),
            };
            ctx.send_account_status_notification(kind, entry.dn(), message);
            info!(dn = %entry.dn(), "account locked after repeated authentication failures");
        }
        let updates = staged_updates(ctx, &mut state);
        if pwp_requested && crossed {
            operation.add_response_control(password_policy_response(
                None,
                Some(PasswordPolicyErrorType::AccountLocked),
            ));
        }
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InvalidCredentials,
            "invalid credentials",
        ));
        return (CoreOutcome::halted(), updates);
    }

    complete_authenticated_bind(ctx, operation, &entry, state, true, pwp_requested)
}

fn sasl_bind(
    ctx: &CoreContext,
    operation: &mut Operation,
    mechanism: &str,
    credentials: Option<&[u8]>,
) -> CoreOutcome {
    let Some(handler) = ctx.sasl_handlers.get(&mechanism.to_uppercase()).cloned() else {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::AuthMethodNotSupported,
            format!("SASL mechanism {mechanism} is not supported"),
        ));
        return CoreOutcome::halted();
    };

    let authenticated = match handler.authenticate(operation, credentials) {
        Ok(dn) => dn,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };
    if authenticated.is_null() {
        operation.authenticated_dn = Some(Dn::null());
        operation.set_result_code(ResultCode::Success);
        return CoreOutcome::completed(false);
    }

    let (outcome, updates) = {
        let _guard = match ctx.locks.acquire_with_retry(
            &authenticated,
            LockMode::Read,
            ctx.config.lock_retry_attempts,
        ) {
            Ok(guard) => guard,
            Err(err) => {
                operation.set_response_data(&lock_failure_error(&ctx.config, err));
                return CoreOutcome::halted();
            }
        };
        check_sasl_account(
            ctx,
            operation,
            &authenticated,
            handler.is_password_based(),
        )
    };
    persist_state_updates(ctx, &authenticated, &updates, operation);
    outcome
}

fn check_sasl_account(
    ctx: &CoreContext,
    operation: &mut Operation,
    authenticated: &Dn,
    password_based: bool,
) -> (CoreOutcome, Vec<Modification>) {
    let entry = match fetch_entry(ctx, authenticated) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return (CoreOutcome::halted(), Vec::new());
        }
    };

    let pwp_requested = has_password_policy_control(operation);
    if let Err(err) = process_request_controls(
        operation,
        ctx.access_control.as_ref(),
        ctx.backend.as_ref(),
        Some(&entry),
    ) {
        operation.set_response_data(&err.error);
        let outcome = if err.skip_post_operation {
            CoreOutcome::halted_skipping_post_op()
        } else {
            CoreOutcome::halted()
        };
        return (outcome, Vec::new());
    }

    let state = PasswordPolicyState::new(&entry, &ctx.password_policy, ctx.now());
    if let Err(err) = check_account_gates(ctx, operation, &state, password_based, pwp_requested) {
        operation.set_response_data(&err);
        return (CoreOutcome::halted(), Vec::new());
    }

    complete_authenticated_bind(ctx, operation, &entry, state, password_based, pwp_requested)
}

fn has_password_policy_control(operation: &Operation) -> bool {
    operation
        .request_controls()
        .iter()
        .any(|c| c.oid == OID_PASSWORD_POLICY)
}

/// The pre-credential account gates, in fixed priority order. The first
/// failing gate wins; later gates are never evaluated.
fn check_account_gates(
    ctx: &CoreContext,
    operation: &mut Operation,
    state: &PasswordPolicyState<'_>,
    password_based: bool,
    pwp_requested: bool,
) -> Result<(), DirectoryError> {
    let policy = state.policy();
    let assessment = state.assessment();
    let entry_dn = state.entry_dn().clone();

    if policy.require_secure_authentication && !operation.client.secure {
        return Err(DirectoryError::new(
            ResultCode::ConfidentialityRequired,
            "authentication requires a secure connection",
        ));
    }
    if assessment.is_disabled {
        return Err(DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the account is administratively disabled",
        ));
    }
    if assessment.is_account_expired {
        ctx.send_account_status_notification(
            AccountStatusNotificationType::AccountExpired,
            &entry_dn,
            "an expired account attempted to authenticate",
        );
        return Err(DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the account has expired",
        ));
    }
    if assessment.locked_due_to_failures {
        if pwp_requested {
            operation.add_response_control(password_policy_response(
                None,
                Some(PasswordPolicyErrorType::AccountLocked),
            ));
        }
        return Err(DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the account is locked after repeated authentication failures",
        ));
    }
    if assessment.locked_due_to_idle_interval {
        ctx.send_account_status_notification(
            AccountStatusNotificationType::AccountIdleLocked,
            &entry_dn,
            "an idle-locked account attempted to authenticate",
        );
        return Err(DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the account is locked after too long a period of inactivity",
        ));
    }
    if password_based && assessment.locked_due_to_maximum_reset_age {
        ctx.send_account_status_notification(
            AccountStatusNotificationType::AccountResetLocked,
            &entry_dn,
            "an account locked by an unanswered password reset attempted to authenticate",
        );
        return Err(DirectoryError::new(
            ResultCode::InvalidCredentials,
            "the password reset was not followed up in time",
        ));
    }
    Ok(())
}

/// The post-credential tail shared by simple and SASL binds: expiration and
/// warning handling, state cleanup, resource limits and the final result.
/// Returns the staged state updates for the caller to persist once the
/// entry's read lock is released.
fn complete_authenticated_bind(
    ctx: &CoreContext,
    operation: &mut Operation,
    entry: &Entry,
    mut state: PasswordPolicyState<'_>,
    password_based: bool,
    pwp_requested: bool,
) -> (CoreOutcome, Vec<Modification>) {
    let mut warning: Option<PasswordPolicyWarningType> = None;

    if password_based && state.assessment().is_password_expired {
        if state.assessment().may_use_grace_login {
            state.update_grace_login_times();
            let remaining = state.grace_logins_remaining();
            warning = Some(PasswordPolicyWarningType::GraceLoginsRemaining(remaining));
            operation.must_change_password_after_bind = true;
            operation.add_response_control(Control::flag(OID_NS_PASSWORD_EXPIRED, false));
        } else {
            ctx.send_account_status_notification(
                AccountStatusNotificationType::PasswordExpired,
                entry.dn(),
                "an account with an expired password attempted to authenticate",
            );
            if pwp_requested {
                operation.add_response_control(password_policy_response(
                    None,
                    Some(PasswordPolicyErrorType::PasswordExpired),
                ));
            }
            operation.add_response_control(Control::flag(OID_NS_PASSWORD_EXPIRED, false));
            let updates = staged_updates(ctx, &mut state);
            operation.set_response_data(&DirectoryError::new(
                ResultCode::InvalidCredentials,
                "the password has expired",
            ));
            return (CoreOutcome::halted(), updates);
        }
    } else if password_based && state.assessment().should_warn {
        if let Some(seconds) = state.assessment().seconds_until_expiration {
            warning = Some(PasswordPolicyWarningType::TimeBeforeExpiration(
                seconds.max(0),
            ));
            operation.add_response_control(Control::flag(OID_NS_PASSWORD_EXPIRING, false));
        }
        if state.assessment().is_first_warning {
            state.set_warned_time();
            ctx.send_account_status_notification(
                AccountStatusNotificationType::PasswordExpiring,
                entry.dn(),
                "the password is approaching expiration",
            );
        }
    }

    if password_based && state.assessment().must_change_password {
        operation.must_change_password_after_bind = true;
        if pwp_requested {
            operation.add_response_control(password_policy_response(
                warning.take(),
                Some(PasswordPolicyErrorType::ChangeAfterReset),
            ));
        }
    } else if pwp_requested {
        operation.add_response_control(password_policy_response(warning, None));
    }

    state.clear_failure_lockout();
    state.set_last_login_time();
    let updates = staged_updates(ctx, &mut state);

    operation.resource_limits = Some(resource_limits_from(entry));
    operation.authenticated_dn = Some(entry.dn().clone());
    operation.set_result_code(ResultCode::Success);
    (CoreOutcome::completed(false), updates)
}

/// Drains the staged policy state for persistence, or discards it when the
/// server is read-only.
fn staged_updates(ctx: &CoreContext, state: &mut PasswordPolicyState<'_>) -> Vec<Modification> {
    if ctx.config.writes_disabled() {
        return Vec::new();
    }
    state.take_pending()
}

fn resource_limits_from(entry: &Entry) -> ResourceLimits {
    let get = |attr: &str| entry.first_value(attr).and_then(|v| v.as_i64());
    ResourceLimits {
        size_limit: get(ATTR_SIZE_LIMIT),
        time_limit: get(ATTR_TIME_LIMIT),
        idle_time_limit_ms: get(ATTR_IDLE_TIME_LIMIT).map(|secs| secs * 1_000),
        lookthrough_limit: get(ATTR_LOOKTHROUGH_LIMIT),
    }
}
