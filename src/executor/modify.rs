use super::{
    CoreOutcome, PluginVerdict, apply_hook_verdict, check_cancel, check_writability, fetch_entry,
    finish_operation, run_pre_operation_plugins,
};
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::{
    OID_PASSWORD_POLICY, OID_POST_READ, OID_PRE_READ, password_policy_response,
    process_request_controls, read_entry_response,
};
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::hooks::{run_conflict_resolution, run_sync_post_operation, run_sync_pre_operation};
use crate::modify::{
    Modification, ModificationType, ModifyContext, apply_modification, apply_state_updates,
    check_entry_conformance,
};
use crate::lock::LockMode;
use crate::operation::{ModifyRequest, Operation, OperationKind};
use crate::pwpolicy::{
    AccountStatusNotificationType, PasswordPolicyErrorType, PasswordPolicyState, scheme,
};

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Modify(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &ModifyRequest) -> CoreOutcome {
    if request.modifications.is_empty() {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::ConstraintViolation,
            format!("modify of entry {} contains no modifications", request.entry_dn),
        ));
        return CoreOutcome::halted();
    }

    let pwp_requested = operation
        .request_controls()
        .iter()
        .any(|c| c.oid == OID_PASSWORD_POLICY);
    let external = !operation.is_internal() && !operation.is_synchronization();

    // A connection flagged for a forced password change may only change the
    // password.
    if operation.client.must_change_password && external {
        let targets_password = request.modifications.iter().any(|m| {
            m.attribute.attr_type() == ctx.password_policy.password_attribute
        });
        if !targets_password {
            if pwp_requested {
                operation.add_response_control(password_policy_response(
                    None,
                    Some(PasswordPolicyErrorType::ChangeAfterReset),
                ));
            }
            operation.set_response_data(&DirectoryError::new(
                ResultCode::UnwillingToPerform,
                "the password must be changed before other operations are accepted",
            ));
            return CoreOutcome::halted();
        }
    }

    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    let outcome = {
        let _guard = match ctx.locks.acquire_with_retry(
            &request.entry_dn,
            LockMode::Write,
            ctx.config.lock_retry_attempts,
        ) {
            Ok(guard) => guard,
            Err(err) => {
                operation.set_response_data(&lock_failure_error(&ctx.config, err));
                return CoreOutcome::halted_skipping_post_op();
            }
        };
        core(ctx, operation, request, pwp_requested)
    };

    // The entry lock is released before the providers see the result.
    run_sync_post_operation(&ctx.sync_providers, operation);
    outcome
}

fn core(
    ctx: &CoreContext,
    operation: &mut Operation,
    request: &ModifyRequest,
    pwp_requested: bool,
) -> CoreOutcome {
    let current_entry = match fetch_entry(ctx, &request.entry_dn) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    let decisions = match process_request_controls(
        operation,
        ctx.access_control.as_ref(),
        ctx.backend.as_ref(),
        Some(&current_entry),
    ) {
        Ok(decisions) => decisions,
        Err(err) => {
            operation.set_response_data(&err.error);
            return if err.skip_post_operation {
                CoreOutcome::halted_skipping_post_op()
            } else {
                CoreOutcome::halted()
            };
        }
    };

    let mut state = PasswordPolicyState::new(&current_entry, &ctx.password_policy, ctx.now());
    let was_locked = state.assessment().locked_due_to_failures;
    let was_disabled = state.assessment().is_disabled;
    let mut working = current_entry.duplicate();

    // Replication conflict resolution is pointless for a validate-only pass.
    if !decisions.no_op {
        let verdict = run_conflict_resolution(&ctx.sync_providers, operation);
        if let PluginVerdict::Halt { skip_post_operation } =
            apply_hook_verdict(operation, verdict)
        {
            return CoreOutcome {
                skip_post_operation,
                committed: false,
            };
        }
    }

    let mut modifications = request.modifications.clone();
    let pw = match process_password_modifications(
        ctx,
        operation,
        &mut modifications,
        &state,
        &current_entry,
        pwp_requested,
    ) {
        Ok(pw) => pw,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    if let Err(err) = apply_user_modifications(ctx, operation, &mut working, &modifications) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if !operation.is_internal() && !ctx.access_control.is_allowed(operation) {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InsufficientAccessRights,
            format!("access to modify entry {} is denied", request.entry_dn),
        ));
        return CoreOutcome::halted_skipping_post_op();
    }

    if pw.password_changed {
        state.update_password_history();
        state.set_password_changed_time();
        if pw.self_change {
            state.set_must_change_password(false);
        } else if ctx.password_policy.force_change_on_reset {
            state.set_must_change_password(true);
        }
    } else if operation.client.must_change_password
        && !operation.is_internal()
        && !operation.is_synchronization()
    {
        // The modification touched the password attribute but did not
        // actually change the password.
        if pwp_requested {
            operation.add_response_control(password_policy_response(
                None,
                Some(PasswordPolicyErrorType::ChangeAfterReset),
            ));
        }
        operation.set_response_data(&DirectoryError::new(
            ResultCode::UnwillingToPerform,
            "the password must be changed before other operations are accepted",
        ));
        return CoreOutcome::halted();
    }

    let staged = state.take_pending();
    apply_state_updates(&mut working, &staged);

    let modify_ctx = ModifyContext {
        schema: ctx.schema.as_ref(),
        check_schema: ctx.config.check_schema,
        syntax_policy: ctx.config.syntax_policy,
        is_synchronization: operation.is_synchronization(),
    };
    if let Err(err) = check_entry_conformance(&working, modify_ctx) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    match run_pre_operation_plugins(ctx, operation) {
        PluginVerdict::Continue => {}
        PluginVerdict::Halt { skip_post_operation } => {
            return CoreOutcome {
                skip_post_operation,
                committed: false,
            };
        }
    }

    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    if let Err(err) = check_writability(ctx, operation) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if decisions.no_op {
        operation.append_error_message("no-op control: the modify was validated but not applied");
        operation.set_result_code(ResultCode::NoOperation);
        return CoreOutcome::halted();
    }

    let verdict = run_sync_pre_operation(&ctx.sync_providers, operation);
    if let PluginVerdict::Halt { skip_post_operation } = apply_hook_verdict(operation, verdict) {
        return CoreOutcome {
            skip_post_operation,
            committed: false,
        };
    }

    if let Err(err) = ctx.backend.replace_entry(working.clone(), operation) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    // Account status fan-out for state the modify changed.
    if pw.password_changed {
        let kind = if pw.self_change {
            AccountStatusNotificationType::PasswordChanged
        } else {
            AccountStatusNotificationType::PasswordReset
        };
        ctx.send_account_status_notification(kind, &request.entry_dn, "the password was changed");
        if was_locked {
            ctx.send_account_status_notification(
                AccountStatusNotificationType::AccountUnlocked,
                &request.entry_dn,
                "the password change cleared a failure lockout",
            );
        }
    }
    let now_disabled = working
        .first_value(crate::pwpolicy::ATTR_ACCOUNT_DISABLED)
        .is_some_and(|v| v.normalized() == "true");
    if now_disabled != was_disabled {
        let (kind, message) = if now_disabled {
            (
                AccountStatusNotificationType::AccountDisabled,
                "the account was disabled",
            )
        } else {
            (
                AccountStatusNotificationType::AccountEnabled,
                "the account was enabled",
            )
        };
        ctx.send_account_status_notification(kind, &request.entry_dn, message);
    }

    if let Some(attrs) = &decisions.pre_read_attributes {
        operation.add_response_control(read_entry_response(OID_PRE_READ, &current_entry, attrs));
    }
    if let Some(attrs) = &decisions.post_read_attributes {
        operation.add_response_control(read_entry_response(OID_POST_READ, &working, attrs));
    }
    if pwp_requested {
        operation.add_response_control(password_policy_response(None, None));
    }

    operation.set_result_code(ResultCode::Success);

    for listener in &ctx.change_listeners {
        listener.handle_modify(operation, &current_entry, &working);
    }

    CoreOutcome::completed(true)
}

struct PasswordChanges {
    password_changed: bool,
    self_change: bool,
}

/// Applies password-policy semantics to modifications of the password
/// attribute: gates the change, validates quality and history, and rewrites
/// cleartext values into their encoded storage forms.
fn process_password_modifications(
    ctx: &CoreContext,
    operation: &mut Operation,
    modifications: &mut [Modification],
    state: &PasswordPolicyState<'_>,
    current_entry: &Entry,
    pwp_requested: bool,
) -> Result<PasswordChanges, DirectoryError> {
    let policy = &ctx.password_policy;
    let mut changes = PasswordChanges {
        password_changed: false,
        self_change: operation.authorization_dn() == current_entry.dn(),
    };
    if operation.is_internal() || operation.is_synchronization() {
        return Ok(changes);
    }
    let any_password_mod = modifications
        .iter()
        .any(|m| m.attribute.attr_type() == policy.password_attribute);
    if !any_password_mod {
        return Ok(changes);
    }

    let fail = |operation: &mut Operation,
                error_type: Option<PasswordPolicyErrorType>,
                code: ResultCode,
                message: String| {
        if pwp_requested && error_type.is_some() {
            operation.add_response_control(password_policy_response(None, error_type));
        }
        DirectoryError::new(code, message)
    };

    if changes.self_change && !policy.allow_user_password_changes {
        return Err(fail(
            operation,
            Some(PasswordPolicyErrorType::PasswordModNotAllowed),
            ResultCode::UnwillingToPerform,
            "users are not permitted to change their own passwords".to_string(),
        ));
    }
    if policy.require_secure_password_changes && !operation.client.secure {
        return Err(fail(
            operation,
            None,
            ResultCode::ConfidentialityRequired,
            "password changes require a secure connection".to_string(),
        ));
    }
    if changes.self_change && policy.require_current_password {
        let supplies_current = modifications.iter().any(|m| {
            m.attribute.attr_type() == policy.password_attribute
                && m.mod_type == ModificationType::Delete
                && m.attribute.has_value()
        });
        if !supplies_current {
            return Err(fail(
                operation,
                Some(PasswordPolicyErrorType::MustSupplyOldPassword),
                ResultCode::UnwillingToPerform,
                "the current password must be supplied with the change".to_string(),
            ));
        }
    }
    if changes.self_change && state.is_within_minimum_age() {
        return Err(fail(
            operation,
            Some(PasswordPolicyErrorType::PasswordTooYoung),
            ResultCode::UnwillingToPerform,
            "the password was changed too recently to change it again".to_string(),
        ));
    }

    for modification in modifications.iter_mut() {
        if modification.attribute.attr_type() != policy.password_attribute {
            continue;
        }
        if modification.attribute.has_options() {
            return Err(fail(
                operation,
                None,
                ResultCode::UnwillingToPerform,
                "the password attribute may not carry attribute options".to_string(),
            ));
        }
        match modification.mod_type {
            ModificationType::Add | ModificationType::Replace => {
                let values = modification.attribute.values().to_vec();
                if values.is_empty() {
                    // Replace with no values removes the password.
                    changes.password_changed = true;
                    continue;
                }
                if values.len() > 1 && !policy.allow_multiple_password_values {
                    return Err(fail(
                        operation,
                        None,
                        ResultCode::UnwillingToPerform,
                        "multiple password values are not allowed".to_string(),
                    ));
                }
                if modification.mod_type == ModificationType::Add
                    && state.has_stored_password()
                    && !policy.allow_multiple_password_values
                {
                    return Err(fail(
                        operation,
                        None,
                        ResultCode::UnwillingToPerform,
                        "the entry already has a password; use replace".to_string(),
                    ));
                }
                let mut encoded = Vec::new();
                for value in &values {
                    if scheme::is_pre_encoded(value.raw()) {
                        if !policy.allow_pre_encoded_passwords {
                            return Err(fail(
                                operation,
                                Some(PasswordPolicyErrorType::InsufficientPasswordQuality),
                                ResultCode::UnwillingToPerform,
                                "pre-encoded passwords are not accepted".to_string(),
                            ));
                        }
                        encoded.push(value.clone());
                        continue;
                    }
                    if let Err(reason) = state.validate_new_password(value.raw(), current_entry) {
                        return Err(fail(
                            operation,
                            Some(PasswordPolicyErrorType::InsufficientPasswordQuality),
                            ResultCode::ConstraintViolation,
                            format!("the proposed password is not acceptable: {reason}"),
                        ));
                    }
                    if state.is_password_in_history(value.raw()) {
                        return Err(fail(
                            operation,
                            Some(PasswordPolicyErrorType::PasswordInHistory),
                            ResultCode::ConstraintViolation,
                            "the proposed password is in the password history".to_string(),
                        ));
                    }
                    encoded.extend(
                        policy
                            .encode_password(value.raw())
                            .into_iter()
                            .map(crate::attribute::AttributeValue::new),
                    );
                }
                modification.attribute.set_values(encoded);
                changes.password_changed = true;
            }
            ModificationType::Delete => {
                let values = modification.attribute.values().to_vec();
                if values.is_empty() {
                    changes.password_changed = true;
                    continue;
                }
                let mut resolved = Vec::new();
                for value in &values {
                    if scheme::is_pre_encoded(value.raw()) {
                        resolved.push(value.clone());
                        continue;
                    }
                    // A cleartext delete value is matched against the stored
                    // encoded forms and rewritten to the form it matched.
                    let matched = state.stored_passwords().iter().find(|stored| {
                        scheme::password_matches(
                            &policy.storage_schemes,
                            value.raw(),
                            std::slice::from_ref(stored),
                        )
                    });
                    match matched {
                        Some(stored) => {
                            resolved.push(crate::attribute::AttributeValue::new(stored.clone()));
                        }
                        None => {
                            return Err(fail(
                                operation,
                                None,
                                ResultCode::UnwillingToPerform,
                                "the provided password does not match any stored password"
                                    .to_string(),
                            ));
                        }
                    }
                }
                modification.attribute.set_values(resolved);
                changes.password_changed = true;
            }
            ModificationType::Increment => {
                return Err(fail(
                    operation,
                    None,
                    ResultCode::UnwillingToPerform,
                    "the password attribute cannot be incremented".to_string(),
                ));
            }
        }
    }
    Ok(changes)
}

/// Runs the user-modification schema gates and the modification engine over
/// the working entry.
fn apply_user_modifications(
    ctx: &CoreContext,
    operation: &Operation,
    working: &mut Entry,
    modifications: &[Modification],
) -> Result<(), DirectoryError> {
    let external = !operation.is_internal() && !operation.is_synchronization();
    let modify_ctx = ModifyContext {
        schema: ctx.schema.as_ref(),
        check_schema: ctx.config.check_schema,
        syntax_policy: ctx.config.syntax_policy,
        is_synchronization: operation.is_synchronization(),
    };
    for modification in modifications {
        let info = ctx.schema.attribute_type(modification.attribute.attr_type());
        if external && !modification.internal {
            if info.no_user_modification {
                return Err(DirectoryError::new(
                    ResultCode::ConstraintViolation,
                    format!(
                        "attribute {} may not be modified by clients",
                        modification.attribute.name()
                    ),
                ));
            }
            if info.obsolete
                && matches!(
                    modification.mod_type,
                    ModificationType::Add | ModificationType::Replace
                )
                && modification.attribute.has_value()
            {
                return Err(DirectoryError::new(
                    ResultCode::ConstraintViolation,
                    format!(
                        "attribute {} is marked OBSOLETE in the schema",
                        modification.attribute.name()
                    ),
                ));
            }
        }
        apply_modification(working, modification, modify_ctx)?;
    }
    Ok(())
}
