use super::{
    CoreOutcome, PluginVerdict, apply_hook_verdict, check_cancel, check_writability,
    finish_operation, run_pre_operation_plugins,
};
use crate::attribute::{Attribute, AttributeValue};
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::{OID_POST_READ, process_request_controls, read_entry_response};
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::hooks::{run_conflict_resolution, run_sync_post_operation, run_sync_pre_operation};
use crate::lock::LockMode;
use crate::operation::{AddRequest, Operation, OperationKind};
use crate::pwpolicy::{
    ATTR_PASSWORD_CHANGED_TIME, ATTR_PASSWORD_RESET, PasswordPolicyState, scheme,
    state::format_generalized_time,
};
use crate::schema::is_objectclass_type;

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Add(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &AddRequest) -> CoreOutcome {
    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    let parent_dn = request.entry_dn.parent();
    let outcome = {
        // The parent is read-locked so a concurrent delete cannot orphan the
        // new entry; the target itself is write-locked.
        let _parent_guard = match &parent_dn {
            Some(parent) => {
                match ctx.locks.acquire_with_retry(
                    parent,
                    LockMode::Read,
                    ctx.config.lock_retry_attempts,
                ) {
                    Ok(guard) => Some(guard),
                    Err(err) => {
                        operation.set_response_data(&lock_failure_error(&ctx.config, err));
                        return CoreOutcome::halted_skipping_post_op();
                    }
                }
            }
            None => None,
        };
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
        core(ctx, operation, request, parent_dn.as_ref())
    };

    run_sync_post_operation(&ctx.sync_providers, operation);
    outcome
}

fn core(
    ctx: &CoreContext,
    operation: &mut Operation,
    request: &AddRequest,
    parent_dn: Option<&crate::dn::Dn>,
) -> CoreOutcome {
    match ctx.backend.entry_exists(&request.entry_dn) {
        Ok(true) => {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {} already exists", request.entry_dn),
            ));
            return CoreOutcome::halted();
        }
        Ok(false) => {}
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    }

    if let Some(parent) = parent_dn {
        match ctx.backend.entry_exists(parent) {
            Ok(true) => {}
            Ok(false) => {
                operation.set_response_data(
                    &DirectoryError::new(
                        ResultCode::NoSuchObject,
                        format!(
                            "parent entry {parent} of {} does not exist",
                            request.entry_dn
                        ),
                    )
                    .with_matched_dn(ctx.nearest_existing_ancestor(&request.entry_dn)),
                );
                return CoreOutcome::halted();
            }
            Err(err) => {
                operation.set_response_data(&err);
                return CoreOutcome::halted();
            }
        }
    }

    let mut entry = match build_entry(ctx, operation, request) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    // Assertions on an add are evaluated against the entry being created.
    let decisions = match process_request_controls(
        operation,
        ctx.access_control.as_ref(),
        ctx.backend.as_ref(),
        Some(&entry),
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

    if !operation.is_internal() && !ctx.access_control.is_allowed(operation) {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InsufficientAccessRights,
            format!("access to add entry {} is denied", request.entry_dn),
        ));
        return CoreOutcome::halted_skipping_post_op();
    }

    if ctx.config.check_schema && !operation.is_synchronization() {
        if let Err(reason) = ctx.schema.entry_conforms(&entry) {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::ObjectClassViolation,
                format!(
                    "entry {} violates the server schema: {reason}",
                    request.entry_dn
                ),
            ));
            return CoreOutcome::halted();
        }
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
        operation.append_error_message("no-op control: the add was validated but not applied");
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

    // Stamp password-policy state on accounts created with a password.
    if entry.has_attribute(&ctx.password_policy.password_attribute) {
        let mut sink = Vec::new();
        entry.add_operational_attribute(
            &Attribute::new(
                ATTR_PASSWORD_CHANGED_TIME,
                vec![AttributeValue::new(format_generalized_time(ctx.now()))],
            ),
            &mut sink,
        );
        if ctx.password_policy.force_change_on_reset
            && operation.authorization_dn() != &request.entry_dn
        {
            entry.add_operational_attribute(
                &Attribute::new(ATTR_PASSWORD_RESET, vec![AttributeValue::new("TRUE")]),
                &mut sink,
            );
        }
    }

    if let Err(err) = ctx.backend.add_entry(entry.clone(), operation) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if let Some(attrs) = &decisions.post_read_attributes {
        operation.add_response_control(read_entry_response(OID_POST_READ, &entry, attrs));
    }

    operation.set_result_code(ResultCode::Success);

    for listener in &ctx.change_listeners {
        listener.handle_add(operation, &entry);
    }

    CoreOutcome::completed(true)
}

/// Assembles the entry to add: object classes with their superior chains,
/// user and operational attributes, injected RDN values, and encoded
/// passwords.
fn build_entry(
    ctx: &CoreContext,
    operation: &Operation,
    request: &AddRequest,
) -> Result<Entry, DirectoryError> {
    let external = !operation.is_internal() && !operation.is_synchronization();
    let mut entry = Entry::new(request.entry_dn.clone());
    for attr in &request.attributes {
        if is_objectclass_type(attr.attr_type()) {
            entry.add_object_classes(attr.values(), ctx.schema.as_ref())?;
            continue;
        }
        let info = ctx.schema.attribute_type(attr.attr_type());
        if external && info.no_user_modification {
            return Err(DirectoryError::new(
                ResultCode::ConstraintViolation,
                format!("attribute {} may not be supplied by clients", attr.name()),
            ));
        }
        let mut duplicates = Vec::new();
        if info.operational {
            entry.add_operational_attribute(attr, &mut duplicates);
        } else {
            entry.add_attribute(attr, &mut duplicates);
        }
        if !duplicates.is_empty() {
            return Err(DirectoryError::new(
                ResultCode::AttributeOrValueExists,
                format!(
                    "entry {} lists duplicate values for attribute {}",
                    request.entry_dn,
                    attr.name()
                ),
            ));
        }
    }

    // Every RDN value must appear among the entry's attributes.
    if let Some(rdn) = request.entry_dn.rdn() {
        for ava in rdn.avas() {
            if is_objectclass_type(&ava.attr_type) {
                continue;
            }
            let present = entry
                .get_attribute_with_options(&ava.attr_type, &Default::default())
                .is_some_and(|a| a.contains(&ava.value));
            if present {
                continue;
            }
            if !ctx.config.add_missing_rdn_attributes && external {
                return Err(DirectoryError::new(
                    ResultCode::UnwillingToPerform,
                    format!(
                        "entry {} is missing RDN attribute value {}={}",
                        request.entry_dn,
                        ava.name,
                        ava.value.raw()
                    ),
                ));
            }
            let mut sink = Vec::new();
            entry.add_attribute(
                &Attribute::new(ava.name.clone(), vec![ava.value.clone()]),
                &mut sink,
            );
        }
    }

    if external {
        encode_add_passwords(ctx, &mut entry)?;
    }
    Ok(entry)
}

fn encode_add_passwords(ctx: &CoreContext, entry: &mut Entry) -> Result<(), DirectoryError> {
    let policy = &ctx.password_policy;
    let Some(attr) = entry
        .get_attribute_with_options(&policy.password_attribute, &Default::default())
        .cloned()
    else {
        return Ok(());
    };
    if attr.values().len() > 1 && !policy.allow_multiple_password_values {
        return Err(DirectoryError::new(
            ResultCode::UnwillingToPerform,
            "multiple password values are not allowed",
        ));
    }
    let state = PasswordPolicyState::new(entry, policy, ctx.now());
    let mut encoded = Vec::new();
    for value in attr.values() {
        if scheme::is_pre_encoded(value.raw()) {
            if !policy.allow_pre_encoded_passwords {
                return Err(DirectoryError::new(
                    ResultCode::UnwillingToPerform,
                    "pre-encoded passwords are not accepted",
                ));
            }
            encoded.push(value.clone());
            continue;
        }
        if let Err(reason) = state.validate_new_password(value.raw(), entry) {
            return Err(DirectoryError::new(
                ResultCode::ConstraintViolation,
                format!("the proposed password is not acceptable: {reason}"),
            ));
        }
        encoded.extend(
            policy
                .encode_password(value.raw())
                .into_iter()
                .map(AttributeValue::new),
        );
    }
    let mut replacement = attr;
    replacement.set_values(encoded);
    entry.replace_attribute_instance(&replacement);
    Ok(())
}
