use super::{
    CoreOutcome, PluginVerdict, apply_hook_verdict, check_cancel, check_writability, fetch_entry,
    finish_operation, run_pre_operation_plugins,
};
use crate::attribute::Attribute;
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::{
    OID_POST_READ, OID_PRE_READ, process_request_controls, read_entry_response,
};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::hooks::{run_conflict_resolution, run_sync_post_operation, run_sync_pre_operation};
use crate::lock::{LockGuard, LockMode};
use crate::operation::{ModifyDnRequest, Operation, OperationKind};

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::ModifyDn(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &ModifyDnRequest) -> CoreOutcome {
    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    let new_dn = match request
        .entry_dn
        .rename(&request.new_rdn, request.new_superior.as_ref())
    {
        Ok(dn) => dn,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    let outcome = {
        let _guards = match acquire_both(ctx, operation, &request.entry_dn, &new_dn) {
            Some(guards) => guards,
            None => return CoreOutcome::halted_skipping_post_op(),
        };
        core(ctx, operation, request, &new_dn)
    };

    run_sync_post_operation(&ctx.sync_providers, operation);
    outcome
}

/// Write-locks the current and the new DN, in normalized order so two
/// renames crossing each other cannot deadlock.
fn acquire_both<'a>(
    ctx: &'a CoreContext,
    operation: &mut Operation,
    current: &Dn,
    new_dn: &Dn,
) -> Option<Vec<LockGuard<'a>>> {
    let mut targets = vec![current, new_dn];
    targets.sort_by(|a, b| a.normalized().cmp(b.normalized()));
    targets.dedup_by(|a, b| a.normalized() == b.normalized());
    let mut guards = Vec::with_capacity(targets.len());
    for dn in targets {
        match ctx
            .locks
            .acquire_with_retry(dn, LockMode::Write, ctx.config.lock_retry_attempts)
        {
            Ok(guard) => guards.push(guard),
            Err(err) => {
                operation.set_response_data(&lock_failure_error(&ctx.config, err));
                return None;
            }
        }
    }
    Some(guards)
}

fn core(
    ctx: &CoreContext,
    operation: &mut Operation,
    request: &ModifyDnRequest,
    new_dn: &Dn,
) -> CoreOutcome {
    let current_entry = match fetch_entry(ctx, &request.entry_dn) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    if new_dn != &request.entry_dn {
        match ctx.backend.entry_exists(new_dn) {
            Ok(true) => {
                operation.set_response_data(&DirectoryError::new(
                    ResultCode::EntryAlreadyExists,
                    format!("an entry already exists at {new_dn}"),
                ));
                return CoreOutcome::halted();
            }
            Ok(false) => {}
            Err(err) => {
                operation.set_response_data(&err);
                return CoreOutcome::halted();
            }
        }
    }

    if let Some(new_superior) = &request.new_superior {
        match ctx.backend.entry_exists(new_superior) {
            Ok(true) => {}
            Ok(false) => {
                operation.set_response_data(
                    &DirectoryError::new(
                        ResultCode::NoSuchObject,
                        format!("new superior entry {new_superior} does not exist"),
                    )
                    .with_matched_dn(ctx.nearest_existing_ancestor(new_superior)),
                );
                return CoreOutcome::halted();
            }
            Err(err) => {
                operation.set_response_data(&err);
                return CoreOutcome::halted();
            }
        }
    }

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
            format!("access to rename entry {} is denied", request.entry_dn),
        ));
        return CoreOutcome::halted_skipping_post_op();
    }

    let new_entry = match apply_rename(&current_entry, request, new_dn) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    if ctx.config.check_schema && !operation.is_synchronization() {
        if let Err(reason) = ctx.schema.entry_conforms(&new_entry) {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::ObjectClassViolation,
                format!("renamed entry {new_dn} violates the server schema: {reason}"),
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
        operation.append_error_message("no-op control: the rename was validated but not applied");
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

    if let Err(err) = ctx
        .backend
        .rename_entry(&request.entry_dn, new_entry.clone(), operation)
    {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if let Some(attrs) = &decisions.pre_read_attributes {
        operation.add_response_control(read_entry_response(OID_PRE_READ, &current_entry, attrs));
    }
    if let Some(attrs) = &decisions.post_read_attributes {
        operation.add_response_control(read_entry_response(OID_POST_READ, &new_entry, attrs));
    }

    operation.set_result_code(ResultCode::Success);

    for listener in &ctx.change_listeners {
        listener.handle_modify_dn(operation, &current_entry, &new_entry);
    }

    CoreOutcome::completed(true)
}

/// Builds the renamed entry: new DN, new RDN attribute values merged in,
/// old RDN values removed when requested (but never values the new RDN
/// still claims).
fn apply_rename(
    current_entry: &Entry,
    request: &ModifyDnRequest,
    new_dn: &Dn,
) -> Result<Entry, DirectoryError> {
    let mut entry = current_entry.duplicate();
    let old_rdn = entry.dn().rdn().cloned();
    entry.set_dn(new_dn.clone());

    let mut sink = Vec::new();
    for ava in request.new_rdn.avas() {
        entry.add_attribute(
            &Attribute::new(ava.name.clone(), vec![ava.value.clone()]),
            &mut sink,
        );
        sink.clear();
    }

    if request.delete_old_rdn {
        if let Some(old_rdn) = old_rdn {
            for ava in old_rdn.avas() {
                let kept_by_new_rdn = request
                    .new_rdn
                    .value_for(&ava.attr_type)
                    .is_some_and(|v| *v == ava.value);
                if kept_by_new_rdn {
                    continue;
                }
                let mut missing = Vec::new();
                entry.remove_attribute(
                    &Attribute::new(ava.name.clone(), vec![ava.value.clone()]),
                    &mut missing,
                );
            }
        }
    }

    if !entry.rdn_values_present() {
        return Err(DirectoryError::new(
            ResultCode::ObjectClassViolation,
            format!("renamed entry {new_dn} no longer contains its RDN attribute values"),
        ));
    }
    Ok(entry)
}
