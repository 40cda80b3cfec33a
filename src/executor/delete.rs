use super::{
    CoreOutcome, PluginVerdict, apply_hook_verdict, check_cancel, check_writability, fetch_entry,
    finish_operation, run_pre_operation_plugins,
};
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::{OID_PRE_READ, process_request_controls, read_entry_response};
use crate::error::{DirectoryError, ResultCode};
use crate::hooks::{run_conflict_resolution, run_sync_post_operation, run_sync_pre_operation};
use crate::lock::LockMode;
use crate::operation::{DeleteRequest, Operation, OperationKind};

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Delete(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &DeleteRequest) -> CoreOutcome {
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
        core(ctx, operation, request)
    };

    run_sync_post_operation(&ctx.sync_providers, operation);
    outcome
}

fn core(ctx: &CoreContext, operation: &mut Operation, request: &DeleteRequest) -> CoreOutcome {
    let entry = match fetch_entry(ctx, &request.entry_dn) {
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
            format!("access to delete entry {} is denied", request.entry_dn),
        ));
        return CoreOutcome::halted_skipping_post_op();
    }

    // Only leaf entries may be deleted.
    match ctx.backend.has_subordinates(&request.entry_dn) {
        Ok(false) => {}
        Ok(true) => {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::NotAllowedOnNonLeaf,
                format!("entry {} has subordinate entries", request.entry_dn),
            ));
            return CoreOutcome::halted();
        }
        Err(err) => {
            operation.set_response_data(&err);
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
        operation.append_error_message("no-op control: the delete was validated but not applied");
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

    if let Err(err) = ctx.backend.delete_entry(&request.entry_dn, operation) {
        operation.set_response_data(&err);
        return CoreOutcome::halted();
    }

    if let Some(attrs) = &decisions.pre_read_attributes {
        operation.add_response_control(read_entry_response(OID_PRE_READ, &entry, attrs));
    }

    operation.set_result_code(ResultCode::Success);

    for listener in &ctx.change_listeners {
        listener.handle_delete(operation, &entry);
    }

    CoreOutcome::completed(true)
}
