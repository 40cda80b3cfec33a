use super::{
    CoreOutcome, PluginVerdict, check_cancel, fetch_entry, finish_operation,
    run_pre_operation_plugins,
};
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::process_request_controls;
use crate::error::{DirectoryError, ResultCode};
use crate::lock::LockMode;
use crate::operation::{CompareRequest, Operation, OperationKind};

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Compare(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &CompareRequest) -> CoreOutcome {
    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    // The fetch and the assertion read one consistent entry state.
    let _guard = match ctx.locks.acquire_with_retry(
        &request.entry_dn,
        LockMode::Read,
        ctx.config.lock_retry_attempts,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            operation.set_response_data(&lock_failure_error(&ctx.config, err));
            return CoreOutcome::halted_skipping_post_op();
        }
    };

    let entry = match fetch_entry(ctx, &request.entry_dn) {
        Ok(entry) => entry,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    if let Err(err) = process_request_controls(
        operation,
        ctx.access_control.as_ref(),
        ctx.backend.as_ref(),
        Some(&entry),
    ) {
        operation.set_response_data(&err.error);
        return if err.skip_post_operation {
            CoreOutcome::halted_skipping_post_op()
        } else {
            CoreOutcome::halted()
        };
    }

    if !operation.is_internal() && !ctx.access_control.is_allowed(operation) {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InsufficientAccessRights,
            format!("access to compare against entry {} is denied", request.entry_dn),
        ));
        return CoreOutcome::halted_skipping_post_op();
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

    let result = match entry.get_attribute_with_options(&request.attribute, &request.options) {
        None => {
            operation.set_response_data(&DirectoryError::new(
                ResultCode::NoSuchAttribute,
                format!(
                    "entry {} has no attribute {} with the requested options",
                    request.entry_dn, request.attribute
                ),
            ));
            return CoreOutcome::halted();
        }
        Some(attr) if attr.contains(&request.value) => ResultCode::CompareTrue,
        Some(_) => ResultCode::CompareFalse,
    };
    operation.set_result_code(result);
    CoreOutcome::completed(false)
}
