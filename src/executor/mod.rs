//! Operation executors: one pipeline per operation type, sharing the
//! checkpoint, lock, writability and hook plumbing defined here.
//!
//! Every pipeline writes its outcome into the `Operation` and returns;
//! errors never escape an executor. The unlock-then-post-hooks ordering is
//! enforced structurally: lock guards are scoped to the core stage, and the
//! post-operation stages run after that scope ends.

pub mod add;
pub mod bind;
pub mod compare;
pub mod delete;
pub mod modify;
pub mod modify_dn;
pub mod search;

use crate::config::WritabilityMode;
use crate::context::CoreContext;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::hooks::HookResult;
use crate::operation::{Operation, OperationKind};
use tracing::debug;

/// Runs one operation through its executor.
pub fn execute(ctx: &CoreContext, operation: &mut Operation) {
    debug!(
        operation = operation.kind.name(),
        target = %operation.target_dn(),
        internal = operation.is_internal(),
        "executing operation"
    );
    match &operation.kind {
        OperationKind::Add(_) => add::execute(ctx, operation),
        OperationKind::Delete(_) => delete::execute(ctx, operation),
        OperationKind::Modify(_) => modify::execute(ctx, operation),
        OperationKind::ModifyDn(_) => modify_dn::execute(ctx, operation),
        OperationKind::Search(_) => search::execute(ctx, operation),
        OperationKind::Bind(_) => bind::execute(ctx, operation),
        OperationKind::Compare(_) => compare::execute(ctx, operation),
    }
}

/// How the core stage of a write pipeline ended. The wrapper uses this to
/// decide whether the post-operation hooks still run.
pub(crate) struct CoreOutcome {
    pub skip_post_operation: bool,
    /// Set only when the backend mutation committed.
    pub committed: bool,
}

impl CoreOutcome {
    pub(crate) fn completed(committed: bool) -> Self {
        Self {
            skip_post_operation: false,
            committed,
        }
    }

    pub(crate) fn halted() -> Self {
        Self::completed(false)
    }

    pub(crate) fn halted_skipping_post_op() -> Self {
        Self {
            skip_post_operation: true,
            committed: false,
        }
    }
}

/// Cancellation checkpoint. When a cancel request is pending, records the
/// terminal cancel state and returns true.
pub(crate) fn check_cancel(operation: &mut Operation) -> bool {
    if !operation.is_cancel_requested() {
        return false;
    }
    operation.set_result_code(ResultCode::Canceled);
    operation.set_cancel_result(ResultCode::Canceled);
    operation.append_error_message("processing stopped on a cancel request");
    true
}

/// Reads the target entry, reporting the nearest existing ancestor as the
/// matched DN when it does not exist.
pub(crate) fn fetch_entry(ctx: &CoreContext, dn: &Dn) -> Result<Entry, DirectoryError> {
    match ctx.backend.get_entry(dn)? {
        Some(entry) => Ok(entry),
        None => Err(DirectoryError::new(
            ResultCode::NoSuchObject,
            format!("entry {dn} does not exist"),
        )
        .with_matched_dn(ctx.nearest_existing_ancestor(dn))),
    }
}

/// Server-wide and backend writability gates. Internal and synchronization
/// operations pass an `InternalOnly` mode; nothing passes `Disabled`.
pub(crate) fn check_writability(
    ctx: &CoreContext,
    operation: &Operation,
) -> Result<(), DirectoryError> {
    let privileged = operation.is_internal() || operation.is_synchronization();
    if ctx.backend.is_private_backend() && !privileged {
        return Err(DirectoryError::new(
            ResultCode::UnwillingToPerform,
            "the target backend does not accept client writes",
        ));
    }
    let gate = |mode: WritabilityMode, scope: &str| match mode {
        WritabilityMode::Enabled => Ok(()),
        WritabilityMode::InternalOnly if privileged => Ok(()),
        WritabilityMode::InternalOnly | WritabilityMode::Disabled => Err(DirectoryError::new(
            ResultCode::UnwillingToPerform,
            format!("{scope} is not writable"),
        )),
    };
    gate(ctx.config.writability_mode, "the server")?;
    gate(ctx.backend.writability_mode(), "the backend")
}

pub(crate) enum PluginVerdict {
    Continue,
    Halt { skip_post_operation: bool },
}

/// Pre-operation plugin stage. Synchronization operations bypass plugins
/// entirely.
pub(crate) fn run_pre_operation_plugins(
    ctx: &CoreContext,
    operation: &mut Operation,
) -> PluginVerdict {
    if operation.is_synchronization() {
        return PluginVerdict::Continue;
    }
    match ctx.plugins.invoke_pre_operation(operation) {
        HookResult::ContinueProcessing => PluginVerdict::Continue,
        HookResult::SkipCoreProcessing => PluginVerdict::Halt {
            skip_post_operation: false,
        },
        HookResult::SendResponseImmediately => PluginVerdict::Halt {
            skip_post_operation: true,
        },
        HookResult::ConnectionTerminated => {
            operation.connection_terminated = true;
            operation.set_result_code(ResultCode::Canceled);
            operation.append_error_message("a pre-operation plugin terminated the connection");
            PluginVerdict::Halt {
                skip_post_operation: true,
            }
        }
    }
}

/// The shared tail of every write pipeline: stamp the too-late cancel
/// result, then run the post-operation (or post-synchronization) plugins.
pub(crate) fn finish_operation(ctx: &CoreContext, operation: &mut Operation, outcome: &CoreOutcome) {
    if operation.cancel_result().is_none() {
        operation.set_cancel_result(ResultCode::TooLate);
    }
    if outcome.skip_post_operation || operation.connection_terminated {
        return;
    }
    if operation.is_synchronization() {
        if outcome.committed {
            ctx.plugins.invoke_post_synchronization(operation);
        }
    } else {
        ctx.plugins.invoke_post_operation(operation);
    }
}

/// Synchronization-provider hook reaction shared by the write executors.
pub(crate) fn apply_hook_verdict(operation: &mut Operation, verdict: HookResult) -> PluginVerdict {
    match verdict {
        HookResult::ContinueProcessing => PluginVerdict::Continue,
        HookResult::SkipCoreProcessing => PluginVerdict::Halt {
            skip_post_operation: false,
        },
        HookResult::SendResponseImmediately => PluginVerdict::Halt {
            skip_post_operation: true,
        },
        HookResult::ConnectionTerminated => {
            operation.connection_terminated = true;
            operation.set_result_code(ResultCode::Canceled);
            operation.append_error_message("a synchronization provider terminated the connection");
            PluginVerdict::Halt {
                skip_post_operation: true,
            }
        }
    }
}

/// Persists password-policy state modifications outside a write pipeline
/// (the Bind executor has no commit of its own to ride on). The entry is
/// re-read under a write lock so the updates merge into the latest
/// committed state instead of a stale snapshot. Best effort.
pub(crate) fn persist_state_updates(
    ctx: &CoreContext,
    dn: &Dn,
    updates: &[crate::modify::Modification],
    operation: &Operation,
) {
    if updates.is_empty() {
        return;
    }
    let _guard = match ctx.locks.acquire_with_retry(
        dn,
        crate::lock::LockMode::Write,
        ctx.config.lock_retry_attempts,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            tracing::warn!(dn = %dn, error = %err, "skipping password policy state persist");
            return;
        }
    };
    let mut updated = match ctx.backend.get_entry(dn) {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(
                dn = %dn,
                error = %err,
                "failed to re-read entry for password policy state"
            );
            return;
        }
    };
    crate::modify::apply_state_updates(&mut updated, updates);
    if let Err(err) = ctx.backend.replace_entry(updated, operation) {
        tracing::warn!(dn = %dn, error = %err, "failed to persist password policy state");
    }
}
