use super::{
    CoreOutcome, PluginVerdict, check_cancel, fetch_entry, finish_operation,
    run_pre_operation_plugins,
};
use crate::attribute::Attribute;
use crate::context::{CoreContext, lock_failure_error};
use crate::controls::{AccountUsability, account_usable_response, process_request_controls};
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::lock::LockMode;
use crate::operation::{EntryMatcher, Operation, OperationKind, SearchRequest};
use crate::pwpolicy::evaluate;
use std::sync::Arc;
use tracing::debug;

pub(crate) fn execute(ctx: &CoreContext, operation: &mut Operation) {
    let OperationKind::Search(request) = &operation.kind else {
        operation.set_result_code(ResultCode::ProtocolError);
        return;
    };
    let request = request.clone();
    let outcome = process(ctx, operation, &request);
    finish_operation(ctx, operation, &outcome);
}

fn process(ctx: &CoreContext, operation: &mut Operation, request: &SearchRequest) -> CoreOutcome {
    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    // The base entry is read under its lock so the visibility check and
    // any assertion control see one consistent state; the lock is released
    // before the backend search runs.
    let base_guard = match ctx.locks.acquire_with_retry(
        &request.base_dn,
        LockMode::Read,
        ctx.config.lock_retry_attempts,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            operation.set_response_data(&lock_failure_error(&ctx.config, err));
            return CoreOutcome::halted_skipping_post_op();
        }
    };

    let base_entry = match fetch_entry(ctx, &request.base_dn) {
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
        Some(&base_entry),
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
    drop(base_guard);

    if !operation.is_internal() && !ctx.access_control.is_allowed(operation) {
        operation.set_response_data(&DirectoryError::new(
            ResultCode::InsufficientAccessRights,
            format!("access to search under {} is denied", request.base_dn),
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

    // A persistent search registers its subscription up front; with
    // changes-only set, the initial result set is suppressed entirely.
    if let Some(spec) = &decisions.persistent_search {
        let id = ctx
            .persistent_searches
            .register(request.base_dn.clone(), spec.clone());
        debug!(id, base = %request.base_dn, "registered persistent search");
        if spec.changes_only {
            operation.set_result_code(ResultCode::Success);
            return CoreOutcome::completed(false);
        }
    }

    if check_cancel(operation) {
        return CoreOutcome::halted();
    }

    let mut entries = match ctx.backend.search(request) {
        Ok(entries) => entries,
        Err(err) => {
            operation.set_response_data(&err);
            return CoreOutcome::halted();
        }
    };

    // Subentry visibility: by default subentries are excluded; the draft
    // control (and a visibility of true) flips the search to subentries
    // only.
    let subentries_only =
        decisions.subentries_only || decisions.subentries_visibility == Some(true);
    entries.retain(|e| is_subentry(e) == subentries_only);

    if let Some(matcher) = &decisions.matched_values {
        for entry in &mut entries {
            apply_matched_values(entry, matcher);
        }
    }

    if request.types_only {
        for entry in &mut entries {
            strip_values(entry);
        }
    }

    let mut result_code = ResultCode::Success;
    if request.size_limit > 0 && entries.len() > request.size_limit as usize {
        entries.truncate(request.size_limit as usize);
        result_code = ResultCode::SizeLimitExceeded;
        operation.append_error_message("the search hit the size limit");
    }

    if decisions.account_usable_requested {
        let assessment = evaluate(&base_entry, &ctx.password_policy, ctx.now());
        let locked = assessment.locked_due_to_failures
            || assessment.locked_due_to_idle_interval
            || assessment.locked_due_to_maximum_reset_age;
        operation.add_response_control(account_usable_response(AccountUsability {
            is_usable: !assessment.is_disabled
                && !assessment.is_account_expired
                && !assessment.is_password_expired
                && !locked,
            seconds_before_expiration: assessment.seconds_until_expiration,
            inactive: assessment.is_disabled,
            reset: assessment.must_change_password,
            expired: assessment.is_password_expired,
            remaining_grace_logins: None,
            seconds_before_unlock: assessment.seconds_until_unlock,
        }));
    }

    operation.search_result_entries = entries;
    operation.set_result_code(result_code);
    CoreOutcome::completed(false)
}

fn is_subentry(entry: &Entry) -> bool {
    entry.has_object_class("subentry") || entry.has_object_class("ldapsubentry")
}

/// Retains only the attribute values the matched-values filter accepts,
/// probing each value in isolation against the filter.
fn apply_matched_values(entry: &mut Entry, matcher: &Arc<dyn EntryMatcher>) {
    let attrs: Vec<Attribute> = entry.all_attributes().cloned().collect();
    for attr in attrs {
        let kept: Vec<_> = attr
            .values()
            .iter()
            .filter(|value| {
                let mut probe = Entry::new(entry.dn().clone());
                let mut sink = Vec::new();
                let mut single = attr.clone();
                single.set_values(vec![(*value).clone()]);
                probe.add_attribute(&single, &mut sink);
                matcher.matches(&probe).unwrap_or(false)
            })
            .cloned()
            .collect();
        let mut filtered = attr.clone();
        filtered.set_values(kept);
        entry.replace_attribute_instance(&filtered);
    }
}

fn strip_values(entry: &mut Entry) {
    let attrs: Vec<Attribute> = entry.all_attributes().cloned().collect();
    for attr in attrs {
        let mut stripped = attr.clone();
        stripped.set_values(Vec::new());
        entry.replace_attribute_instance(&stripped);
    }
}
