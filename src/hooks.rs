use crate::error::DirectoryError;
use crate::operation::Operation;
use tracing::warn;

/// The verdict every plugin and synchronization-provider call returns. The
/// executor's reaction to each variant is fixed:
///
/// - `ContinueProcessing` — proceed to the next stage.
/// - `SkipCoreProcessing` — short-circuit to completion; post-operation
///   hooks still run.
/// - `SendResponseImmediately` — short-circuit to completion and skip
///   post-operation hooks.
/// - `ConnectionTerminated` — abort with CANCELED and tear down the
///   connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    ContinueProcessing,
    SkipCoreProcessing,
    SendResponseImmediately,
    ConnectionTerminated,
}

/// A replication/synchronization provider's hook contract. Implementations
/// live outside the core; only the call sequence is fixed here.
pub trait SynchronizationProvider: Send + Sync {
    /// Called before core processing so the provider can resolve replication
    /// conflicts. Returning `SkipCoreProcessing` (or any non-continue
    /// verdict) short-circuits the operation.
    fn handle_conflict_resolution(
        &self,
        operation: &mut Operation,
    ) -> Result<HookResult, DirectoryError>;

    /// Called after validation, immediately before the backend commit.
    fn do_pre_operation(&self, operation: &mut Operation) -> Result<HookResult, DirectoryError>;

    /// Called once mutation has been attempted, in the lock-released finally
    /// region, whether or not the commit succeeded.
    fn do_post_operation(&self, operation: &mut Operation) -> Result<(), DirectoryError>;
}

/// The plugin registry's invocation contract, one pair of hook points per
/// operation type. Plugin ordering and configuration live elsewhere.
pub trait PluginManager: Send + Sync {
    fn invoke_pre_operation(&self, operation: &mut Operation) -> HookResult;

    fn invoke_post_operation(&self, operation: &mut Operation) -> HookResult;

    /// Invoked instead of the post-operation hook for synchronization
    /// operations that completed successfully.
    fn invoke_post_synchronization(&self, operation: &mut Operation) {
        let _ = operation;
    }
}

/// No registered plugins.
pub struct NoPlugins;

impl PluginManager for NoPlugins {
    fn invoke_pre_operation(&self, _operation: &mut Operation) -> HookResult {
        HookResult::ContinueProcessing
    }

    fn invoke_post_operation(&self, _operation: &mut Operation) -> HookResult {
        HookResult::ContinueProcessing
    }
}

/// Runs conflict resolution across all providers in registration order. A
/// provider error is logged, recorded on the operation and treated as a
/// short-circuit.
pub fn run_conflict_resolution(
    providers: &[Box<dyn SynchronizationProvider>],
    operation: &mut Operation,
) -> HookResult {
    for provider in providers {
        match provider.handle_conflict_resolution(operation) {
            Ok(HookResult::ContinueProcessing) => {}
            Ok(result) => return result,
            Err(err) => {
                warn!(
                    operation = operation.kind.name(),
                    error = %err,
                    "synchronization conflict resolution failed"
                );
                operation.set_response_data(&err);
                return HookResult::SkipCoreProcessing;
            }
        }
    }
    HookResult::ContinueProcessing
}

/// Runs provider pre-operation hooks immediately before commit.
pub fn run_sync_pre_operation(
    providers: &[Box<dyn SynchronizationProvider>],
    operation: &mut Operation,
) -> HookResult {
    for provider in providers {
        match provider.do_pre_operation(operation) {
            Ok(HookResult::ContinueProcessing) => {}
            Ok(result) => return result,
            Err(err) => {
                warn!(
                    operation = operation.kind.name(),
                    error = %err,
                    "synchronization pre-operation hook failed"
                );
                operation.set_response_data(&err);
                return HookResult::SkipCoreProcessing;
            }
        }
    }
    HookResult::ContinueProcessing
}

/// Runs provider post-operation hooks. Always invoked once mutation has been
/// attempted; a failure is recorded on the operation and stops further
/// providers, but never unwinds the pipeline.
pub fn run_sync_post_operation(
    providers: &[Box<dyn SynchronizationProvider>],
    operation: &mut Operation,
) {
    for provider in providers {
        if let Err(err) = provider.do_post_operation(operation) {
            warn!(
                operation = operation.kind.name(),
                error = %err,
                "synchronization post-operation hook failed"
            );
            operation.set_response_data(&err);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        HookResult, SynchronizationProvider, run_conflict_resolution, run_sync_post_operation,
    };
    use crate::dn::Dn;
    use crate::error::{DirectoryError, ResultCode};
    use crate::operation::{DeleteRequest, Operation, OperationKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        verdict: HookResult,
        calls: AtomicUsize,
    }

    impl SynchronizationProvider for CountingProvider {
        fn handle_conflict_resolution(
            &self,
            _operation: &mut Operation,
        ) -> Result<HookResult, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }

        fn do_pre_operation(
            &self,
            _operation: &mut Operation,
        ) -> Result<HookResult, DirectoryError> {
            Ok(HookResult::ContinueProcessing)
        }

        fn do_post_operation(&self, _operation: &mut Operation) -> Result<(), DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DirectoryError::new(ResultCode::Unavailable, "down"))
        }
    }

    fn op() -> Operation {
        Operation::new(
            OperationKind::Delete(DeleteRequest {
                entry_dn: Dn::parse("cn=x,o=example").unwrap(),
            }),
            Dn::null(),
        )
    }

    #[test]
    fn conflict_resolution_short_circuits() {
        let providers: Vec<Box<dyn SynchronizationProvider>> = vec![
            Box::new(CountingProvider {
                verdict: HookResult::SkipCoreProcessing,
                calls: AtomicUsize::new(0),
            }),
            Box::new(CountingProvider {
                verdict: HookResult::ContinueProcessing,
                calls: AtomicUsize::new(0),
            }),
        ];
        let mut op = op();
        assert_eq!(
            run_conflict_resolution(&providers, &mut op),
            HookResult::SkipCoreProcessing
        );
    }

    #[test]
    fn post_operation_failure_is_recorded_not_propagated() {
        let providers: Vec<Box<dyn SynchronizationProvider>> = vec![Box::new(CountingProvider {
            verdict: HookResult::ContinueProcessing,
            calls: AtomicUsize::new(0),
        })];
        let mut op = op();
        run_sync_post_operation(&providers, &mut op);
        assert_eq!(op.result_code(), ResultCode::Unavailable);
    }
}
