use crate::backend::{
    AccessControlHandler, AllowAllAccessControl, BackendRef, ChangeNotificationListener,
    PersistentSearchRegistry,
};
use crate::config::CoreConfig;
use crate::dn::Dn;
use crate::error::DirectoryError;
use crate::hooks::{NoPlugins, PluginManager, SynchronizationProvider};
use crate::lock::LockManager;
use crate::operation::SaslMechanismHandler;
use crate::pwpolicy::{
    AccountStatusNotification, AccountStatusNotificationHandler, AccountStatusNotificationType,
    PasswordPolicy,
};
use crate::schema::{CoreSchema, Schema};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything the executors need to process operations: the backend under
/// them, the seams around them and the shared lock table. One instance per
/// served naming context; cheap to share behind an `Arc`.
pub struct CoreContext {
    pub backend: BackendRef,
    pub schema: Arc<dyn Schema>,
    pub access_control: Arc<dyn AccessControlHandler>,
    pub plugins: Arc<dyn PluginManager>,
    pub sync_providers: Vec<Box<dyn SynchronizationProvider>>,
    pub change_listeners: Vec<Arc<dyn ChangeNotificationListener>>,
    pub notification_handlers: Vec<Arc<dyn AccountStatusNotificationHandler>>,
    pub persistent_searches: Arc<PersistentSearchRegistry>,
    pub locks: LockManager,
    pub config: CoreConfig,
    pub password_policy: PasswordPolicy,
    pub sasl_handlers: HashMap<String, Arc<dyn SaslMechanismHandler>>,
    clock: Clock,
}

impl CoreContext {
    pub fn new(backend: BackendRef, config: CoreConfig) -> Self {
        let locks = LockManager::new(Duration::from_millis(config.lock_timeout_ms));
        Self {
            backend,
            schema: Arc::new(CoreSchema::new()),
            access_control: Arc::new(AllowAllAccessControl),
            plugins: Arc::new(NoPlugins),
            sync_providers: Vec::new(),
            change_listeners: Vec::new(),
            notification_handlers: Vec::new(),
            persistent_searches: Arc::new(PersistentSearchRegistry::new()),
            locks,
            config,
            password_policy: PasswordPolicy::default(),
            sasl_handlers: HashMap::new(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_access_control(mut self, access_control: Arc<dyn AccessControlHandler>) -> Self {
        self.access_control = access_control;
        self
    }

    pub fn with_plugins(mut self, plugins: Arc<dyn PluginManager>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_sync_providers(
        mut self,
        providers: Vec<Box<dyn SynchronizationProvider>>,
    ) -> Self {
        self.sync_providers = providers;
        self
    }

    pub fn with_change_listeners(
        mut self,
        listeners: Vec<Arc<dyn ChangeNotificationListener>>,
    ) -> Self {
        self.change_listeners = listeners;
        self
    }

    pub fn with_notification_handlers(
        mut self,
        handlers: Vec<Arc<dyn AccountStatusNotificationHandler>>,
    ) -> Self {
        self.notification_handlers = handlers;
        self
    }

    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    pub fn with_sasl_handler(
        mut self,
        mechanism: impl Into<String>,
        handler: Arc<dyn SaslMechanismHandler>,
    ) -> Self {
        self.sasl_handlers
            .insert(mechanism.into().to_uppercase(), handler);
        self
    }

    /// Pins the clock, for deterministic policy evaluation in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// The nearest ancestor of a DN that actually exists, reported as the
    /// matched DN on no-such-object failures.
    pub fn nearest_existing_ancestor(&self, dn: &Dn) -> Option<Dn> {
        for ancestor in dn.ancestors() {
            match self.backend.entry_exists(&ancestor) {
                Ok(true) => return Some(ancestor),
                Ok(false) => {}
                Err(err) => {
                    warn!(dn = %ancestor, error = %err, "matched-DN probe failed");
                    return None;
                }
            }
        }
        None
    }

    /// Fans an account status notification out to every handler. Best
    /// effort by contract.
    pub fn send_account_status_notification(
        &self,
        notification_type: AccountStatusNotificationType,
        entry_dn: &Dn,
        message: impl Into<String>,
    ) {
        if self.notification_handlers.is_empty() {
            return;
        }
        let notification = AccountStatusNotification {
            notification_type,
            entry_dn: entry_dn.clone(),
            message: message.into(),
        };
        for handler in &self.notification_handlers {
            handler.handle(&notification);
        }
    }
}

/// Converts a lock failure into the operation-level error the executors
/// report, using the configured server-error result code.
pub fn lock_failure_error(config: &CoreConfig, err: crate::error::LockError) -> DirectoryError {
    DirectoryError::new(config.server_error_result_code, err.to_string())
}
