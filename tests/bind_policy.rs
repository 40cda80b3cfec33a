mod common;

use common::{MemoryBackend, dn, person, seeded_context, test_now, test_schema};
use dircore::attribute::Attribute;
use dircore::config::CoreConfig;
use dircore::context::CoreContext;
use dircore::controls::{
    Control, ControlPayload, OID_NS_PASSWORD_EXPIRED, OID_NS_PASSWORD_EXPIRING,
    OID_PASSWORD_POLICY,
};
use dircore::dn::Dn;
use dircore::entry::Entry;
use dircore::error::{DirectoryError, ResultCode};
use dircore::executor;
use dircore::operation::{
    BindCredentials, BindRequest, ClientState, Operation, OperationKind, SaslMechanismHandler,
};
use dircore::pwpolicy::{
    ATTR_PASSWORD_CHANGED_TIME, ATTR_PASSWORD_FAILURE_TIME, ATTR_PASSWORD_GRACE_USE_TIME,
    ATTR_PASSWORD_RESET, ATTR_ACCOUNT_DISABLED, ATTR_SIZE_LIMIT, AccountStatusNotification,
    AccountStatusNotificationHandler, AccountStatusNotificationType, PasswordPolicy,
    PasswordPolicyErrorType, state::format_generalized_time,
};
use parking_lot::Mutex;
use std::sync::Arc;

const PASSWORD: &str = "brass-horse-42";

fn account(dn_text: &str, policy: &PasswordPolicy) -> Entry {
    let mut entry = person(dn_text, "Tester");
    let mut sink = Vec::new();
    let encoded: Vec<String> = policy.encode_password(PASSWORD);
    let values: Vec<&str> = encoded.iter().map(String::as_str).collect();
    entry.add_attribute(&Attribute::of("userPassword", &values), &mut sink);
    entry
}

fn stamp(entry: &mut Entry, attr: &str, values: &[String]) {
    let mut sink = Vec::new();
    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    entry.add_operational_attribute(&Attribute::of(attr, &values), &mut sink);
}

fn simple_bind(target: &str, password: &str) -> Operation {
    Operation::new(
        OperationKind::Bind(BindRequest {
            bind_dn: dn(target),
            credentials: BindCredentials::Simple {
                password: password.to_string(),
            },
        }),
        Dn::null(),
    )
}

fn run(ctx: &CoreContext, mut op: Operation) -> Operation {
    executor::execute(ctx, &mut op);
    op
}

fn days_ago(days: i64) -> String {
    format_generalized_time(test_now() - chrono::Duration::days(days))
}

fn seconds_ago(seconds: i64) -> String {
    format_generalized_time(test_now() - chrono::Duration::seconds(seconds))
}

struct RecordingHandler {
    seen: Mutex<Vec<AccountStatusNotificationType>>,
}

impl AccountStatusNotificationHandler for RecordingHandler {
    fn handle(&self, notification: &AccountStatusNotification) {
        self.seen.lock().push(notification.notification_type);
    }
}

#[test]
fn anonymous_bind_succeeds() {
    let (_, ctx) = seeded_context(Vec::new());
    let op = run(&ctx, simple_bind("", ""));
    assert_eq!(op.result_code(), ResultCode::Success);
    assert!(op.authenticated_dn.as_ref().unwrap().is_null());
}

#[test]
fn bind_dn_without_password_is_rejected_by_default() {
    let policy = PasswordPolicy::default();
    let (_, ctx) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", ""));
    assert_eq!(op.result_code(), ResultCode::UnwillingToPerform);
}

#[test]
fn correct_password_authenticates_and_picks_up_resource_limits() {
    let policy = PasswordPolicy::default();
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_SIZE_LIMIT, &["250".to_string()]);
    let (backend, ctx) = seeded_context(vec![entry]);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    assert_eq!(
        op.authenticated_dn.as_ref().unwrap().normalized(),
        "uid=kira,ou=people,o=example"
    );
    assert_eq!(op.resource_limits.unwrap().size_limit, Some(250));
    // A successful bind stamps the last-login time.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert!(stored.has_attribute("ds-pwp-last-login-time"));
}

#[test]
fn missing_account_reads_as_invalid_credentials() {
    let (_, ctx) = seeded_context(Vec::new());
    let op = run(&ctx, simple_bind("uid=ghost,ou=people,o=example", "anything"));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
    // No matched DN leaks for a bind.
    assert!(op.matched_dn().is_none());
}

#[test]
fn repeated_failures_lock_the_account() {
    let policy = PasswordPolicy {
        lockout_failure_count: 3,
        lockout_duration_secs: 300,
        ..PasswordPolicy::default()
    };
    let handler = Arc::new(RecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    let (backend, _) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy)
        .with_notification_handlers(vec![handler.clone()]);

    for _ in 0..3 {
        let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", "wrong"));
        assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
    }
    assert!(handler
        .seen
        .lock()
        .contains(&AccountStatusNotificationType::AccountTemporarilyLocked));
    // Failure times persisted through the backend.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert_eq!(
        stored.get_attribute(ATTR_PASSWORD_FAILURE_TIME)[0].values().len(),
        3
    );

    // Even the correct password is refused while the lockout holds.
    let op = run(
        &ctx,
        simple_bind("uid=kira,ou=people,o=example", PASSWORD)
            .with_controls(vec![Control::flag(OID_PASSWORD_POLICY, false)]),
    );
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
    let pwp = op
        .response_controls()
        .iter()
        .find(|c| c.oid == OID_PASSWORD_POLICY)
        .expect("password policy response");
    match &pwp.payload {
        ControlPayload::PasswordPolicyResponse { error, .. } => {
            assert_eq!(*error, Some(PasswordPolicyErrorType::AccountLocked));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

/// Rewrites the entry through the backend from inside the notification
/// callback, the way a provisioning hook reacting to a lockout would.
struct EntryTaggingHandler {
    backend: Arc<MemoryBackend>,
}

impl AccountStatusNotificationHandler for EntryTaggingHandler {
    fn handle(&self, notification: &AccountStatusNotification) {
        let Some(mut entry) = self.backend.stored(&notification.entry_dn) else {
            return;
        };
        let mut sink = Vec::new();
        entry.add_attribute(
            &Attribute::of("description", &["flagged by the lockout handler"]),
            &mut sink,
        );
        self.backend.seed(entry);
    }
}

#[test]
fn handler_writes_during_a_failing_bind_survive_the_state_persist() {
    let policy = PasswordPolicy {
        lockout_failure_count: 1,
        lockout_duration_secs: 300,
        ..PasswordPolicy::default()
    };
    let (backend, _) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy)
        .with_notification_handlers(vec![Arc::new(EntryTaggingHandler {
            backend: backend.clone(),
        })]);

    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", "wrong"));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);

    // The single failure crossed the threshold and the handler rewrote the
    // entry mid-bind; the failure-time persist merges into that rewrite
    // instead of replacing it with the snapshot read before the handler ran.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert!(stored.has_attribute("description"));
    assert_eq!(
        stored.get_attribute(ATTR_PASSWORD_FAILURE_TIME)[0].values().len(),
        1
    );
}

#[test]
fn temporary_lockout_expires_after_the_configured_duration() {
    let policy = PasswordPolicy {
        lockout_failure_count: 3,
        lockout_duration_secs: 300,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(
        &mut entry,
        ATTR_PASSWORD_FAILURE_TIME,
        &[seconds_ago(500), seconds_ago(450), seconds_ago(400)],
    );
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    // The stale failures are cleared on success.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert!(stored.get_attribute(ATTR_PASSWORD_FAILURE_TIME).is_empty());
}

#[test]
fn disabled_account_cannot_authenticate() {
    let policy = PasswordPolicy::default();
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_ACCOUNT_DISABLED, &["true".to_string()]);
    let (_, ctx) = seeded_context(vec![entry]);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
    assert!(op.error_message().contains("disabled"));
}

#[test]
fn secure_authentication_requirement_gates_insecure_clients() {
    let policy = PasswordPolicy {
        require_secure_authentication: true,
        ..PasswordPolicy::default()
    };
    let (backend, _) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let ctx = CoreContext::new(backend, CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);

    let insecure = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(insecure.result_code(), ResultCode::ConfidentialityRequired);

    let secure_client = ClientState {
        secure: true,
        ..ClientState::default()
    };
    let secure = run(
        &ctx,
        simple_bind("uid=kira,ou=people,o=example", PASSWORD).with_client(secure_client),
    );
    assert_eq!(secure.result_code(), ResultCode::Success);
}

#[test]
fn expired_password_without_grace_is_refused() {
    let policy = PasswordPolicy {
        max_password_age_secs: 30 * 86_400,
        expire_passwords_without_warning: true,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_PASSWORD_CHANGED_TIME, &[days_ago(45)]);
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend, CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
    assert!(op
        .response_controls()
        .iter()
        .any(|c| c.oid == OID_NS_PASSWORD_EXPIRED));
}

#[test]
fn grace_login_admits_an_expired_password_once_per_budget() {
    let policy = PasswordPolicy {
        max_password_age_secs: 30 * 86_400,
        expire_passwords_without_warning: true,
        grace_login_count: 1,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_PASSWORD_CHANGED_TIME, &[days_ago(45)]);
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);

    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    assert!(op.must_change_password_after_bind);
    assert!(op
        .response_controls()
        .iter()
        .any(|c| c.oid == OID_NS_PASSWORD_EXPIRED));
    // The grace use was recorded, exhausting the budget.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert_eq!(
        stored.get_attribute(ATTR_PASSWORD_GRACE_USE_TIME)[0].values().len(),
        1
    );

    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);
}

#[test]
fn expiration_warning_is_delivered_inside_the_window() {
    let policy = PasswordPolicy {
        max_password_age_secs: 30 * 86_400,
        warning_interval_secs: 5 * 86_400,
        expire_passwords_without_warning: true,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_PASSWORD_CHANGED_TIME, &[days_ago(27)]);
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend.clone(), CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);
    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    assert!(op
        .response_controls()
        .iter()
        .any(|c| c.oid == OID_NS_PASSWORD_EXPIRING));
    // First warning records the warned time.
    let stored = backend.stored(&dn("uid=kira,ou=people,o=example")).unwrap();
    assert!(stored.has_attribute("ds-pwp-warned-time"));
}

#[test]
fn administrative_reset_forces_a_change_after_bind() {
    let policy = PasswordPolicy {
        force_change_on_reset: true,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_PASSWORD_RESET, &["TRUE".to_string()]);
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend, CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);
    let op = run(
        &ctx,
        simple_bind("uid=kira,ou=people,o=example", PASSWORD)
            .with_controls(vec![Control::flag(OID_PASSWORD_POLICY, false)]),
    );
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    assert!(op.must_change_password_after_bind);
    let pwp = op
        .response_controls()
        .iter()
        .find(|c| c.oid == OID_PASSWORD_POLICY)
        .expect("password policy response");
    match &pwp.payload {
        ControlPayload::PasswordPolicyResponse { error, .. } => {
            assert_eq!(*error, Some(PasswordPolicyErrorType::ChangeAfterReset));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn lockdown_mode_rejects_non_root_binds() {
    let policy = PasswordPolicy::default();
    let (backend, _) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let mut config = CoreConfig::default();
    config.lockdown_mode = true;
    let ctx = CoreContext::new(backend, config)
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy);

    let op = run(&ctx, simple_bind("uid=kira,ou=people,o=example", PASSWORD));
    assert_eq!(op.result_code(), ResultCode::InvalidCredentials);

    let root = ClientState {
        is_root: true,
        ..ClientState::default()
    };
    let op = run(
        &ctx,
        simple_bind("uid=kira,ou=people,o=example", PASSWORD).with_client(root),
    );
    assert_eq!(op.result_code(), ResultCode::Success);
}

struct FixedIdentity {
    dn: Dn,
    password_based: bool,
}

impl SaslMechanismHandler for FixedIdentity {
    fn authenticate(
        &self,
        _operation: &mut Operation,
        credentials: Option<&[u8]>,
    ) -> Result<Dn, DirectoryError> {
        match credentials {
            Some(_) => Ok(self.dn.clone()),
            None => Err(DirectoryError::new(
                ResultCode::InvalidCredentials,
                "no credentials supplied",
            )),
        }
    }

    fn is_password_based(&self) -> bool {
        self.password_based
    }
}

fn sasl_bind(mechanism: &str, credentials: Option<Vec<u8>>) -> Operation {
    Operation::new(
        OperationKind::Bind(BindRequest {
            bind_dn: Dn::null(),
            credentials: BindCredentials::Sasl {
                mechanism: mechanism.to_string(),
                credentials,
            },
        }),
        Dn::null(),
    )
}

#[test]
fn unknown_sasl_mechanism_is_not_supported() {
    let (_, ctx) = seeded_context(Vec::new());
    let op = run(&ctx, sasl_bind("SCRAM-SHA-512", Some(b"x".to_vec())));
    assert_eq!(op.result_code(), ResultCode::AuthMethodNotSupported);
}

#[test]
fn sasl_bind_resolves_through_the_registered_handler() {
    let policy = PasswordPolicy::default();
    let (backend, _) = seeded_context(vec![account("uid=kira,ou=people,o=example", &policy)]);
    let ctx = CoreContext::new(backend, CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy)
        .with_sasl_handler(
            "external",
            Arc::new(FixedIdentity {
                dn: dn("uid=kira,ou=people,o=example"),
                password_based: false,
            }),
        );
    // Mechanism lookup is case-insensitive.
    let op = run(&ctx, sasl_bind("EXTERNAL", Some(b"proof".to_vec())));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
    assert_eq!(
        op.authenticated_dn.as_ref().unwrap().normalized(),
        "uid=kira,ou=people,o=example"
    );
}

#[test]
fn non_password_sasl_bind_skips_expiration_gates() {
    let policy = PasswordPolicy {
        max_password_age_secs: 30 * 86_400,
        expire_passwords_without_warning: true,
        ..PasswordPolicy::default()
    };
    let mut entry = account("uid=kira,ou=people,o=example", &policy);
    stamp(&mut entry, ATTR_PASSWORD_CHANGED_TIME, &[days_ago(45)]);
    let (backend, _) = seeded_context(vec![entry]);
    let ctx = CoreContext::new(backend, CoreConfig::default())
        .with_schema(Arc::new(test_schema()))
        .with_clock(test_now)
        .with_password_policy(policy)
        .with_sasl_handler(
            "external",
            Arc::new(FixedIdentity {
                dn: dn("uid=kira,ou=people,o=example"),
                password_based: false,
            }),
        );
    let op = run(&ctx, sasl_bind("EXTERNAL", Some(b"proof".to_vec())));
    assert_eq!(op.result_code(), ResultCode::Success, "{}", op.error_message());
}
