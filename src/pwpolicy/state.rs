use super::{
    ATTR_ACCOUNT_DISABLED, ATTR_ACCOUNT_EXPIRATION_TIME, ATTR_LAST_LOGIN_TIME,
    ATTR_PASSWORD_CHANGED_TIME, ATTR_PASSWORD_FAILURE_TIME, ATTR_PASSWORD_GRACE_USE_TIME,
    ATTR_PASSWORD_HISTORY, ATTR_PASSWORD_RESET, ATTR_WARNED_TIME, PasswordPolicy, scheme,
};
use crate::attribute::{Attribute, AttributeValue};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::modify::Modification;
use chrono::{DateTime, NaiveDateTime, Utc};

const GENERALIZED_TIME: &str = "%Y%m%d%H%M%SZ";

pub fn format_generalized_time(time: DateTime<Utc>) -> String {
    time.format(GENERALIZED_TIME).to_string()
}

pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), GENERALIZED_TIME)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The point-in-time verdict of evaluating a policy against an account
/// entry. Pure data; the Bind executor turns it into result codes and
/// notifications in a fixed priority order.
#[derive(Debug, Clone, Default)]
pub struct PolicyAssessment {
    pub is_disabled: bool,
    pub is_account_expired: bool,
    pub locked_due_to_failures: bool,
    /// Set for a temporary failure lockout; `None` when the lockout only
    /// clears administratively. Never negative.
    pub seconds_until_unlock: Option<i64>,
    pub locked_due_to_idle_interval: bool,
    pub locked_due_to_maximum_reset_age: bool,
    pub is_password_expired: bool,
    pub may_use_grace_login: bool,
    pub grace_logins_used: u32,
    pub should_warn: bool,
    pub is_first_warning: bool,
    pub must_change_password: bool,
    pub seconds_until_expiration: Option<i64>,
    pub failure_count: u32,
}

fn parse_times(entry: &Entry, attr_type: &str) -> Vec<DateTime<Utc>> {
    entry
        .get_attribute(attr_type)
        .iter()
        .flat_map(|a| a.values())
        .filter_map(|v| parse_generalized_time(v.raw()))
        .collect()
}

fn parse_time(entry: &Entry, attr_type: &str) -> Option<DateTime<Utc>> {
    entry
        .first_value(attr_type)
        .and_then(|v| parse_generalized_time(v.raw()))
}

fn bool_attr(entry: &Entry, attr_type: &str) -> bool {
    entry
        .first_value(attr_type)
        .is_some_and(|v| v.normalized() == "true")
}

/// Evaluates the policy against an account entry at one instant. Reads the
/// per-entry state attributes; never mutates anything.
pub fn evaluate(entry: &Entry, policy: &PasswordPolicy, now: DateTime<Utc>) -> PolicyAssessment {
    let mut assessment = PolicyAssessment {
        is_disabled: bool_attr(entry, ATTR_ACCOUNT_DISABLED),
        is_account_expired: parse_time(entry, ATTR_ACCOUNT_EXPIRATION_TIME)
            .is_some_and(|expires| expires <= now),
        ..PolicyAssessment::default()
    };

    let changed_time = parse_time(entry, ATTR_PASSWORD_CHANGED_TIME);
    let reset_flag = bool_attr(entry, ATTR_PASSWORD_RESET);

    // Failure lockout.
    if policy.lockout_failure_count > 0 {
        let mut failures = parse_times(entry, ATTR_PASSWORD_FAILURE_TIME);
        if policy.lockout_failure_expiration_secs > 0 {
            let horizon =
                now - chrono::Duration::seconds(policy.lockout_failure_expiration_secs as i64);
            failures.retain(|t| *t > horizon);
        }
        assessment.failure_count = failures.len() as u32;
        if failures.len() as u32 >= policy.lockout_failure_count {
            let last_failure = failures.iter().max().copied().unwrap_or(now);
            if policy.lockout_duration_secs > 0 {
                let unlock_at =
                    last_failure + chrono::Duration::seconds(policy.lockout_duration_secs as i64);
                if unlock_at > now {
                    assessment.locked_due_to_failures = true;
                    assessment.seconds_until_unlock =
                        Some((unlock_at - now).num_seconds().max(0));
                }
            } else {
                assessment.locked_due_to_failures = true;
            }
        }
    }

    // Idle lockout, judged from the most recent sign of activity.
    if policy.idle_lockout_interval_secs > 0 {
        let last_activity = parse_time(entry, ATTR_LAST_LOGIN_TIME).or(changed_time);
        if let Some(last_activity) = last_activity {
            let locked_at =
                last_activity + chrono::Duration::seconds(policy.idle_lockout_interval_secs as i64);
            assessment.locked_due_to_idle_interval = locked_at <= now;
        }
    }

    // Reset-age lockout: an administrative reset the user never followed up.
    if policy.max_password_reset_age_secs > 0 && reset_flag {
        if let Some(changed) = changed_time {
            let deadline =
                changed + chrono::Duration::seconds(policy.max_password_reset_age_secs as i64);
            assessment.locked_due_to_maximum_reset_age = deadline <= now;
        }
    }

    // Expiration and warning.
    if policy.max_password_age_secs > 0 {
        if let Some(changed) = changed_time {
            let expires = changed + chrono::Duration::seconds(policy.max_password_age_secs as i64);
            let remaining = (expires - now).num_seconds();
            assessment.seconds_until_expiration = Some(remaining);
            let warned_time = parse_time(entry, ATTR_WARNED_TIME);
            if remaining <= 0 {
                if policy.expire_passwords_without_warning || warned_time.is_some() {
                    assessment.is_password_expired = true;
                } else {
                    // The password cannot expire before the first warning
                    // has been delivered.
                    assessment.should_warn = true;
                    assessment.is_first_warning = true;
                }
            } else if policy.warning_interval_secs > 0
                && remaining <= policy.warning_interval_secs as i64
            {
                assessment.should_warn = true;
                assessment.is_first_warning = warned_time.is_none();
            }
        }
    }

    // Grace logins.
    assessment.grace_logins_used = entry
        .get_attribute(ATTR_PASSWORD_GRACE_USE_TIME)
        .iter()
        .map(|a| a.values().len() as u32)
        .sum();
    assessment.may_use_grace_login = policy.grace_login_count > 0
        && assessment.grace_logins_used < policy.grace_login_count;

    assessment.must_change_password = policy.force_change_on_reset && reset_flag;

    assessment
}

/// Mutable policy state for one account over the lifetime of one operation.
///
/// Every mutator stages a modification instead of touching the entry; the
/// executor merges the staged list into the committed entry so state updates
/// ride the same backend write as the triggering operation.
pub struct PasswordPolicyState<'a> {
    policy: &'a PasswordPolicy,
    now: DateTime<Utc>,
    entry_dn: Dn,
    assessment: PolicyAssessment,
    stored_passwords: Vec<String>,
    history: Vec<String>,
    failure_times: Vec<DateTime<Utc>>,
    pending: Vec<Modification>,
}

impl<'a> PasswordPolicyState<'a> {
    pub fn new(entry: &Entry, policy: &'a PasswordPolicy, now: DateTime<Utc>) -> Self {
        let mut failure_times = parse_times(entry, ATTR_PASSWORD_FAILURE_TIME);
        if policy.lockout_failure_expiration_secs > 0 {
            let horizon =
                now - chrono::Duration::seconds(policy.lockout_failure_expiration_secs as i64);
            failure_times.retain(|t| *t > horizon);
        }
        Self {
            policy,
            now,
            entry_dn: entry.dn().clone(),
            assessment: evaluate(entry, policy, now),
            stored_passwords: entry
                .get_attribute(&policy.password_attribute)
                .iter()
                .flat_map(|a| a.values())
                .map(|v| v.raw().to_string())
                .collect(),
            history: entry
                .get_attribute(ATTR_PASSWORD_HISTORY)
                .iter()
                .flat_map(|a| a.values())
                .map(|v| v.raw().to_string())
                .collect(),
            failure_times,
            pending: Vec::new(),
        }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        self.policy
    }

    pub fn assessment(&self) -> &PolicyAssessment {
        &self.assessment
    }

    pub fn entry_dn(&self) -> &Dn {
        &self.entry_dn
    }

    pub fn has_stored_password(&self) -> bool {
        !self.stored_passwords.is_empty()
    }

    pub fn stored_passwords(&self) -> &[String] {
        &self.stored_passwords
    }

    /// Whether a cleartext credential matches any stored password value.
    pub fn password_matches(&self, clear: &str) -> bool {
        scheme::password_matches(&self.policy.storage_schemes, clear, &self.stored_passwords)
    }

    /// Grace logins left after the current one is consumed.
    pub fn grace_logins_remaining(&self) -> u32 {
        self.policy
            .grace_login_count
            .saturating_sub(self.assessment.grace_logins_used)
    }

    /// Whether the password was changed too recently for another user change.
    pub fn is_within_minimum_age(&self) -> bool {
        if self.policy.min_password_age_secs == 0 || self.assessment.must_change_password {
            return false;
        }
        self.assessment
            .seconds_until_expiration
            .map(|remaining| {
                let age = self.policy.max_password_age_secs as i64 - remaining;
                age >= 0 && age < self.policy.min_password_age_secs as i64
            })
            .unwrap_or(false)
    }

    /// Runs every configured validator against a proposed password.
    pub fn validate_new_password(&self, clear: &str, entry: &Entry) -> Result<(), String> {
        for validator in &self.policy.validators {
            validator.validate(clear, entry)?;
        }
        Ok(())
    }

    /// Whether a proposed cleartext password matches a retained prior one.
    pub fn is_password_in_history(&self, clear: &str) -> bool {
        if self.policy.history_count == 0 {
            return false;
        }
        scheme::password_matches(&self.policy.storage_schemes, clear, &self.history)
            || self.password_matches(clear)
    }

    fn stage_replace(&mut self, attr_type: &str, values: Vec<AttributeValue>) {
        self.pending
            .push(Modification::internal_replace(Attribute::new(
                attr_type, values,
            )));
    }

    fn now_value(&self) -> AttributeValue {
        AttributeValue::new(format_generalized_time(self.now))
    }

    /// Records one more authentication failure. Returns true when this
    /// failure crosses the lockout threshold.
    pub fn update_auth_failure_times(&mut self) -> bool {
        if self.policy.lockout_failure_count == 0 {
            return false;
        }
        let was_locked = self.failure_times.len() as u32 >= self.policy.lockout_failure_count;
        self.failure_times.push(self.now);
        let values = self
            .failure_times
            .iter()
            .map(|t| AttributeValue::new(format_generalized_time(*t)))
            .collect();
        self.stage_replace(ATTR_PASSWORD_FAILURE_TIME, values);
        let now_locked = self.failure_times.len() as u32 >= self.policy.lockout_failure_count;
        if now_locked {
            self.assessment.locked_due_to_failures = true;
            if self.policy.lockout_duration_secs > 0 {
                self.assessment.seconds_until_unlock =
                    Some(self.policy.lockout_duration_secs as i64);
            }
        }
        self.assessment.failure_count = self.failure_times.len() as u32;
        !was_locked && now_locked
    }

    /// Clears recorded failures after a successful authentication.
    pub fn clear_failure_lockout(&mut self) {
        if !self.failure_times.is_empty() {
            self.failure_times.clear();
            self.stage_replace(ATTR_PASSWORD_FAILURE_TIME, Vec::new());
        }
        self.assessment.locked_due_to_failures = false;
        self.assessment.seconds_until_unlock = None;
        self.assessment.failure_count = 0;
    }

    /// Consumes one grace login.
    pub fn update_grace_login_times(&mut self) {
        self.pending.push(Modification {
            internal: true,
            ..Modification::add(Attribute::new(
                ATTR_PASSWORD_GRACE_USE_TIME,
                vec![self.now_value()],
            ))
        });
        self.assessment.grace_logins_used += 1;
        self.assessment.may_use_grace_login =
            self.assessment.grace_logins_used < self.policy.grace_login_count;
    }

    pub fn set_last_login_time(&mut self) {
        let value = self.now_value();
        self.stage_replace(ATTR_LAST_LOGIN_TIME, vec![value]);
    }

    /// Records that the expiration warning has been delivered.
    pub fn set_warned_time(&mut self) {
        let value = self.now_value();
        self.stage_replace(ATTR_WARNED_TIME, vec![value]);
        self.assessment.is_first_warning = false;
    }

    /// Marks the password changed now: stamps the change time and clears
    /// warning, grace-use and failure state left over from the old password.
    pub fn set_password_changed_time(&mut self) {
        let value = self.now_value();
        self.stage_replace(ATTR_PASSWORD_CHANGED_TIME, vec![value]);
        self.stage_replace(ATTR_WARNED_TIME, Vec::new());
        self.stage_replace(ATTR_PASSWORD_GRACE_USE_TIME, Vec::new());
        self.clear_failure_lockout();
    }

    /// Sets or clears the administrative-reset flag.
    pub fn set_must_change_password(&mut self, must_change: bool) {
        if must_change {
            self.stage_replace(ATTR_PASSWORD_RESET, vec![AttributeValue::new("TRUE")]);
        } else {
            self.stage_replace(ATTR_PASSWORD_RESET, Vec::new());
        }
        self.assessment.must_change_password = must_change && self.policy.force_change_on_reset;
    }

    /// Pushes the passwords being replaced into the history, trimmed to the
    /// configured depth.
    pub fn update_password_history(&mut self) {
        if self.policy.history_count == 0 {
            return;
        }
        let mut history = self.history.clone();
        history.extend(self.stored_passwords.iter().cloned());
        let excess = history.len().saturating_sub(self.policy.history_count as usize);
        if excess > 0 {
            history.drain(..excess);
        }
        self.history = history.clone();
        self.stage_replace(
            ATTR_PASSWORD_HISTORY,
            history.into_iter().map(AttributeValue::new).collect(),
        );
    }

    /// Replaces the tracked stored-password snapshot after an encode.
    pub fn set_stored_passwords(&mut self, values: Vec<String>) {
        self.stored_passwords = values;
    }

    pub fn pending_modifications(&self) -> &[Modification] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<Modification> {
        std::mem::take(&mut self.pending)
    }
}
