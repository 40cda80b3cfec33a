use crate::attribute::{Attribute, AttributeValue};
use crate::controls::Control;
use crate::dn::{Dn, Rdn};
use crate::entry::Entry;
use crate::error::{DirectoryError, ResultCode};
use crate::modify::Modification;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Evaluates an already-parsed search filter against one entry. Filter
/// evaluation itself lives in the search engine; the execution core only
/// needs the yes/no answer for assertion and matched-values processing.
pub trait EntryMatcher: Send + Sync {
    fn matches(&self, entry: &Entry) -> Result<bool, DirectoryError>;
}

/// Privileges a client connection may hold, checked by controls and
/// password administration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    ProxiedAuth,
    PasswordReset,
    PrivilegeChange,
}

/// The slice of client-connection state the execution core consults.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub secure: bool,
    pub is_root: bool,
    pub must_change_password: bool,
    pub privileges: BTreeSet<Privilege>,
}

impl ClientState {
    pub fn has_privilege(&self, privilege: Privilege) -> bool {
        self.is_root || self.privileges.contains(&privilege)
    }
}

/// Session resource limits configured from entry-level overrides at bind
/// time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub size_limit: Option<i64>,
    pub time_limit: Option<i64>,
    pub idle_time_limit_ms: Option<i64>,
    pub lookthrough_limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry_dn: Dn,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub entry_dn: Dn,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub entry_dn: Dn,
    pub modifications: Vec<Modification>,
}

#[derive(Debug, Clone)]
pub struct ModifyDnRequest {
    pub entry_dn: Dn,
    pub new_rdn: Rdn,
    pub delete_old_rdn: bool,
    pub new_superior: Option<Dn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

#[derive(Clone)]
pub struct SearchRequest {
    pub base_dn: Dn,
    pub scope: SearchScope,
    pub filter: Arc<dyn EntryMatcher>,
    pub requested_attributes: Vec<String>,
    pub types_only: bool,
    pub size_limit: u32,
    pub time_limit_secs: u32,
}

impl std::fmt::Debug for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchRequest")
            .field("base_dn", &self.base_dn)
            .field("scope", &self.scope)
            .field("requested_attributes", &self.requested_attributes)
            .field("types_only", &self.types_only)
            .field("size_limit", &self.size_limit)
            .field("time_limit_secs", &self.time_limit_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum BindCredentials {
    Simple { password: String },
    Sasl { mechanism: String, credentials: Option<Vec<u8>> },
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub bind_dn: Dn,
    pub credentials: BindCredentials,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry_dn: Dn,
    pub attribute: String,
    pub options: BTreeSet<String>,
    pub value: AttributeValue,
}

#[derive(Debug, Clone)]
pub enum OperationKind {
    Add(AddRequest),
    Delete(DeleteRequest),
    Modify(ModifyRequest),
    ModifyDn(ModifyDnRequest),
    Search(SearchRequest),
    Bind(BindRequest),
    Compare(CompareRequest),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Add(_) => "add",
            OperationKind::Delete(_) => "delete",
            OperationKind::Modify(_) => "modify",
            OperationKind::ModifyDn(_) => "modify_dn",
            OperationKind::Search(_) => "search",
            OperationKind::Bind(_) => "bind",
            OperationKind::Compare(_) => "compare",
        }
    }
}

/// Authenticates a SASL bind. Mechanism handlers are registered with the
/// core context by mechanism name; the handler resolves the authenticated
/// identity or fails the bind.
pub trait SaslMechanismHandler: Send + Sync {
    fn authenticate(
        &self,
        operation: &mut Operation,
        credentials: Option<&[u8]>,
    ) -> Result<Dn, DirectoryError>;

    /// Whether the mechanism proves possession of the account password.
    /// Password-based mechanisms get the full password-policy treatment.
    fn is_password_based(&self) -> bool {
        false
    }
}

/// Cooperative cancellation signal shared between the protocol layer and the
/// executor. Polled at defined checkpoints; once commit begins, cancellation
/// becomes advisory only.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// One in-flight client operation. Created by the protocol layer per
/// request, mutated exclusively by the executor and its hooks, consumed by
/// the response encoder.
#[derive(Debug)]
pub struct Operation {
    pub kind: OperationKind,
    pub client: ClientState,
    request_controls: Vec<Control>,
    response_controls: Vec<Control>,
    result_code: Option<ResultCode>,
    error_message: Vec<String>,
    matched_dn: Option<Dn>,
    referral_urls: Vec<String>,
    cancel: CancelHandle,
    cancel_result: Option<ResultCode>,
    is_internal: bool,
    is_synchronization: bool,
    authorization_dn: Dn,
    proxied_authorization_dn: Option<Dn>,
    /// Resolved on successful bind; the session layer picks these up.
    pub resource_limits: Option<ResourceLimits>,
    /// DN of the entry that authenticated, set by Bind.
    pub authenticated_dn: Option<Dn>,
    /// Set by Bind when the account must change its password before doing
    /// anything else; the session layer copies it into the connection state.
    pub must_change_password_after_bind: bool,
    /// Entries matched by a Search, in backend order. The protocol layer
    /// streams these to the client.
    pub search_result_entries: Vec<Entry>,
    /// Set when a hook demands the connection be torn down.
    pub connection_terminated: bool,
}

impl Operation {
    pub fn new(kind: OperationKind, authorization_dn: Dn) -> Self {
        Self {
            kind,
            client: ClientState::default(),
            request_controls: Vec::new(),
            response_controls: Vec::new(),
            result_code: None,
            error_message: Vec::new(),
            matched_dn: None,
            referral_urls: Vec::new(),
            cancel: CancelHandle::default(),
            cancel_result: None,
            is_internal: false,
            is_synchronization: false,
            authorization_dn,
            proxied_authorization_dn: None,
            resource_limits: None,
            authenticated_dn: None,
            must_change_password_after_bind: false,
            search_result_entries: Vec::new(),
            connection_terminated: false,
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.request_controls = controls;
        self
    }

    pub fn with_client(mut self, client: ClientState) -> Self {
        self.client = client;
        self
    }

    /// Marks the operation internal: validation strictness is relaxed the
    /// way server-initiated operations require.
    pub fn mark_internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    /// Marks the operation as originating from a synchronization provider.
    pub fn mark_synchronization(mut self) -> Self {
        self.is_synchronization = true;
        self
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn is_synchronization(&self) -> bool {
        self.is_synchronization
    }

    /// The effective authorization identity: the proxied identity when a
    /// proxied-authorization control was accepted, the bound identity
    /// otherwise.
    pub fn authorization_dn(&self) -> &Dn {
        self.proxied_authorization_dn
            .as_ref()
            .unwrap_or(&self.authorization_dn)
    }

    pub fn set_proxied_authorization_dn(&mut self, dn: Dn) {
        self.proxied_authorization_dn = Some(dn);
    }

    pub fn request_controls(&self) -> &[Control] {
        &self.request_controls
    }

    pub fn request_controls_mut(&mut self) -> &mut Vec<Control> {
        &mut self.request_controls
    }

    pub fn add_response_control(&mut self, control: Control) {
        self.response_controls.push(control);
    }

    pub fn response_controls(&self) -> &[Control] {
        &self.response_controls
    }

    /// The final result code; `Success` is the unset sentinel.
    pub fn result_code(&self) -> ResultCode {
        self.result_code.unwrap_or(ResultCode::Success)
    }

    pub fn has_result(&self) -> bool {
        self.result_code.is_some()
    }

    pub fn set_result_code(&mut self, code: ResultCode) {
        self.result_code = Some(code);
    }

    pub fn append_error_message(&mut self, message: impl Into<String>) {
        self.error_message.push(message.into());
    }

    pub fn error_message(&self) -> String {
        self.error_message.join("; ")
    }

    pub fn matched_dn(&self) -> Option<&Dn> {
        self.matched_dn.as_ref()
    }

    pub fn set_matched_dn(&mut self, dn: Option<Dn>) {
        self.matched_dn = dn;
    }

    pub fn referral_urls(&self) -> &[String] {
        &self.referral_urls
    }

    pub fn set_referral_urls(&mut self, urls: Vec<String>) {
        self.referral_urls = urls;
    }

    /// Applies a structured failure to the operation's response fields.
    pub fn set_response_data(&mut self, error: &DirectoryError) {
        self.set_result_code(error.result_code);
        self.append_error_message(error.message.clone());
        if error.matched_dn.is_some() {
            self.matched_dn = error.matched_dn.clone();
        }
        if !error.referral_urls.is_empty() {
            self.referral_urls = error.referral_urls.clone();
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    pub fn set_cancel_result(&mut self, code: ResultCode) {
        self.cancel_result = Some(code);
    }

    pub fn cancel_result(&self) -> Option<ResultCode> {
        self.cancel_result
    }

    /// The DN this operation targets (the base DN for Search, the bind DN
    /// for Bind).
    pub fn target_dn(&self) -> &Dn {
        match &self.kind {
            OperationKind::Add(r) => &r.entry_dn,
            OperationKind::Delete(r) => &r.entry_dn,
            OperationKind::Modify(r) => &r.entry_dn,
            OperationKind::ModifyDn(r) => &r.entry_dn,
            OperationKind::Search(r) => &r.base_dn,
            OperationKind::Bind(r) => &r.bind_dn,
            OperationKind::Compare(r) => &r.entry_dn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientState, Operation, OperationKind, DeleteRequest, Privilege};
    use crate::dn::Dn;
    use crate::error::{DirectoryError, ResultCode};

    fn op() -> Operation {
        Operation::new(
            OperationKind::Delete(DeleteRequest {
                entry_dn: Dn::parse("cn=x,o=example").unwrap(),
            }),
            Dn::null(),
        )
    }

    #[test]
    fn unset_result_reads_as_success() {
        let op = op();
        assert!(!op.has_result());
        assert_eq!(op.result_code(), ResultCode::Success);
    }

    #[test]
    fn response_data_transfers_all_fields() {
        let mut op = op();
        let err = DirectoryError::new(ResultCode::NoSuchObject, "gone")
            .with_matched_dn(Some(Dn::parse("o=example").unwrap()))
            .with_referrals(vec!["ldap://other/".to_string()]);
        op.set_response_data(&err);
        assert_eq!(op.result_code(), ResultCode::NoSuchObject);
        assert_eq!(op.error_message(), "gone");
        assert_eq!(op.matched_dn().unwrap().raw(), "o=example");
        assert_eq!(op.referral_urls().len(), 1);
    }

    #[test]
    fn error_messages_compose() {
        let mut op = op();
        op.append_error_message("first");
        op.append_error_message("second");
        assert_eq!(op.error_message(), "first; second");
    }

    #[test]
    fn cancellation_is_shared() {
        let op = op();
        let handle = op.cancel_handle();
        assert!(!op.is_cancel_requested());
        handle.request();
        assert!(op.is_cancel_requested());
    }

    #[test]
    fn root_implies_privileges() {
        let client = ClientState {
            is_root: true,
            ..ClientState::default()
        };
        assert!(client.has_privilege(Privilege::ProxiedAuth));
    }
}
