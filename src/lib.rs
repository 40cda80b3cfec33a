//! The operation execution core of an LDAP directory server.
//!
//! This crate sits between a protocol front end and a storage backend. The
//! front end decodes requests into [`operation::Operation`] values; the
//! executors in [`executor`] run each operation through its full pipeline
//! (entry locking, request controls, schema and password-policy
//! enforcement, plugin and synchronization hooks) and commit through the
//! [`backend::Backend`] seam. Access control, the schema engine, plugins
//! and replication providers all plug in behind traits; the crate owns the
//! pipeline ordering and the result-code semantics, not the storage or the
//! wire.
//!
//! ```no_run
//! use dircore::backend::BackendRef;
//! use dircore::config::CoreConfig;
//! use dircore::context::CoreContext;
//! use dircore::dn::Dn;
//! use dircore::executor;
//! use dircore::operation::{DeleteRequest, Operation, OperationKind};
//!
//! fn delete(ctx: &CoreContext, dn: &str) -> dircore::error::ResultCode {
//!     let mut op = Operation::new(
//!         OperationKind::Delete(DeleteRequest {
//!             entry_dn: Dn::parse(dn).unwrap(),
//!         }),
//!         Dn::null(),
//!     );
//!     executor::execute(ctx, &mut op);
//!     op.result_code()
//! }
//! # fn wire(backend: BackendRef) -> CoreContext {
//! #     CoreContext::new(backend, CoreConfig::default())
//! # }
//! ```

pub mod attribute;
pub mod backend;
pub mod config;
pub mod context;
pub mod controls;
pub mod dn;
pub mod entry;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod lock;
pub mod modify;
pub mod operation;
pub mod pwpolicy;
pub mod schema;

pub use backend::{Backend, BackendRef};
pub use config::CoreConfig;
pub use context::CoreContext;
pub use dn::Dn;
pub use entry::Entry;
pub use error::{DirectoryError, ResultCode};
pub use operation::{Operation, OperationKind};
