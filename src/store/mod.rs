//! Persistence layer: libSQL-backed audit log, watermarks, action items,
//! digests and drafts.

pub mod export;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use export::ExportFormat;
pub use libsql_backend::LibSqlBackend;
pub use traits::{ActionItemFilter, AuditEvent, AuditFilter, AuditStore, AuditStream};
