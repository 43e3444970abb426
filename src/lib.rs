// ABOUTME: Library root for mirror-check
// ABOUTME: Audits a primary data directory against its streaming-replication mirror

pub mod audit;
pub mod catalog;
pub mod compare;
pub mod error;
pub mod mask;
pub mod page;
pub mod reltype;
pub mod report;
pub mod sync;

pub use audit::{AuditConfig, ReplicaAuditor};
pub use catalog::{CatalogSource, JsonCatalog};
pub use error::AuditError;
pub use report::{AuditOutcome, AuditWarning, WarningKind};
pub use reltype::CategorySelection;
pub use sync::{CancelToken, CommandControl, ReplicationControl};
