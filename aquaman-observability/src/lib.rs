pub mod audit;
pub mod chain;

pub use audit::AuditLog;
pub use chain::{AuditRecord, ZERO_HASH};
