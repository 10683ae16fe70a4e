pub mod audit;
pub mod journal;
pub mod rate_limit;

pub use audit::{ActionAuditor, AUDIT_TARGET};
pub use journal::{ActionJournal, JournalEntry};
pub use rate_limit::ActionRateLimiter;
