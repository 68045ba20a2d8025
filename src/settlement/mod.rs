pub mod matcher;
pub mod scheduler;

pub use matcher::SettlementMatcher;
pub use scheduler::SettlementScheduler;
