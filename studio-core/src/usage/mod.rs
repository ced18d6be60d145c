pub mod clock;
pub mod ledger;
pub mod models;

pub use clock::{Clock, FixedClock, SystemClock};
pub use ledger::{
    read_history, write_history, UsageError, UsageHistory, UsageLedger, UsageOutcome, UsageReport,
    UsageResult, HISTORY_DAYS,
};
pub use models::{mentions_quota, UsageRecord, UsageStatus};
