pub mod metric;
pub mod session;

pub use metric::MetricRecord;
pub use session::{Session, SessionStatus, SessionSummary, TrendPoint};
