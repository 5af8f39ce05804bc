//! Building the index from the remote mailbox

pub mod builder;
pub mod extract;
pub mod progress;
pub mod session;

pub use builder::{BuildOutcome, IndexBuilder, Throttle};
pub use extract::PlaintextExtractor;
pub use progress::{format_eta, percentage, ProgressEstimator};
pub use session::{IndexingSession, PageCursor};
