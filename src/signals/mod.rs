//! Level signals evaluated per symbol: the Friday Asian-session midline and
//! the all-time 50% retracement, plus the touch check shared by both.

pub mod extremum;
pub mod session;
pub mod touch;

pub use extremum::fib50;
pub use session::{extract_session, most_recent_friday, session_bounds};
pub use touch::{candles_after, evaluate_touch, touches};
