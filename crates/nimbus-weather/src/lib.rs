//! Weather session layer for Nimbus
//!
//! Provides the TTL icon cache and the session facade that records fetched
//! observations and resolves icons cache-first.

pub mod cache;
pub mod session;
pub mod types;

pub use cache::{Clock, IconCache, ManualClock, SystemClock, DEFAULT_TTL};
pub use session::{RecordOutcome, WeatherSession};
pub use types::*;
