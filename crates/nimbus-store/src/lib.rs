//! Persistence for Nimbus: observation history and user preferences.

pub mod history_store;
pub mod observation;
pub mod preferences;

pub use history_store::{HistoryStore, DEFAULT_FETCH_LIMIT, DEFAULT_LOCK_TIMEOUT};
pub use observation::{IncompleteRecord, ObservationRecord, WeatherObservation};
pub use preferences::{
    PreferenceChange, PreferenceKey, PreferenceListener, PreferenceStore, SubscriptionId,
};
