//! Weather session facade.
//!
//! The entry point for callers that have a fetched observation to record or
//! an icon to show. It owns no persisted state: it combines the history
//! store, the preference store and the icon cache, all of which are
//! constructed once by the application and shared here.

use std::future::Future;
use std::sync::Arc;

use nimbus_core::StoreError;
use nimbus_store::{HistoryStore, PreferenceStore, WeatherObservation};

use crate::cache::IconCache;

/// Result of [`WeatherSession::record_observation`].
///
/// Both steps are always attempted; each reports independently.
#[derive(Debug)]
pub struct RecordOutcome {
    pub history: Result<(), StoreError>,
    pub last_city: Result<(), StoreError>,
}

impl RecordOutcome {
    pub fn is_complete(&self) -> bool {
        self.history.is_ok() && self.last_city.is_ok()
    }

    /// Collapse into the first failure, history first.
    pub fn into_result(self) -> Result<(), StoreError> {
        self.history.and(self.last_city)
    }
}

/// Orchestrates history writes, last-search tracking and icon resolution.
#[derive(Clone)]
pub struct WeatherSession {
    history: Arc<HistoryStore>,
    preferences: Arc<PreferenceStore>,
    icons: Arc<IconCache>,
}

impl WeatherSession {
    pub fn new(
        history: Arc<HistoryStore>,
        preferences: Arc<PreferenceStore>,
        icons: Arc<IconCache>,
    ) -> Self {
        Self {
            history,
            preferences,
            icons,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    pub fn icons(&self) -> &Arc<IconCache> {
        &self.icons
    }

    /// Persist a successfully fetched observation and remember its city as
    /// the last search.
    ///
    /// There is no cross-store transaction: a failed history insert does not
    /// prevent the preference update and vice versa.
    pub async fn record_observation(&self, observation: &WeatherObservation) -> RecordOutcome {
        let history = {
            let store = Arc::clone(&self.history);
            let observation = observation.clone();
            tokio::task::spawn_blocking(move || store.insert(&observation))
                .await
                .unwrap_or_else(|e| Err(StoreError::persistence(e.to_string())))
        };
        if let Err(e) = &history {
            tracing::error!("Failed to save observation for {}: {}", observation.city, e);
        }

        let last_city = {
            let store = Arc::clone(&self.preferences);
            let city = observation.city.clone();
            tokio::task::spawn_blocking(move || store.set_last_searched_city(Some(&city)))
                .await
                .unwrap_or_else(|e| Err(StoreError::persistence(e.to_string())))
        };
        if let Err(e) = &last_city {
            tracing::error!("Failed to save last searched city: {}", e);
        }

        RecordOutcome { history, last_city }
    }

    /// Return the icon for `key`, from cache if fresh, otherwise via `fetch`.
    ///
    /// `fetch` runs with no cache lock held. A fetched icon is cached before
    /// it is returned; a fetch failure is returned unchanged and nothing is
    /// cached.
    pub async fn resolve_icon<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        let cached = {
            let cache = Arc::clone(&self.icons);
            let key = key.to_string();
            tokio::task::spawn_blocking(move || cache.load(&key))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Icon cache lookup task failed: {}", e);
                    None
                })
        };
        if let Some(bytes) = cached {
            tracing::debug!("Icon {} served from cache", key);
            return Ok(bytes);
        }

        let bytes = fetch(key.to_string()).await?;

        let cache = Arc::clone(&self.icons);
        let (key, blob) = (key.to_string(), bytes.clone());
        if let Err(e) = tokio::task::spawn_blocking(move || cache.save(&key, &blob)).await {
            tracing::warn!("Icon cache save task failed: {}", e);
        }
        Ok(bytes)
    }

    /// City to re-run on start-up, if any.
    pub fn last_search(&self) -> Result<Option<String>, StoreError> {
        self.preferences.last_searched_city()
    }

    // -- Settings commands --

    /// Delete all history. Returns the number of observations removed.
    pub fn clear_history(&self) -> Result<usize, StoreError> {
        self.history.delete_all()
    }

    pub fn clear_favorites(&self) -> Result<(), StoreError> {
        self.preferences.clear_favorites()
    }

    pub fn clear_icon_cache(&self) -> usize {
        self.icons.clear()
    }

    pub fn sweep_icon_cache(&self) -> usize {
        let evicted = self.icons.sweep_expired();
        tracing::info!("Icon cache sweep evicted {} entries", evicted);
        evicted
    }

    pub fn icon_cache_size(&self) -> u64 {
        self.icons.total_size()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use crate::types::FetchError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn session() -> (WeatherSession, TempDir) {
        let dir = tempdir().unwrap();
        let session = WeatherSession::new(
            Arc::new(HistoryStore::in_memory().unwrap()),
            Arc::new(PreferenceStore::in_memory().unwrap()),
            Arc::new(IconCache::new(dir.path().join("WeatherIcons"), DEFAULT_TTL)),
        );
        (session, dir)
    }

    #[tokio::test]
    async fn test_record_observation_updates_both_stores() {
        let (session, _dir) = session();
        let obs = WeatherObservation::new("Paris", 18.0, 17.5, "Clear sky", "01d", 55);

        let outcome = session.record_observation(&obs).await;
        assert!(outcome.is_complete());

        assert_eq!(session.history().fetch_recent().unwrap(), vec![obs]);
        assert_eq!(session.last_search().unwrap().as_deref(), Some("Paris"));
    }

    #[tokio::test]
    async fn test_record_failure_still_updates_last_city() {
        let (session, _dir) = session();
        let obs = WeatherObservation::new("Tokyo", 22.0, 21.0, "Rainy", "10d", 80);
        session.history().insert(&obs).unwrap();

        let outcome = session.record_observation(&obs).await;
        assert!(matches!(outcome.history, Err(StoreError::DuplicateId(_))));
        assert!(outcome.last_city.is_ok());
        assert_eq!(session.last_search().unwrap().as_deref(), Some("Tokyo"));
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_resolve_icon_fetches_once_then_caches() {
        let (session, _dir) = session();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let bytes = session
                .resolve_icon("02d", |key| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(key, "02d");
                    Ok::<_, FetchError>(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(bytes, vec![1, 2, 3]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.icon_cache_size(), 3);
    }

    #[tokio::test]
    async fn test_resolve_icon_propagates_fetch_error() {
        let (session, _dir) = session();

        let err = session
            .resolve_icon("50n", |_| async { Err::<Vec<u8>, _>(FetchError::ServerStatus(502)) })
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::ServerStatus(502));
        assert!(session.icons().load("50n").is_none());
    }

    #[tokio::test]
    async fn test_settings_commands() {
        let (session, _dir) = session();
        for obs in WeatherObservation::samples() {
            session.record_observation(&obs).await.into_result().unwrap();
        }
        session.preferences().add_favorite("London").unwrap();
        session.icons().save("01d", b"sun");

        assert_eq!(session.clear_history().unwrap(), 4);
        session.clear_favorites().unwrap();
        assert_eq!(session.clear_icon_cache(), 1);

        assert_eq!(session.history().count().unwrap(), 0);
        assert!(session.preferences().favorites().unwrap().is_empty());
        assert_eq!(session.icon_cache_size(), 0);
    }
}
