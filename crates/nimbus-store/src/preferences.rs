//! Durable user preferences: favorite cities, temperature unit, last search.
//!
//! Values live in a small SQLite key/value table as JSON. Each setter is a
//! single transaction committed before it returns, and registered listeners
//! are called synchronously afterwards with the new value.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{RusqliteErrorExt, StoreError, TemperatureUnit};
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::history_store::DEFAULT_LOCK_TIMEOUT;

/// The fixed set of persisted preference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceKey {
    FavoriteCities,
    TemperatureUnit,
    LastSearchedCity,
}

impl PreferenceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FavoriteCities => "favoriteCities",
            Self::TemperatureUnit => "temperatureUnit",
            Self::LastSearchedCity => "lastSearchedCity",
        }
    }
}

/// A committed preference mutation, carrying the new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceChange {
    Favorites(Vec<String>),
    Unit(TemperatureUnit),
    LastSearchedCity(Option<String>),
}

impl PreferenceChange {
    pub fn key(&self) -> PreferenceKey {
        match self {
            Self::Favorites(_) => PreferenceKey::FavoriteCities,
            Self::Unit(_) => PreferenceKey::TemperatureUnit,
            Self::LastSearchedCity(_) => PreferenceKey::LastSearchedCity,
        }
    }
}

/// Callback invoked after each committed preference change.
pub type PreferenceListener = Arc<dyn Fn(&PreferenceChange) + Send + Sync>;

/// Handle returned by [`PreferenceStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Small persistent key/value store for user preferences.
pub struct PreferenceStore {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
    listeners: RwLock<Vec<(SubscriptionId, PreferenceListener)>>,
    next_subscription: AtomicU64,
    /// Held by a mutation from before it reads until its listeners return,
    /// so notifications are delivered in commit order. Reentrant so a
    /// listener may itself mutate the store.
    delivery: ReentrantMutex<()>,
}

impl PreferenceStore {
    /// Open or create the preference database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("{}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self::from_connection(conn)?;
        tracing::debug!("Opened preference store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory preference store (previews and tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::Open(format!("Failed to initialize schema: {}", e)))?;
        conn.busy_timeout(DEFAULT_LOCK_TIMEOUT)
            .map_err(|e| e.into_store_error())?;

        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        if let Err(e) = self.conn.get_mut().busy_timeout(timeout) {
            tracing::warn!("Failed to set preferences busy timeout: {}", e);
        }
        self
    }

    /// Serialize a mutation with every other mutation and its notifications.
    ///
    /// Taken before the connection lock, never after it.
    fn begin_mutation(
        &self,
        operation: &'static str,
    ) -> Result<ReentrantMutexGuard<'_, ()>, StoreError> {
        self.delivery.try_lock_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!("Preference store busy notifying during {}", operation);
            StoreError::timeout(operation, self.lock_timeout)
        })
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.try_lock_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!("Preference store lock timed out during {}", operation);
            StoreError::timeout(operation, self.lock_timeout)
        })
    }

    // -- Favorites --

    /// Favorite city names in the order they were added.
    pub fn favorites(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock("favorites")?;
        Ok(read_value(&conn, PreferenceKey::FavoriteCities)?.unwrap_or_default())
    }

    /// Append `city` unless it is already a favorite. Returns whether it was added.
    pub fn add_favorite(&self, city: &str) -> Result<bool, StoreError> {
        self.update_favorites("add_favorite", |favorites| {
            if favorites.iter().any(|c| c == city) {
                return false;
            }
            favorites.push(city.to_string());
            true
        })
    }

    /// Remove every occurrence of `city`. Returns whether anything was removed.
    pub fn remove_favorite(&self, city: &str) -> Result<bool, StoreError> {
        self.update_favorites("remove_favorite", |favorites| {
            let before = favorites.len();
            favorites.retain(|c| c != city);
            favorites.len() != before
        })
    }

    /// Add `city` if absent, otherwise remove it. Returns whether it is now a favorite.
    pub fn toggle_favorite(&self, city: &str) -> Result<bool, StoreError> {
        let mut now_favorite = false;
        self.update_favorites("toggle_favorite", |favorites| {
            let before = favorites.len();
            favorites.retain(|c| c != city);
            if favorites.len() == before {
                favorites.push(city.to_string());
                now_favorite = true;
            }
            true
        })?;
        Ok(now_favorite)
    }

    pub fn is_favorite(&self, city: &str) -> Result<bool, StoreError> {
        Ok(self.favorites()?.iter().any(|c| c == city))
    }

    pub fn clear_favorites(&self) -> Result<(), StoreError> {
        self.update_favorites("clear_favorites", |favorites| {
            let changed = !favorites.is_empty();
            favorites.clear();
            changed
        })?;
        Ok(())
    }

    /// Read-modify-write of the favorites list in one transaction.
    ///
    /// `f` returns whether it changed the list; unchanged lists are not
    /// written and do not notify.
    fn update_favorites<F>(&self, operation: &'static str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Vec<String>) -> bool,
    {
        let _delivery = self.begin_mutation(operation)?;
        let favorites = {
            let mut conn = self.lock(operation)?;
            let tx = conn.transaction().map_err(|e| e.into_store_error())?;
            let mut favorites: Vec<String> =
                read_value(&tx, PreferenceKey::FavoriteCities)?.unwrap_or_default();
            if !f(&mut favorites) {
                return Ok(false);
            }
            write_value(&tx, PreferenceKey::FavoriteCities, &favorites)?;
            tx.commit().map_err(|e| e.into_store_error())?;
            favorites
        };

        tracing::debug!("Favorites updated ({}): {} cities", operation, favorites.len());
        self.notify(&PreferenceChange::Favorites(favorites));
        Ok(true)
    }

    // -- Temperature unit --

    /// Display unit preference; Celsius until set.
    pub fn unit(&self) -> Result<TemperatureUnit, StoreError> {
        let conn = self.lock("unit")?;
        Ok(read_value(&conn, PreferenceKey::TemperatureUnit)?.unwrap_or_default())
    }

    pub fn set_unit(&self, unit: TemperatureUnit) -> Result<(), StoreError> {
        let _delivery = self.begin_mutation("set_unit")?;
        {
            let mut conn = self.lock("set_unit")?;
            let tx = conn.transaction().map_err(|e| e.into_store_error())?;
            let current: TemperatureUnit =
                read_value(&tx, PreferenceKey::TemperatureUnit)?.unwrap_or_default();
            let stored = has_value(&tx, PreferenceKey::TemperatureUnit)?;
            if stored && current == unit {
                return Ok(());
            }
            write_value(&tx, PreferenceKey::TemperatureUnit, &unit)?;
            tx.commit().map_err(|e| e.into_store_error())?;
        }

        tracing::info!("Temperature unit changed to: {}", unit.label());
        self.notify(&PreferenceChange::Unit(unit));
        Ok(())
    }

    // -- Last search --

    pub fn last_searched_city(&self) -> Result<Option<String>, StoreError> {
        let conn = self.lock("last_searched_city")?;
        read_value(&conn, PreferenceKey::LastSearchedCity)
    }

    /// Set or clear (`None`) the last searched city.
    pub fn set_last_searched_city(&self, city: Option<&str>) -> Result<(), StoreError> {
        let _delivery = self.begin_mutation("set_last_searched_city")?;
        {
            let mut conn = self.lock("set_last_searched_city")?;
            let tx = conn.transaction().map_err(|e| e.into_store_error())?;
            let current: Option<String> = read_value(&tx, PreferenceKey::LastSearchedCity)?;
            if current.as_deref() == city {
                return Ok(());
            }
            match city {
                Some(city) => write_value(&tx, PreferenceKey::LastSearchedCity, &city)?,
                None => delete_value(&tx, PreferenceKey::LastSearchedCity)?,
            }
            tx.commit().map_err(|e| e.into_store_error())?;
        }

        self.notify(&PreferenceChange::LastSearchedCity(city.map(str::to_string)));
        Ok(())
    }

    // -- Change notification --

    /// Register `listener` to be called after every committed change.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PreferenceChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let listener: PreferenceListener = Arc::new(listener);
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    /// Called with the mutation's delivery guard held and the connection
    /// lock released, so listeners may call back into the store.
    fn notify(&self, change: &PreferenceChange) {
        let listeners: Vec<PreferenceListener> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Read and decode a value. Undecodable values read as unset.
fn read_value<T: DeserializeOwned>(
    conn: &Connection,
    key: PreferenceKey,
) -> Result<Option<T>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.into_store_error())?;

    Ok(raw.and_then(|json| match serde_json::from_str(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable preference {}: {}", key.as_str(), e);
            None
        }
    }))
}

fn has_value(conn: &Connection, key: PreferenceKey) -> Result<bool, StoreError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM preferences WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| e.into_store_error())?;
    Ok(count > 0)
}

fn write_value<T: Serialize + ?Sized>(
    conn: &Connection,
    key: PreferenceKey,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)
        .map_err(|e| StoreError::persistence(format!("encode {}: {}", key.as_str(), e)))?;
    conn.execute(
        "INSERT INTO preferences (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key.as_str(), json],
    )
    .map_err(|e| e.into_store_error())?;
    Ok(())
}

fn delete_value(conn: &Connection, key: PreferenceKey) -> Result<(), StoreError> {
    conn.execute("DELETE FROM preferences WHERE key = ?1", params![key.as_str()])
        .map_err(|e| e.into_store_error())?;
    Ok(())
}
