//! Per-country change-feed version cursors.

use std::collections::HashMap;
use std::sync::Arc;

use giga_storage::{CountryStore, Store, StoreResult};
use tokio::sync::RwLock;

/// Cached view of `countries.latest_school_master_data_version`.
pub struct VersionCursorStore {
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<i64, i64>>,
}

impl VersionCursorStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cache first, then the persisted country row.
    pub async fn get_cursor(&self, country_id: i64) -> StoreResult<Option<i64>> {
        if let Some(version) = self.cache.read().await.get(&country_id) {
            return Ok(Some(*version));
        }
        let persisted = self
            .store
            .get_country(country_id)
            .await?
            .and_then(|c| c.latest_school_master_data_version);
        if let Some(version) = persisted {
            self.cache.write().await.insert(country_id, version);
        }
        Ok(persisted)
    }

    pub async fn set_cursor(&self, country_id: i64, version: i64) -> StoreResult<()> {
        self.store.set_school_master_version(country_id, version).await?;
        self.cache.write().await.insert(country_id, version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use giga_storage::{CountryStore, MemoryStore};

    use super::*;

    #[tokio::test]
    async fn cursors_persist_through_cache_loss() {
        let store = Arc::new(MemoryStore::new());
        let country = store.add_country("Brazil", "BR", "BRA").await;
        let cursors = VersionCursorStore::new(store.clone());

        assert_eq!(cursors.get_cursor(country.id).await.expect("read"), None);
        cursors.set_cursor(country.id, 12).await.expect("write");
        assert_eq!(cursors.get_cursor(country.id).await.expect("read"), Some(12));

        let persisted = store.get_country(country.id).await.expect("read").expect("country");
        assert_eq!(persisted.latest_school_master_data_version, Some(12));

        let fresh = VersionCursorStore::new(store.clone());
        assert_eq!(fresh.get_cursor(country.id).await.expect("read"), Some(12));
    }

    #[tokio::test]
    async fn cache_answers_without_the_store() {
        let store = Arc::new(MemoryStore::new());
        let country = store.add_country("Kenya", "KE", "KEN").await;
        let cursors = VersionCursorStore::new(store.clone());
        cursors.set_cursor(country.id, 3).await.expect("write");

        store.set_school_master_version(country.id, 7).await.expect("external write");
        assert_eq!(cursors.get_cursor(country.id).await.expect("read"), Some(3));

        let fresh = VersionCursorStore::new(store.clone());
        assert_eq!(fresh.get_cursor(country.id).await.expect("read"), Some(7));
    }
}
