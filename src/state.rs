use std::sync::Arc;

use crate::accounts::services::AccountService;
use crate::config::{AppConfig, DbType};
use crate::storage::{JsonFileStore, RecordStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub accounts: Arc<AccountService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store = match config.db_type {
            DbType::File => Arc::new(JsonFileStore::open(&config.db_path).await),
            DbType::Memory => Arc::new(JsonFileStore::in_memory()),
        } as Arc<dyn RecordStore>;

        Ok(Self::from_parts(config, store))
    }

    pub fn from_parts(config: Arc<AppConfig>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            accounts: Arc::new(AccountService::new(store)),
        }
    }

    /// In-memory state for tests.
    #[cfg(test)]
    pub fn fake() -> Self {
        let config = Arc::new(AppConfig {
            environment: "test".into(),
            db_type: DbType::Memory,
            db_path: crate::config::DEFAULT_DB_PATH.into(),
            host: "127.0.0.1".into(),
            port: 0,
        });
        let store = Arc::new(JsonFileStore::in_memory()) as Arc<dyn RecordStore>;
        Self::from_parts(config, store)
    }
}
