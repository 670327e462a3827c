use std::{fmt, path::PathBuf, str::FromStr};

pub const DEFAULT_DB_PATH: &str = "/tmp/users_db.json";

/// Where the user document lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    File,
    Memory,
}

impl FromStr for DbType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unsupported DB_TYPE {other:?} (expected \"file\" or \"memory\")"),
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub db_type: DbType,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let environment = var("APP_ENV")
            .or_else(|| var("NODE_ENV"))
            .unwrap_or_else(|| "development".into());
        let db_type = match var("DB_TYPE") {
            Some(v) => v.parse()?,
            None => DbType::File,
        };
        let db_path = var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let host = var("APP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match var("APP_PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("invalid APP_PORT {v:?}: {e}"))?,
            None => 8080,
        };
        Ok(Self {
            environment,
            db_type,
            db_path,
            host,
            port,
        })
    }
}
