//! Database configuration.

/// Connection settings for the task store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite connection URL, e.g. `sqlite://shepherd.db`.
    pub database_url: String,
}

impl DbConfig {
    /// Default on-disk database next to the working directory.
    pub const DEFAULT_URL: &'static str = "sqlite://shepherd.db";

    /// In-memory database used by tests.
    pub const MEMORY_URL: &'static str = "sqlite::memory:";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Read the URL from `SHEPHERD_DATABASE_URL`, falling back to the default.
    pub fn from_env() -> Self {
        let url = std::env::var("SHEPHERD_DATABASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_URL.to_string());
        Self::new(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stores_url() {
        let cfg = DbConfig::new("sqlite:///tmp/x.db");
        assert_eq!(cfg.database_url, "sqlite:///tmp/x.db");
    }
}
