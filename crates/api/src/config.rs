//! API server configuration

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub database_max_connections: u32,
    /// Comma separated list of origins allowed by CORS
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let database_max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("DATABASE_MAX_CONNECTIONS must be a number"))?,
            Err(_) => 10,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_max_connections,
            allowed_origins,
        })
    }

    /// Configuration for router tests, never touches the environment
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/freelancedesk_test".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            database_max_connections: 1,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "DATABASE_URL",
            "BIND_ADDRESS",
            "DATABASE_MAX_CONNECTIONS",
            "ALLOWED_ORIGINS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://db/app");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.allowed_origins.len(), 2);
        clear();
    }

    #[test]
    #[serial]
    fn test_database_url_required() {
        clear();
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_bad_max_connections() {
        clear();
        env::set_var("DATABASE_URL", "postgres://db/app");
        env::set_var("DATABASE_MAX_CONNECTIONS", "many");
        assert!(Config::from_env().is_err());
        clear();
    }

    #[test]
    #[serial]
    fn test_allowed_origins_trimmed() {
        clear();
        env::set_var("DATABASE_URL", "postgres://db/app");
        env::set_var("ALLOWED_ORIGINS", " https://a.test , ,https://b.test");

        let config = Config::from_env().unwrap();
        assert_eq!(config.allowed_origins, vec!["https://a.test", "https://b.test"]);
        clear();
    }
}
