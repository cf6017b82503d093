/// Configuration management for the Routeway engine
///
/// Handles server configuration, database connection and runtime parameters.

use crate::runtime::DEFAULT_MAX_LOOPS;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Engine configuration
    pub runtime: RuntimeConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite storage for models, instances and chains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (default: "sqlite://data/routeway.db?mode=rwc")
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Six-field cron expression for escalation runs
    pub escalation_schedule: String,
    /// Queue iterations allowed per pass before a loop is reported
    pub max_loops: usize,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("ROUTEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("ROUTEWAY_PORT")
                    .unwrap_or_else(|_| "3004".to_string())
                    .parse()
                    .unwrap_or(3004),
            },
            database: DatabaseConfig {
                url: std::env::var("ROUTEWAY_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/routeway.db?mode=rwc".to_string()),
            },
            runtime: RuntimeConfig {
                escalation_schedule: std::env::var("ROUTEWAY_ESCALATION_SCHEDULE")
                    .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
                max_loops: std::env::var("ROUTEWAY_MAX_LOOPS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_LOOPS),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let config = Config::default();
        assert!(config.runtime.max_loops > 0);
        assert_eq!(config.runtime.escalation_schedule.split_whitespace().count(), 6);

        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.database.url, config.database.url);
    }
}
