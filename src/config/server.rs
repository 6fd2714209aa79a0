// src/config/server.rs
// Server, database, and infrastructure configuration

use serde::{Deserialize, Serialize};

use super::helpers::{env_parsed_or, require_env, require_env_parsed};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: require_env("PULSECHAT_HOST"),
            port: require_env_parsed("PULSECHAT_PORT"),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_seconds: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: require_env("DATABASE_URL"),
            max_connections: env_parsed_or("PULSECHAT_SQLITE_MAX_CONNECTIONS", 10),
            timeout_seconds: env_parsed_or("DATABASE_TIMEOUT_SECONDS", 5),
        }
    }
}

/// Distributed store (rate-limit counters, typing dedup, EventBus pub/sub)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            url: require_env("REDIS_URL"),
            connect_timeout_ms: env_parsed_or("PULSECHAT_REDIS_CONNECT_TIMEOUT_MS", 2_000),
            op_timeout_ms: env_parsed_or("PULSECHAT_REDIS_OP_TIMEOUT_MS", 5_000),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub trace_sql: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            level: require_env("PULSECHAT_LOG_LEVEL"),
            trace_sql: env_parsed_or("PULSECHAT_TRACE_SQL", false),
        }
    }
}
