//! Environment-driven configuration — §6.
//!
//! Mirrors `src/core/conf/settings.py`'s shape: a handful of narrow
//! settings groups (app, database, broker, api) loaded from the process
//! environment (via `dotenvy` for local `.env` files), each either taking
//! an assembled URL directly or building one from component parts.

use std::env;

use anyhow::Result;

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

pub struct AppConfig {
    pub environment: String,
    pub debug: bool,
    pub log_level: String,
    /// Read and carried in the process environment for auth middleware
    /// that isn't part of this repo; nothing here reads it back out.
    pub jwt_secret: Option<String>,
}

impl AppConfig {
    fn from_env() -> Self {
        Self {
            environment: var("ENVIRONMENT").unwrap_or_else(|| "dev".to_string()),
            debug: var("DEBUG").map(|v| v == "true" || v == "1").unwrap_or(true),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            jwt_secret: var("JWT_SECRET"),
        }
    }
}

pub struct DbConfig {
    pub database_url: String,
}

impl DbConfig {
    fn from_env() -> Result<Self> {
        let database_url = match var("DATABASE_URL") {
            Some(url) => url,
            None => {
                let user = var("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string());
                let password = var("POSTGRES_PASSWORD").unwrap_or_else(|| "postgres".to_string());
                let host = var("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string());
                let port = var("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
                let db = var("POSTGRES_DB").unwrap_or_else(|| "postgres".to_string());
                format!("postgres://{user}:{password}@{host}:{port}/{db}")
            }
        };
        Ok(Self { database_url })
    }
}

pub struct BrokerConfig {
    pub amqp_url: String,
}

impl BrokerConfig {
    fn from_env() -> Result<Self> {
        let amqp_url = match var("AMQP_URL") {
            Some(url) => url,
            None => {
                let user = var("AMQP_USER").unwrap_or_else(|| "guest".to_string());
                let password = var("AMQP_PASSWORD").unwrap_or_else(|| "guest".to_string());
                let host = var("AMQP_HOST").unwrap_or_else(|| "localhost".to_string());
                let port = var("AMQP_PORT").unwrap_or_else(|| "5672".to_string());
                format!("amqp://{user}:{password}@{host}:{port}/%2f")
            }
        };
        Ok(Self { amqp_url })
    }
}

pub struct ApiConfig {
    pub bind_addr: String,
}

impl ApiConfig {
    fn from_env() -> Self {
        Self { bind_addr: var("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()) }
    }
}

pub struct Settings {
    pub app: AppConfig,
    pub database: DbConfig,
    pub broker: BrokerConfig,
    pub api: ApiConfig,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self {
            app: AppConfig::from_env(),
            database: DbConfig::from_env()?,
            broker: BrokerConfig::from_env()?,
            api: ApiConfig::from_env(),
        })
    }
}
