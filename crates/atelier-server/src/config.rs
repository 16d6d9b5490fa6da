use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Optional (username, password) for an admin account created at startup
    pub bootstrap_admin: Option<(String, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("ATELIER_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid ATELIER_PORT '{}'", raw))?,
            None => 3000,
        };

        let bootstrap_admin = match (
            lookup("ATELIER_ADMIN_USERNAME"),
            lookup("ATELIER_ADMIN_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };

        Ok(Self {
            host: lookup("ATELIER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: PathBuf::from(lookup("ATELIER_DB_PATH").unwrap_or_else(|| "atelier.db".into())),
            jwt_secret: lookup("ATELIER_JWT_SECRET").unwrap_or_else(|| "dev-secret-change-me".into()),
            bootstrap_admin,
        })
    }

    pub fn server_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}
