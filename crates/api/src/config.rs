//! API server configuration

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Settings read once at startup
#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    /// When false the billing routes answer 503 and no processor client is built
    pub enable_billing: bool,
    /// Apply pending schema migrations before serving
    pub run_migrations: bool,
    pub allowed_origins: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("enable_billing", &self.enable_billing)
            .field("run_migrations", &self.run_migrations)
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = match optional("BIND_ADDRESS") {
            Some(addr) => addr,
            None => match optional("PORT") {
                Some(port) => {
                    let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
                        var: "PORT",
                        value: port.clone(),
                    })?;
                    format!("0.0.0.0:{}", port)
                }
                None => "0.0.0.0:3000".to_string(),
            },
        };

        let enable_billing = match optional("ENABLE_BILLING") {
            Some(raw) => parse_bool("ENABLE_BILLING", &raw)?,
            None => true,
        };

        let run_migrations = match optional("RUN_MIGRATIONS") {
            Some(raw) => parse_bool("RUN_MIGRATIONS", &raw)?,
            None => true,
        };

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            bind_address,
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            enable_billing,
            run_migrations,
            allowed_origins,
        })
    }
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
        }),
    }
}
