//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use chrono::FixedOffset;
use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Run without Postgres, backed by in-process stores
    pub skip_externals: bool,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment gateway protocol settings.
///
/// Injected into the URL builder and callback verifier at construction time.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Merchant (terminal) code assigned by the gateway
    pub tmn_code: String,
    /// Shared HMAC secret
    pub hash_secret: String,
    pub pay_url: String,
    pub return_url: String,
    pub version: String,
    pub command: String,
    pub locale: String,
    pub currency: String,
    pub order_type: String,
    /// Offset of the gateway's wall clock, e.g. `+07:00`
    pub clock_offset: FixedOffset,
    pub expire_minutes: i64,
    /// Storefront pages the browser return is redirected to
    pub success_redirect_url: String,
    pub failure_redirect_url: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("tmn_code", &self.tmn_code)
            .field("hash_secret", &"<redacted>")
            .field("pay_url", &self.pay_url)
            .field("return_url", &self.return_url)
            .field("version", &self.version)
            .field("command", &self.command)
            .field("locale", &self.locale)
            .field("currency", &self.currency)
            .field("order_type", &self.order_type)
            .field("clock_offset", &self.clock_offset)
            .field("expire_minutes", &self.expire_minutes)
            .field("success_redirect_url", &self.success_redirect_url)
            .field("failure_redirect_url", &self.failure_redirect_url)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let server = ServerConfig::from_env()?;
        let database = if server.skip_externals {
            DatabaseConfig::from_env().unwrap_or_default()
        } else {
            DatabaseConfig::from_env()?
        };

        Ok(AppConfig {
            server,
            database,
            logging: LoggingConfig::from_env()?,
            gateway: GatewayConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if !self.server.skip_externals {
            self.database.validate()?;
        }
        self.logging.validate()?;
        self.gateway.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
            skip_externals: env::var("SKIP_EXTERNALS")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            min_connections: 5,
            connection_timeout: 30,
            idle_timeout: None,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let clock_offset = env::var("GATEWAY_CLOCK_OFFSET").unwrap_or_else(|_| "+07:00".to_string());

        Ok(GatewayConfig {
            tmn_code: env::var("GATEWAY_TMN_CODE")
                .map_err(|_| ConfigError::MissingVariable("GATEWAY_TMN_CODE".to_string()))?,
            hash_secret: env::var("GATEWAY_HASH_SECRET")
                .map_err(|_| ConfigError::MissingVariable("GATEWAY_HASH_SECRET".to_string()))?,
            pay_url: env::var("GATEWAY_PAY_URL").unwrap_or_else(|_| {
                "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()
            }),
            return_url: env::var("GATEWAY_RETURN_URL")
                .map_err(|_| ConfigError::MissingVariable("GATEWAY_RETURN_URL".to_string()))?,
            version: env::var("GATEWAY_VERSION").unwrap_or_else(|_| "2.1.0".to_string()),
            command: env::var("GATEWAY_COMMAND").unwrap_or_else(|_| "pay".to_string()),
            locale: env::var("GATEWAY_LOCALE").unwrap_or_else(|_| "vn".to_string()),
            currency: env::var("GATEWAY_CURRENCY").unwrap_or_else(|_| "VND".to_string()),
            order_type: env::var("GATEWAY_ORDER_TYPE").unwrap_or_else(|_| "other".to_string()),
            clock_offset: parse_offset(&clock_offset)?,
            expire_minutes: env::var("GATEWAY_EXPIRE_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("GATEWAY_EXPIRE_MINUTES".to_string()))?,
            success_redirect_url: env::var("PAYMENT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/payment/success".to_string()),
            failure_redirect_url: env::var("PAYMENT_FAILURE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/payment/failure".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_secret.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "GATEWAY_HASH_SECRET cannot be empty".to_string(),
            ));
        }

        if self.tmn_code.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "GATEWAY_TMN_CODE cannot be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("GATEWAY_PAY_URL", &self.pay_url),
            ("GATEWAY_RETURN_URL", &self.return_url),
            ("PAYMENT_SUCCESS_URL", &self.success_redirect_url),
            ("PAYMENT_FAILURE_URL", &self.failure_redirect_url),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a valid URL",
                    name
                )));
            }
        }

        if url::Url::parse(&self.pay_url).is_ok_and(|url| url.query().is_some()) {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_PAY_URL must not carry a query string".to_string(),
            ));
        }

        if self.expire_minutes <= 0 {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_EXPIRE_MINUTES must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// `+HH:MM` / `-HH:MM`, as accepted by chrono
fn parse_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    raw.trim()
        .parse::<FixedOffset>()
        .map_err(|e| ConfigError::InvalidValue(format!("GATEWAY_CLOCK_OFFSET: {}", e)))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
