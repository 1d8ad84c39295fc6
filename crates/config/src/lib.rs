use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the application.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. Fields cover the database, Kafka,
/// the HTTP server, the catalog collaborator, and the payment provider integration.
/// This struct is deserializable via Serde.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,

    // --- Kafka settings ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Kafka topic carrying payment status events (key = order id, value = outcome).
    pub kafka_topic: String,
    /// Kafka consumer group ID for the order-side payment events consumer.
    pub kafka_group_id: String,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Catalog collaborator ---
    /// Base URL of the catalog service used to resolve product prices.
    pub catalog_base_url: String,

    // --- Payment provider ---
    /// Base URL of the payment provider API.
    pub provider_base_url: String,
    /// Secret API key sent as bearer auth on provider calls.
    pub provider_secret_key: String,
    /// Shared secret used to verify provider webhook signatures.
    pub provider_webhook_secret: String,
    /// Currency used for newly created orders.
    pub order_currency: String,

    // --- Outbound call timeout ---
    /// Bound on catalog and provider calls; a timeout is a communication
    /// failure, never left unresolved (human-friendly format, e.g. "5s").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub upstream_timeout: Duration,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub shutdown_timeout: Duration,
}

/// Custom deserializer for duration fields.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        // Note: These default values are for Docker Compose compatibility.
        // When running locally, these values should be overridden by environment variables
        // with localhost as hostname.
        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "orders_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "orders_db")?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("kafka_topic", "payment-events")?
            .set_default("kafka_group_id", "order-service-group")?
            // HTTP
            .set_default("http_port", 8081)?
            // Catalog
            .set_default("catalog_base_url", "http://localhost:8082/api/v1/products")?
            // Payment provider
            .set_default("provider_base_url", "https://api.stripe.com")?
            .set_default("provider_secret_key", "sk_test_placeholder")?
            .set_default("provider_webhook_secret", "whsec_placeholder")?
            .set_default("order_currency", "EUR")?
            // Timeouts
            .set_default("upstream_timeout", "5s")?
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default().separator("_"))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }
}
