//! HTTP client for the catalog price oracle.
//!
//! The orchestrator resolves the current price of every ordered product
//! through this client. The catalog is read-only from this system's point of
//! view; failures are surfaced as a typed error the orchestrator matches on
//! instead of a magic string.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A product as reported by the catalog service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub price: f64,
}

/// Failure modes of a catalog lookup. `NotFound` is client-caused and maps
/// to a 404 upstream; everything else is a communication failure.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product not found: {0}")]
    NotFound(String),
    #[error("catalog unavailable: {0}")]
    Communication(String),
}

/// Read-only price oracle consumed by the order orchestrator.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Resolve the current price of a product, or fail with a typed error.
    async fn get_product(&self, product_id: &str) -> Result<Product, CatalogError>;
}

/// reqwest-backed implementation talking to the catalog service over HTTP.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    /// Builds a client with a bounded per-request timeout; a timeout is a
    /// communication failure, never left unresolved.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Communication(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn get_product(&self, product_id: &str) -> Result<Product, CatalogError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), product_id);
        debug!(product_id, "Resolving product price from catalog");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CatalogError::Communication(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(product_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(CatalogError::Communication(format!(
                "catalog returned status {}",
                response.status()
            )));
        }

        response
            .json::<Product>()
            .await
            .map_err(|e| CatalogError::Communication(e.to_string()))
    }
}
