//! Policy source providers.
//!
//! A refresh cycle pulls reference data and rule-module text for a site from
//! two independent providers. This module defines the provider traits and the
//! implementations the authorizer builder wires up:
//!
//! | Provider                | Behavior                                        |
//! |-------------------------|-------------------------------------------------|
//! | [`EmptyData`]           | empty mapping (default)                         |
//! | [`EmptyModule`]         | empty module text (default)                     |
//! | [`StaticData`]          | fixed mapping                                   |
//! | [`StaticModule`]        | fixed module text                               |
//! | [`FnDataProvider`]      | async closure per site                          |
//! | [`FnModuleProvider`]    | async closure per site                          |
//! | [`UrlDataProvider`]     | JSON document fetched once at construction      |
//! | [`FileDataProvider`]    | JSON file re-read every cycle                   |
//! | [`FileModuleProvider`]  | module file re-read every cycle                 |

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::DataMap;
use crate::error::ProviderError;

/// Timeout applied to the one-shot fetch of a URL data source.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Provider Traits
// =============================================================================

/// Source of reference data for a site.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Fetch the current reference data for `site`.
    async fn fetch_data(&self, site: &str) -> Result<DataMap, ProviderError>;
}

/// Source of rule-module text for a site.
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    /// Fetch the current rule-module text for `site`.
    async fn fetch_module(&self, site: &str) -> Result<String, ProviderError>;
}

// =============================================================================
// Defaults and Static Sources
// =============================================================================

/// Serves an empty data mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyData;

#[async_trait]
impl DataProvider for EmptyData {
    async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
        Ok(DataMap::new())
    }
}

/// Serves an empty module.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyModule;

#[async_trait]
impl ModuleProvider for EmptyModule {
    async fn fetch_module(&self, _site: &str) -> Result<String, ProviderError> {
        Ok(String::new())
    }
}

/// Serves the same data mapping for every site.
#[derive(Debug, Clone, Default)]
pub struct StaticData(pub DataMap);

#[async_trait]
impl DataProvider for StaticData {
    async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Serves the same module text for every site.
#[derive(Debug, Clone, Default)]
pub struct StaticModule(pub String);

#[async_trait]
impl ModuleProvider for StaticModule {
    async fn fetch_module(&self, _site: &str) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Closure Sources
// =============================================================================

/// Data provider backed by an async closure receiving the site.
pub struct FnDataProvider<F> {
    f: F,
}

impl<F> FnDataProvider<F> {
    /// Wrap an async closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DataProvider for FnDataProvider<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<DataMap, ProviderError>> + Send + 'static,
{
    async fn fetch_data(&self, site: &str) -> Result<DataMap, ProviderError> {
        (self.f)(site.to_string()).await
    }
}

/// Module provider backed by an async closure receiving the site.
pub struct FnModuleProvider<F> {
    f: F,
}

impl<F> FnModuleProvider<F> {
    /// Wrap an async closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ModuleProvider for FnModuleProvider<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ProviderError>> + Send + 'static,
{
    async fn fetch_module(&self, site: &str) -> Result<String, ProviderError> {
        (self.f)(site.to_string()).await
    }
}

// =============================================================================
// URL Source
// =============================================================================

/// Data provider serving a JSON document fetched once from a fixed URL.
///
/// A failed fetch is remembered and returned by every cycle, so the
/// authorizer stays unready rather than silently serving empty data.
#[derive(Debug, Clone)]
pub struct UrlDataProvider {
    url: String,
    data: Result<DataMap, ProviderError>,
}

impl UrlDataProvider {
    /// Fetch `url` now and serve the result from then on.
    pub async fn fetch(url: &str) -> Self {
        Self::fetch_with_timeout(url, DEFAULT_FETCH_TIMEOUT).await
    }

    /// Like [`fetch`](Self::fetch) with an explicit request timeout.
    pub async fn fetch_with_timeout(url: &str, timeout: Duration) -> Self {
        let data = fetch_json(url, timeout).await;
        match &data {
            Ok(map) => tracing::info!(url, keys = map.len(), "Loaded policy data from URL"),
            Err(e) => tracing::warn!(url, error = %e, "Failed to load policy data from URL"),
        }

        Self {
            url: url.to_string(),
            data,
        }
    }
}

#[async_trait]
impl DataProvider for UrlDataProvider {
    async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
        if self.data.is_err() {
            tracing::debug!(url = %self.url, "Replaying failed policy data fetch");
        }
        self.data.clone()
    }
}

async fn fetch_json(url: &str, timeout: Duration) -> Result<DataMap, ProviderError> {
    let url = url::Url::parse(url)
        .map_err(|e| ProviderError::invalid_content(format!("invalid data URL '{url}': {e}")))?;

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::unavailable(format!("failed to create HTTP client: {e}")))?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| ProviderError::unavailable(format!("GET {url} failed: {e}")))?;

    let value: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::invalid_content(format!("{url} is not valid JSON: {e}")))?;

    into_data_map(value)
}

// =============================================================================
// File Sources
// =============================================================================

/// Data provider reading a JSON file on every cycle.
#[derive(Debug, Clone)]
pub struct FileDataProvider {
    path: PathBuf,
}

impl FileDataProvider {
    /// Read data from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataProvider for FileDataProvider {
    async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
        let content = read_file(&self.path).await?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            ProviderError::invalid_content(format!("{} is not valid JSON: {e}", self.path.display()))
        })?;
        into_data_map(value)
    }
}

/// Module provider reading a file on every cycle.
#[derive(Debug, Clone)]
pub struct FileModuleProvider {
    path: PathBuf,
}

impl FileModuleProvider {
    /// Read the module from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ModuleProvider for FileModuleProvider {
    async fn fetch_module(&self, _site: &str) -> Result<String, ProviderError> {
        read_file(&self.path).await
    }
}

async fn read_file(path: &Path) -> Result<String, ProviderError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ProviderError::unavailable(format!("failed to read {}: {e}", path.display())))
}

/// Accept a JSON object (or `null`, meaning empty) as reference data.
fn into_data_map(value: Value) -> Result<DataMap, ProviderError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(DataMap::new()),
        other => Err(ProviderError::invalid_content(format!(
            "policy data must be a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
