//! Backend module - Browser automation abstraction layer
//!
//! This module defines the contract the solver consumes:
//! - `Browser`: opens fresh contexts with a number of tabs, shuts down
//! - `Tab`: one page inside a context, used by exactly one task at a time
//!
//! The backend module does NOT:
//! - Decide what to click or wait for (that's the solver's job)
//! - Own pooling or task bookkeeping

pub mod webdriver;

#[cfg(test)]
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Failure reported by a backend call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("request denied: {0}")]
    Denied(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Worth another polling attempt on the same tab
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::ElementNotFound(_)
        )
    }
}

/// A network response captured inside a tab
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterceptedResponse {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub body: String,
}

/// One browser tab plus the context (cookie jar) it lives in
#[async_trait]
pub trait Tab: Send + Sync {
    /// Identifier for logging
    fn id(&self) -> &str;

    /// Load `html` as the document of `url`, so page scripts run under that origin
    async fn serve(&self, url: &str, html: &str) -> Result<(), BackendError>;

    /// Plain navigation
    async fn navigate(&self, url: &str) -> Result<(), BackendError>;

    /// Current `value` of the first element matching `selector`
    async fn input_value(&self, selector: &str, timeout: Duration)
        -> Result<String, BackendError>;

    /// Click the first element matching `selector`
    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), BackendError>;

    /// Drain captured responses whose URL contains `url_fragment`
    async fn intercepted(&self, url_fragment: &str)
        -> Result<Vec<InterceptedResponse>, BackendError>;

    /// Close the tab (and its context once no tab is left in it)
    async fn close(&self) -> Result<(), BackendError>;
}

/// Tab factory
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a fresh context holding `count` tabs
    async fn open_tabs(&self, count: usize) -> Result<Vec<Box<dyn Tab>>, BackendError>;

    /// Tear down everything the browser still holds
    async fn shutdown(&self) -> Result<(), BackendError>;
}

// Re-exports
pub use webdriver::WebDriverBrowser;
