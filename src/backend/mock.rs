//! Scripted in-memory backend for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendError, Browser, InterceptedResponse, Tab};

/// Behaviour of every tab a `MockBrowser` opens
#[derive(Debug, Clone, Default)]
pub struct TabScript {
    /// Token returned once `token_after_reads` empty reads happened
    pub token: Option<String>,
    pub token_after_reads: usize,
    /// Returned by every `serve`
    pub serve_error: Option<BackendError>,
    /// Returned by every `input_value`
    pub read_error: Option<BackendError>,
    /// Returned by every `click`
    pub click_error: Option<BackendError>,
    /// Returned by every `close`
    pub close_error: Option<BackendError>,
    /// Captured responses handed out by the first `intercepted` call
    pub responses: Vec<InterceptedResponse>,
    /// Panic inside `serve`
    pub panic_on_serve: bool,
}

/// Shared counters for assertions
#[derive(Debug, Default)]
pub struct MockStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub reads: AtomicUsize,
    pub clicks: AtomicUsize,
    pub served: Mutex<Vec<(String, String)>>,
    pub navigations: Mutex<Vec<String>>,
}

pub struct MockBrowser {
    script: TabScript,
    fail_open: AtomicBool,
    pub stats: Arc<MockStats>,
}

impl MockBrowser {
    pub fn new(script: TabScript) -> Self {
        Self {
            script,
            fail_open: AtomicBool::new(false),
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Open `count` tabs as `Arc`s, ready for a pool
    pub async fn tabs(&self, count: usize) -> Vec<Arc<dyn Tab>> {
        self.open_tabs(count)
            .await
            .unwrap()
            .into_iter()
            .map(Arc::from)
            .collect()
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn open_tabs(&self, count: usize) -> Result<Vec<Box<dyn Tab>>, BackendError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock browser down".into()));
        }
        let script = &self.script;
        let tabs = (0..count)
            .map(|_| {
                let n = self.stats.opened.fetch_add(1, Ordering::SeqCst);
                Box::new(MockTab {
                    id: format!("mock-{}", n),
                    script: script.clone(),
                    reads: AtomicUsize::new(0),
                    responses: Mutex::new(script.responses.clone()),
                    stats: self.stats.clone(),
                }) as Box<dyn Tab>
            })
            .collect();
        Ok(tabs)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct MockTab {
    id: String,
    script: TabScript,
    reads: AtomicUsize,
    responses: Mutex<Vec<InterceptedResponse>>,
    stats: Arc<MockStats>,
}

#[async_trait]
impl Tab for MockTab {
    fn id(&self) -> &str {
        &self.id
    }

    async fn serve(&self, url: &str, html: &str) -> Result<(), BackendError> {
        if self.script.panic_on_serve {
            panic!("mock tab panicked");
        }
        if let Some(err) = &self.script.serve_error {
            return Err(err.clone());
        }
        self.stats
            .served
            .lock()
            .unwrap()
            .push((url.to_string(), html.to_string()));
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BackendError> {
        self.stats.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn input_value(
        &self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<String, BackendError> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.script.read_error {
            return Err(err.clone());
        }
        let reads = self.reads.fetch_add(1, Ordering::SeqCst);
        match &self.script.token {
            Some(token) if reads >= self.script.token_after_reads => Ok(token.clone()),
            _ => Ok(String::new()),
        }
    }

    async fn click(&self, _selector: &str, _timeout: Duration) -> Result<(), BackendError> {
        self.stats.clicks.fetch_add(1, Ordering::SeqCst);
        match &self.script.click_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn intercepted(
        &self,
        url_fragment: &str,
    ) -> Result<Vec<InterceptedResponse>, BackendError> {
        let mut responses = self.responses.lock().unwrap();
        let (matching, rest): (Vec<_>, Vec<_>) = responses
            .drain(..)
            .partition(|r| r.url.contains(url_fragment));
        *responses = rest;
        Ok(matching)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        match &self.script.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
