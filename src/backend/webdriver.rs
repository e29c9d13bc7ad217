//! W3C WebDriver backend
//!
//! Talks to a WebDriver endpoint (geckodriver or a Selenium node) over HTTP.
//! Each `open_tabs` call creates one WebDriver session, which acts as the
//! browser context, and opens the requested number of windows in it. Commands
//! in a session target its current window, so tabs sharing a session switch
//! to their own window under the session lock before each command.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{BackendError, Browser, InterceptedResponse, Tab};
use crate::config::{ProxyConfig, ServerConfig};

/// Key of a web element reference in WebDriver responses
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Delay between element lookups while waiting
const LOOKUP_INTERVAL: Duration = Duration::from_millis(50);

/// Records fetch/XHR responses into `window.__solverCaptured`
const CAPTURE_HOOK: &str = r#"<script>
(function () {
  window.__solverCaptured = [];
  const record = (url, status, body) =>
    window.__solverCaptured.push({ url: String(url), status: status, body: body || "" });
  const originalFetch = window.fetch;
  window.fetch = function () {
    return originalFetch.apply(this, arguments).then(function (response) {
      response.clone().text().then(function (body) {
        record(response.url, response.status, body);
      }).catch(function () {});
      return response;
    });
  };
  const originalOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    this.addEventListener("load", function () {
      const body = typeof this.responseText === "string" ? this.responseText : "";
      record(this.responseURL || url, this.status, body);
    });
    return originalOpen.apply(this, arguments);
  };
})();
</script>
"#;

const WRITE_DOCUMENT: &str =
    "document.open(); document.write(arguments[0]); document.close(); return true;";

const READ_VALUE: &str = "const el = document.querySelector(arguments[0]); \
     return el ? (el.value || '') : null;";

const DRAIN_CAPTURED: &str = "const all = window.__solverCaptured || []; \
     const keep = [], out = []; \
     for (const r of all) { (r.url.includes(arguments[0]) ? out : keep).push(r); } \
     window.__solverCaptured = keep; return out;";

/// Browser backed by a WebDriver endpoint
pub struct WebDriverBrowser {
    client: Client,
    base_url: String,
    capabilities: Value,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl WebDriverBrowser {
    /// Check that the endpoint is ready and prepare session capabilities
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = config.webdriver_url.clone();

        let status: Value = client
            .get(format!("{}/status", base_url))
            .send()
            .await
            .with_context(|| format!("WebDriver endpoint unreachable at {}", base_url))?
            .json()
            .await
            .context("Invalid WebDriver status response")?;

        let ready = status["value"]["ready"].as_bool().unwrap_or(false);
        if !ready {
            anyhow::bail!(
                "WebDriver endpoint at {} is not ready: {}",
                base_url,
                status["value"]["message"].as_str().unwrap_or("no message")
            );
        }
        info!("Connected to WebDriver at {}", base_url);

        Ok(Self {
            client,
            base_url,
            capabilities: capabilities(config.headless, config.proxy.as_ref()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    async fn create_session(&self) -> Result<Arc<Session>, BackendError> {
        let body = json!({ "capabilities": { "alwaysMatch": self.capabilities } });
        let value = send(
            &self.client,
            Method::POST,
            &format!("{}/session", self.base_url),
            Some(body),
        )
        .await?;
        let id = value["sessionId"]
            .as_str()
            .ok_or_else(|| BackendError::Protocol("new session response without sessionId".into()))?
            .to_string();
        debug!("Created WebDriver session {}", id);

        let session = Arc::new(Session {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            id,
            current_window: AsyncMutex::new(None),
            open_tabs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|s| !s.closed.load(Ordering::SeqCst));
        sessions.push(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn open_tabs(&self, count: usize) -> Result<Vec<Box<dyn Tab>>, BackendError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let session = self.create_session().await?;

        let mut handles = Vec::with_capacity(count);
        let first = session.command(Method::GET, "/window", None).await;
        let result = match first {
            Ok(value) => match value.as_str() {
                Some(handle) => {
                    handles.push(handle.to_string());
                    open_windows(&session, count - 1, &mut handles).await
                }
                None => Err(BackendError::Protocol("window handle is not a string".into())),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            session.delete().await;
            return Err(e);
        }

        *session.current_window.lock().await = handles.first().cloned();
        session.open_tabs.store(handles.len(), Ordering::SeqCst);

        let short = session.id.chars().take(8).collect::<String>();
        Ok(handles
            .into_iter()
            .enumerate()
            .map(|(n, window)| {
                Box::new(WebDriverTab {
                    session: session.clone(),
                    label: format!("{}/{}", short, n),
                    window,
                }) as Box<dyn Tab>
            })
            .collect())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for session in sessions {
            session.delete().await;
        }
        Ok(())
    }
}

async fn open_windows(
    session: &Session,
    count: usize,
    handles: &mut Vec<String>,
) -> Result<(), BackendError> {
    for _ in 0..count {
        let value = session
            .command(Method::POST, "/window/new", Some(json!({ "type": "tab" })))
            .await?;
        let handle = value["handle"]
            .as_str()
            .ok_or_else(|| BackendError::Protocol("new window response without handle".into()))?;
        handles.push(handle.to_string());
    }
    Ok(())
}

fn capabilities(headless: bool, proxy: Option<&ProxyConfig>) -> Value {
    let args: Vec<&str> = if headless { vec!["-headless"] } else { Vec::new() };
    let mut caps = json!({
        "browserName": "firefox",
        "acceptInsecureCerts": false,
        "moz:firefoxOptions": { "args": args },
    });

    if let Some(proxy) = proxy {
        if proxy.username.is_some() || proxy.password.is_some() {
            warn!("Proxy credentials are not supported by the WebDriver backend, connecting without them");
        }
        let proxy_caps = match proxy.scheme.as_str() {
            "socks4" => json!({
                "proxyType": "manual",
                "socksProxy": proxy.address(),
                "socksVersion": 4,
            }),
            "socks5" => json!({
                "proxyType": "manual",
                "socksProxy": proxy.address(),
                "socksVersion": 5,
            }),
            _ => json!({
                "proxyType": "manual",
                "httpProxy": proxy.address(),
                "sslProxy": proxy.address(),
            }),
        };
        caps["proxy"] = proxy_caps;
    }
    caps
}

/// Map a WebDriver error code to a backend error
fn map_error(code: &str, message: &str) -> BackendError {
    let detail = format!("{}: {}", code, message);
    match code {
        "no such element" | "stale element reference" | "element not interactable"
        | "element click intercepted" => BackendError::ElementNotFound(detail),
        "timeout" | "script timeout" => BackendError::Timeout(detail),
        "insecure certificate" => BackendError::Denied(detail),
        "invalid session id" | "no such window" | "session not created" => {
            BackendError::Unavailable(detail)
        }
        _ => BackendError::Protocol(detail),
    }
}

/// Send one WebDriver request and unwrap its `value`
async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BackendError> {
    let mut request = client.request(method.clone(), url);
    if method == Method::POST {
        request = request.json(&body.unwrap_or_else(|| json!({})));
    }

    let response = request
        .send()
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| BackendError::Protocol(format!("invalid response ({}): {}", status, e)))?;
    let value = match payload {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        _ => Value::Null,
    };

    if status.is_success() {
        return Ok(value);
    }
    let code = value["error"].as_str().unwrap_or("unknown error");
    let message = value["message"].as_str().unwrap_or_default();
    Err(map_error(code, message))
}

/// One WebDriver session, shared by the tabs opened in it
struct Session {
    client: Client,
    base_url: String,
    id: String,
    /// Window the session currently targets; held while a tab issues commands
    current_window: AsyncMutex<Option<String>>,
    open_tabs: AtomicUsize,
    closed: AtomicBool,
}

impl Session {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}/session/{}{}", self.base_url, self.id, path);
        send(&self.client, method, &url, body).await
    }

    /// Lock the session and point it at `window`
    async fn focus(&self, window: &str) -> Result<AsyncMutexGuard<'_, Option<String>>, BackendError> {
        let mut current = self.current_window.lock().await;
        if current.as_deref() != Some(window) {
            self.command(Method::POST, "/window", Some(json!({ "handle": window })))
                .await?;
            *current = Some(window.to_string());
        }
        Ok(current)
    }

    /// Drop one tab from the count; true when it was the last one
    fn release_tab(&self) -> bool {
        self.open_tabs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous <= 1)
            .unwrap_or(true)
    }

    async fn delete(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let url = format!("{}/session/{}", self.base_url, self.id);
        match send(&self.client, Method::DELETE, &url, None).await {
            Ok(_) => debug!("Deleted WebDriver session {}", self.id),
            Err(e) => warn!("Failed to delete WebDriver session {}: {}", self.id, e),
        }
    }
}

/// One window of a WebDriver session
pub struct WebDriverTab {
    session: Arc<Session>,
    window: String,
    label: String,
}

impl WebDriverTab {
    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, BackendError> {
        let _focus = self.session.focus(&self.window).await?;
        self.session
            .command(
                Method::POST,
                "/execute/sync",
                Some(json!({ "script": script, "args": args })),
            )
            .await
    }

    async fn find_element(&self, selector: &str) -> Result<String, BackendError> {
        let _focus = self.session.focus(&self.window).await?;
        let value = self
            .session
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        value[ELEMENT_KEY]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("element response without reference".into()))
    }
}

#[async_trait]
impl Tab for WebDriverTab {
    fn id(&self) -> &str {
        &self.label
    }

    async fn serve(&self, url: &str, html: &str) -> Result<(), BackendError> {
        self.navigate(url).await?;
        let document = format!("{}{}", CAPTURE_HOOK, html);
        self.execute(WRITE_DOCUMENT, vec![Value::from(document)])
            .await
            .map(|_| ())
    }

    async fn navigate(&self, url: &str) -> Result<(), BackendError> {
        let _focus = self.session.focus(&self.window).await?;
        self.session
            .command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn input_value(&self, selector: &str, timeout: Duration) -> Result<String, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self
                .execute(READ_VALUE, vec![Value::from(selector)])
                .await?;
            if let Some(value) = value.as_str() {
                return Ok(value.to_string());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::ElementNotFound(selector.to_string()));
            }
            sleep(LOOKUP_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), BackendError> {
        let deadline = Instant::now() + timeout;
        let element = loop {
            match self.find_element(selector).await {
                Ok(element) => break element,
                Err(BackendError::ElementNotFound(_)) if Instant::now() < deadline => {
                    sleep(LOOKUP_INTERVAL).await
                }
                Err(e) => return Err(e),
            }
        };

        let _focus = self.session.focus(&self.window).await?;
        self.session
            .command(Method::POST, &format!("/element/{}/click", element), None)
            .await
            .map(|_| ())
    }

    async fn intercepted(&self, url_fragment: &str) -> Result<Vec<InterceptedResponse>, BackendError> {
        let value = self
            .execute(DRAIN_CAPTURED, vec![Value::from(url_fragment)])
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BackendError::Protocol(format!("invalid captured responses: {}", e)))
    }

    async fn close(&self) -> Result<(), BackendError> {
        // A window that is already gone still counts as closed
        let result = match self.session.focus(&self.window).await {
            Ok(mut current) => {
                let result = self.session.command(Method::DELETE, "/window", None).await;
                *current = None;
                result.map(|_| ())
            }
            Err(e) => Err(e),
        };

        // Last tab of the session takes the session with it
        if self.session.release_tab() {
            self.session.delete().await;
        }
        result
    }
}
