//! Solver module for running one challenge task on a pooled tab
//!
//! A task acquires a tab, serves the synthetic page for its challenge and
//! polls until a token shows up or the attempt budget runs out. Exactly one
//! terminal state is written per task; the tab and the admission slot are
//! released by their guards on every path.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionPermit;
use crate::backend::{BackendError, Tab};
use crate::challenges::{ChallengeKind, ChallengeProfile, ChallengeProfiles, ChallengeRequest, Strategy};
use crate::pool::TabPool;
use crate::store::ResultStore;
use crate::task::{round_secs, FailureReason, TaskId, TaskState};
use crate::templates;

/// Shared pieces every task needs
#[derive(Clone)]
pub struct Solver {
    pool: TabPool,
    store: Arc<ResultStore>,
    profiles: Arc<ChallengeProfiles>,
}

impl Solver {
    pub fn new(pool: TabPool, store: Arc<ResultStore>, profiles: Arc<ChallengeProfiles>) -> Self {
        Self {
            pool,
            store,
            profiles,
        }
    }

    /// Run a task in the background
    ///
    /// The solving work runs in its own tokio task so a panic in it still
    /// ends with a terminal write here.
    pub fn spawn(
        &self,
        id: TaskId,
        request: ChallengeRequest,
        permit: AdmissionPermit,
    ) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let store = self.store.clone();
        let profile = self.profiles.get(request.kind).clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let kind = request.kind;
            let task_id = id.clone();

            let worker = tokio::spawn(async move { solve(&pool, &profile, &task_id, &request).await });

            let state = match worker.await {
                Ok(state) => state,
                Err(e) => {
                    error!("{} task {} aborted: {}", kind.display_name(), id, e);
                    TaskState::Error {
                        reason: FailureReason::BackendException {
                            kind,
                            detail: format!("solver task aborted: {}", e),
                        },
                        elapsed: started.elapsed(),
                    }
                }
            };

            store.write_terminal(&id, state);
            drop(permit);
        })
    }
}

/// Solve one request; always returns a terminal state
pub async fn solve(
    pool: &TabPool,
    profile: &ChallengeProfile,
    id: &TaskId,
    request: &ChallengeRequest,
) -> TaskState {
    let started = Instant::now();
    let kind = request.kind;

    let tab = match pool.acquire().await {
        Ok(tab) => tab,
        Err(e) => {
            warn!("{} task {} could not get a tab: {}", kind.display_name(), id, e);
            return TaskState::Error {
                reason: FailureReason::BackendException {
                    kind,
                    detail: e.to_string(),
                },
                elapsed: started.elapsed(),
            };
        }
    };
    debug!("Task {} running on tab {}", id, tab.id());

    let outcome = drive(&*tab, profile, request).await;

    // Leave the tab on a blank page for the next task
    if let Err(e) = tab.navigate("about:blank").await {
        debug!("Failed to reset tab {}: {}", tab.id(), e);
    }
    tab.release();

    let elapsed = started.elapsed();
    match outcome {
        Ok(value) => {
            info!(
                "{} solved, task: {}, time: {}s",
                kind.display_name(),
                id,
                round_secs(elapsed)
            );
            TaskState::Success {
                value,
                elapsed,
                extra: success_extra(request),
            }
        }
        Err(reason) => {
            match &reason {
                FailureReason::BackendException { detail, .. } => error!(
                    "{} exception, task: {}: {}",
                    kind.display_name(),
                    id,
                    detail
                ),
                _ => warn!(
                    "{} failed, task: {}, reason: {}, time: {}s",
                    kind.display_name(),
                    id,
                    reason,
                    round_secs(elapsed)
                ),
            }
            TaskState::Error { reason, elapsed }
        }
    }
}

async fn drive(
    tab: &dyn Tab,
    profile: &ChallengeProfile,
    request: &ChallengeRequest,
) -> Result<String, FailureReason> {
    let kind = request.kind;
    let page = templates::render(request);
    let url = templates::target_url(&request.url);

    tab.serve(&url, &page)
        .await
        .map_err(|e| backend_failure(kind, e))?;

    if !profile.settle.is_zero() {
        sleep(profile.settle).await;
    }

    match kind.strategy() {
        Strategy::DomPoll {
            value_selector,
            click_selector,
        } => poll_dom(tab, profile, kind, value_selector, click_selector).await,
        Strategy::NetworkObserve { url_fragment } => {
            observe_network(tab, profile, kind, url_fragment).await
        }
    }
}

async fn poll_dom(
    tab: &dyn Tab,
    profile: &ChallengeProfile,
    kind: ChallengeKind,
    value_selector: &str,
    click_selector: Option<&str>,
) -> Result<String, FailureReason> {
    for attempt in 1..=profile.attempts {
        match tab.input_value(value_selector, profile.poll_timeout).await {
            Ok(value) if !value.is_empty() => return Ok(value),
            Ok(_) => {
                if let Some(selector) = click_selector {
                    match tab.click(selector, profile.poll_timeout).await {
                        Ok(()) => {}
                        Err(e) if e.is_transient() => {
                            debug!("{} click {} skipped: {}", kind.display_name(), attempt, e)
                        }
                        Err(e) => return Err(backend_failure(kind, e)),
                    }
                }
                sleep(profile.interval).await;
            }
            Err(e) if e.is_transient() => {
                debug!("{} attempt {} fail: {}", kind.display_name(), attempt, e);
                sleep(profile.error_backoff).await;
            }
            Err(e) => return Err(backend_failure(kind, e)),
        }
    }

    Err(FailureReason::NoTokenObserved(kind))
}

async fn observe_network(
    tab: &dyn Tab,
    profile: &ChallengeProfile,
    kind: ChallengeKind,
    url_fragment: &str,
) -> Result<String, FailureReason> {
    for attempt in 1..=profile.attempts {
        match tab.intercepted(url_fragment).await {
            Ok(responses) => {
                for response in responses {
                    match response.status {
                        400 => return Err(FailureReason::BackendDenied),
                        200 => {
                            if let Some(token) = extract_token(&response.body) {
                                return Ok(token);
                            }
                        }
                        status => debug!(
                            "{} ignoring response {} from {}",
                            kind.display_name(),
                            status,
                            response.url
                        ),
                    }
                }
            }
            Err(e) if e.is_transient() => {
                debug!("{} attempt {} fail: {}", kind.display_name(), attempt, e)
            }
            Err(e) => return Err(backend_failure(kind, e)),
        }
        sleep(profile.interval).await;
    }

    Err(FailureReason::NoTokenObserved(kind))
}

fn backend_failure(kind: ChallengeKind, error: BackendError) -> FailureReason {
    match error {
        BackendError::Denied(_) => FailureReason::BackendDenied,
        other => FailureReason::BackendException {
            kind,
            detail: other.to_string(),
        },
    }
}

/// Non-empty `token` field of a JSON body
fn extract_token(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("token")?
        .as_str()
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn success_extra(request: &ChallengeRequest) -> Map<String, Value> {
    let mut extra = Map::new();
    if let (Some(action), Some(min_score)) = (&request.action, request.min_score) {
        if matches!(
            request.kind,
            ChallengeKind::RecaptchaV3 | ChallengeKind::RecaptchaV3Enterprise
        ) {
            extra.insert("action".into(), Value::from(action.clone()));
            extra.insert("min_score".into(), Value::from(min_score));
        }
    }
    extra
}
