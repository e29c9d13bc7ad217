//! Challenge kinds, request parameters and per-kind tuning profiles
//!
//! Tuning knobs live in `files/challenges.toml`, embedded at build time and
//! validated once at startup.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

/// Supported challenge types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Turnstile,
    RecaptchaV3,
    RecaptchaV3Enterprise,
    RecaptchaV2,
    RecaptchaV2Invisible,
    RecaptchaV2Enterprise,
    FunCaptcha,
}

/// How a solver recognises the token for a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Poll a DOM field until it holds a value, optionally clicking a widget
    /// while it is still empty
    DomPoll {
        value_selector: &'static str,
        click_selector: Option<&'static str>,
    },
    /// Watch network responses whose URL contains the fragment
    NetworkObserve { url_fragment: &'static str },
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 7] = [
        ChallengeKind::Turnstile,
        ChallengeKind::RecaptchaV3,
        ChallengeKind::RecaptchaV3Enterprise,
        ChallengeKind::RecaptchaV2,
        ChallengeKind::RecaptchaV2Invisible,
        ChallengeKind::RecaptchaV2Enterprise,
        ChallengeKind::FunCaptcha,
    ];

    /// Submission route
    pub fn route(&self) -> &'static str {
        match self {
            ChallengeKind::Turnstile => "/turnstile",
            ChallengeKind::RecaptchaV3 => "/recaptchav3",
            ChallengeKind::RecaptchaV3Enterprise => "/recaptchav3enterprise",
            ChallengeKind::RecaptchaV2 => "/recaptchav2",
            ChallengeKind::RecaptchaV2Invisible => "/recaptchav2invisible",
            ChallengeKind::RecaptchaV2Enterprise => "/recaptchav2enterprise",
            ChallengeKind::FunCaptcha => "/funcaptcha",
        }
    }

    /// Key in `challenges.toml`, also used in pending labels
    pub fn key(&self) -> &'static str {
        match self {
            ChallengeKind::Turnstile => "turnstile",
            ChallengeKind::RecaptchaV3 => "recaptcha_v3",
            ChallengeKind::RecaptchaV3Enterprise => "recaptcha_v3_enterprise",
            ChallengeKind::RecaptchaV2 => "recaptcha_v2",
            ChallengeKind::RecaptchaV2Invisible => "recaptcha_v2_invisible",
            ChallengeKind::RecaptchaV2Enterprise => "recaptcha_v2_enterprise",
            ChallengeKind::FunCaptcha => "funcaptcha",
        }
    }

    /// Prefix of failure codes; variants of one widget share a family
    pub fn family(&self) -> &'static str {
        match self {
            ChallengeKind::Turnstile => "turnstile",
            ChallengeKind::RecaptchaV3 | ChallengeKind::RecaptchaV3Enterprise => "recaptcha_v3",
            ChallengeKind::RecaptchaV2
            | ChallengeKind::RecaptchaV2Invisible
            | ChallengeKind::RecaptchaV2Enterprise => "recaptcha_v2",
            ChallengeKind::FunCaptcha => "funcaptcha",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ChallengeKind::Turnstile => "Turnstile",
            ChallengeKind::RecaptchaV3 => "reCAPTCHA v3",
            ChallengeKind::RecaptchaV3Enterprise => "reCAPTCHA v3 Enterprise",
            ChallengeKind::RecaptchaV2 => "reCAPTCHA v2",
            ChallengeKind::RecaptchaV2Invisible => "reCAPTCHA v2 Invisible",
            ChallengeKind::RecaptchaV2Enterprise => "reCAPTCHA v2 Enterprise",
            ChallengeKind::FunCaptcha => "FunCaptcha",
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            ChallengeKind::Turnstile => Strategy::DomPoll {
                value_selector: "[name=cf-turnstile-response]",
                click_selector: Some("div.cf-turnstile"),
            },
            ChallengeKind::RecaptchaV3 | ChallengeKind::RecaptchaV3Enterprise => {
                Strategy::DomPoll {
                    value_selector: "#recaptcha-token",
                    click_selector: None,
                }
            }
            ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV2Enterprise => {
                Strategy::DomPoll {
                    value_selector: "#recaptcha-response",
                    click_selector: Some("iframe[title*='reCAPTCHA']"),
                }
            }
            ChallengeKind::RecaptchaV2Invisible => Strategy::DomPoll {
                value_selector: "#recaptcha-response",
                click_selector: None,
            },
            ChallengeKind::FunCaptcha => Strategy::NetworkObserve {
                url_fragment: "arkoselabs.com/fc/gt2/public_key",
            },
        }
    }

    fn requires_action(&self) -> bool {
        matches!(
            self,
            ChallengeKind::RecaptchaV3 | ChallengeKind::RecaptchaV3Enterprise
        )
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Raw query parameters of a submission
#[derive(Debug, Default, Deserialize)]
pub struct ChallengeQuery {
    pub url: Option<String>,
    pub sitekey: Option<String>,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub min_score: Option<String>,
}

/// Rejected submission parameters
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("Required: {}", .0.join(", "))]
    Missing(&'static [&'static str]),
    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Validated parameters of one challenge
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeRequest {
    pub kind: ChallengeKind,
    pub url: String,
    pub sitekey: String,
    pub action: Option<String>,
    pub cdata: Option<String>,
    pub min_score: Option<f64>,
}

impl ChallengeRequest {
    /// Validate raw query parameters for a kind
    pub fn from_query(kind: ChallengeKind, query: ChallengeQuery) -> Result<Self, RequestError> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let url = non_empty(query.url);
        let sitekey = non_empty(query.sitekey);
        let (Some(url), Some(sitekey)) = (url, sitekey) else {
            return Err(RequestError::Missing(&["url", "sitekey"]));
        };

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RequestError::Invalid {
                field: "url",
                reason: "must be an http(s) URL".to_string(),
            });
        }

        let action = non_empty(query.action);
        let min_score = non_empty(query.min_score);

        let min_score = if kind.requires_action() {
            let (Some(_), Some(raw)) = (&action, min_score) else {
                return Err(RequestError::Missing(&["action", "min_score"]));
            };
            let score = raw.trim().parse::<f64>().map_err(|_| RequestError::Invalid {
                field: "min_score",
                reason: format!("not a number: {}", raw),
            })?;
            if !(0.0..=1.0).contains(&score) {
                return Err(RequestError::Invalid {
                    field: "min_score",
                    reason: format!("must be between 0 and 1, got {}", score),
                });
            }
            Some(score)
        } else {
            None
        };

        let cdata = match kind {
            ChallengeKind::Turnstile => non_empty(query.cdata),
            _ => None,
        };
        let action = match kind {
            ChallengeKind::Turnstile => action,
            _ if kind.requires_action() => action,
            _ => None,
        };

        Ok(Self {
            kind,
            url,
            sitekey,
            action,
            cdata,
            min_score,
        })
    }
}

/// Tuning for one challenge kind
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeProfile {
    pub attempts: u32,
    pub interval: Duration,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
    pub settle: Duration,
    /// Pending deadline handed to the result store
    pub deadline: Duration,
}

/// Raw TOML configuration for a kind
#[derive(Debug, Deserialize)]
struct RawProfile {
    attempts: u32,
    interval_ms: u64,
    #[serde(default)]
    poll_timeout_ms: u64,
    #[serde(default)]
    error_backoff_ms: u64,
    #[serde(default)]
    settle_ms: u64,
    deadline_secs: u64,
}

/// Profiles for every kind, indexed by kind
#[derive(Debug, Clone)]
pub struct ChallengeProfiles {
    profiles: Vec<ChallengeProfile>,
}

impl ChallengeProfiles {
    /// Load the embedded `files/challenges.toml`
    pub fn load() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/challenges.toml"));
        Self::parse(content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut raw: HashMap<String, RawProfile> =
            toml::from_str(content).context("Invalid challenge profile TOML")?;

        let mut profiles = Vec::with_capacity(ChallengeKind::ALL.len());
        for kind in ChallengeKind::ALL {
            let raw = raw
                .remove(kind.key())
                .with_context(|| format!("Missing challenge profile: [{}]", kind.key()))?;
            if raw.attempts == 0 {
                anyhow::bail!("Invalid attempts for {}: must be at least 1", kind.key());
            }
            if raw.deadline_secs == 0 {
                anyhow::bail!("Invalid deadline for {}: must be at least 1s", kind.key());
            }
            profiles.push(ChallengeProfile {
                attempts: raw.attempts,
                interval: Duration::from_millis(raw.interval_ms),
                poll_timeout: Duration::from_millis(raw.poll_timeout_ms),
                error_backoff: Duration::from_millis(raw.error_backoff_ms),
                settle: Duration::from_millis(raw.settle_ms),
                deadline: Duration::from_secs(raw.deadline_secs),
            });
        }

        if let Some(unknown) = raw.keys().next() {
            anyhow::bail!("Unknown challenge profile: [{}]", unknown);
        }

        Ok(Self { profiles })
    }

    pub fn get(&self, kind: ChallengeKind) -> &ChallengeProfile {
        &self.profiles[kind.index()]
    }

    /// Same profile for every kind (tests)
    #[cfg(test)]
    pub fn uniform(profile: ChallengeProfile) -> Self {
        Self {
            profiles: vec![profile; ChallengeKind::ALL.len()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> ChallengeQuery {
        let mut q = ChallengeQuery::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "url" => q.url = v,
                "sitekey" => q.sitekey = v,
                "action" => q.action = v,
                "cdata" => q.cdata = v,
                "min_score" => q.min_score = v,
                _ => unreachable!(),
            }
        }
        q
    }

    #[test]
    fn test_load_embedded_profiles() {
        let profiles = ChallengeProfiles::load().unwrap();
        let turnstile = profiles.get(ChallengeKind::Turnstile);
        assert_eq!(turnstile.attempts, 50);
        assert_eq!(turnstile.deadline, Duration::from_secs(300));

        let v2 = profiles.get(ChallengeKind::RecaptchaV2);
        assert_eq!(v2.attempts, 80);
        assert_eq!(v2.settle, Duration::from_secs(1));

        let fun = profiles.get(ChallengeKind::FunCaptcha);
        assert_eq!(fun.deadline, Duration::from_secs(180));
    }

    #[test]
    fn test_missing_profile_rejected() {
        let content = r#"
[turnstile]
attempts = 1
interval_ms = 1
deadline_secs = 1
"#;
        let err = ChallengeProfiles::parse(content).unwrap_err();
        assert!(err.to_string().contains("recaptcha_v3"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/challenges.toml"))
            .replacen("attempts = 50", "attempts = 0", 1);
        assert!(ChallengeProfiles::parse(&content).is_err());
    }

    #[test]
    fn test_turnstile_requires_url_and_sitekey() {
        let err = ChallengeRequest::from_query(
            ChallengeKind::Turnstile,
            query(&[("url", "https://example.com")]),
        )
        .unwrap_err();
        assert_eq!(err, RequestError::Missing(&["url", "sitekey"]));
        assert_eq!(err.to_string(), "Required: url, sitekey");
    }

    #[test]
    fn test_turnstile_keeps_optional_fields() {
        let req = ChallengeRequest::from_query(
            ChallengeKind::Turnstile,
            query(&[
                ("url", "https://example.com"),
                ("sitekey", "0x4AAA"),
                ("action", "login"),
                ("cdata", "abc"),
            ]),
        )
        .unwrap();
        assert_eq!(req.action.as_deref(), Some("login"));
        assert_eq!(req.cdata.as_deref(), Some("abc"));
        assert_eq!(req.min_score, None);
    }

    #[test]
    fn test_v3_requires_action_and_score() {
        let err = ChallengeRequest::from_query(
            ChallengeKind::RecaptchaV3,
            query(&[("url", "https://example.com"), ("sitekey", "6Le")]),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Required: action, min_score");

        let req = ChallengeRequest::from_query(
            ChallengeKind::RecaptchaV3Enterprise,
            query(&[
                ("url", "https://example.com"),
                ("sitekey", "6Le"),
                ("action", "signup"),
                ("min_score", "0.7"),
            ]),
        )
        .unwrap();
        assert_eq!(req.min_score, Some(0.7));
    }

    #[test]
    fn test_v3_score_out_of_range() {
        let err = ChallengeRequest::from_query(
            ChallengeKind::RecaptchaV3,
            query(&[
                ("url", "https://example.com"),
                ("sitekey", "6Le"),
                ("action", "login"),
                ("min_score", "1.5"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Invalid { field: "min_score", .. }));
    }

    #[test]
    fn test_non_http_url_rejected() {
        let err = ChallengeRequest::from_query(
            ChallengeKind::RecaptchaV2,
            query(&[("url", "file:///etc/passwd"), ("sitekey", "6Le")]),
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Invalid { field: "url", .. }));
    }

    #[test]
    fn test_kind_tables() {
        for kind in ChallengeKind::ALL {
            assert!(kind.route().starts_with('/'));
            assert_eq!(ChallengeKind::ALL[kind.index()], kind);
        }
        assert_eq!(ChallengeKind::RecaptchaV3Enterprise.family(), "recaptcha_v3");
        assert!(matches!(
            ChallengeKind::FunCaptcha.strategy(),
            Strategy::NetworkObserve { .. }
        ));
    }
}
