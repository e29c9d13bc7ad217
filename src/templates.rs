//! Synthetic page templates
//!
//! Each challenge kind is solved on a minimal page served at the target URL.
//! Templates are static markup; only parameter substitution happens here.

use crate::challenges::{ChallengeKind, ChallengeRequest};

const TURNSTILE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Turnstile</title>
    <script src="https://challenges.cloudflare.com/turnstile/v0/api.js" async defer></script>
</head>
<body>
    {widget}
</body>
</html>
"#;

const RECAPTCHA_V3_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>reCAPTCHA v3</title>
    <script src="https://www.google.com/recaptcha/{api}?render={sitekey_attr}"></script>
</head>
<body>
    <input type="hidden" id="recaptcha-token" name="recaptcha-token">
    <script>
        {namespace}.ready(function() {
            {namespace}.execute('{sitekey_js}', {action: '{action_js}'}).then(function(token) {
                document.getElementById('recaptcha-token').value = token;
            });
        });
    </script>
</body>
</html>
"#;

const RECAPTCHA_V2_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>reCAPTCHA v2</title>
    <script src="https://www.google.com/recaptcha/{api}" async defer></script>
</head>
<body>
    <div class="g-recaptcha" data-sitekey="{sitekey_attr}"{size} data-callback="onSuccess"></div>
    <input type="hidden" id="recaptcha-response">
    <script>
        function onSuccess(token) {
            document.getElementById('recaptcha-response').value = token;
        }
        {autorun}
    </script>
</body>
</html>
"#;

const FUNCAPTCHA_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>FunCaptcha</title>
    <script>
        function setupEnforcement(enforcement) {
            enforcement.setConfig({
                selector: '#arkose',
                onCompleted: function(response) {
                    document.getElementById('arkose-token').value = response.token;
                }
            });
        }
    </script>
    <script src="https://client-api.arkoselabs.com/v2/{sitekey_attr}/api.js" data-callback="setupEnforcement" async defer></script>
</head>
<body>
    <div id="arkose"></div>
    <input type="hidden" id="arkose-token">
</body>
</html>
"#;

const V2_INVISIBLE_AUTORUN: &str =
    "setTimeout(function() { grecaptcha.execute(); }, 1000);";

/// Render the synthetic page for a request
pub fn render(request: &ChallengeRequest) -> String {
    let sitekey_attr = escape_attr(&request.sitekey);
    match request.kind {
        ChallengeKind::Turnstile => {
            fill(TURNSTILE_TEMPLATE, &[("widget", turnstile_widget(request).as_str())])
        }
        ChallengeKind::RecaptchaV3 | ChallengeKind::RecaptchaV3Enterprise => {
            let enterprise = request.kind == ChallengeKind::RecaptchaV3Enterprise;
            let action = request.action.as_deref().unwrap_or_default();
            fill(
                RECAPTCHA_V3_TEMPLATE,
                &[
                    ("api", if enterprise { "enterprise.js" } else { "api.js" }),
                    (
                        "namespace",
                        if enterprise {
                            "grecaptcha.enterprise"
                        } else {
                            "grecaptcha"
                        },
                    ),
                    ("sitekey_attr", sitekey_attr.as_str()),
                    ("sitekey_js", escape_js(&request.sitekey).as_str()),
                    ("action_js", escape_js(action).as_str()),
                ],
            )
        }
        ChallengeKind::RecaptchaV2
        | ChallengeKind::RecaptchaV2Invisible
        | ChallengeKind::RecaptchaV2Enterprise => {
            let invisible = request.kind == ChallengeKind::RecaptchaV2Invisible;
            let enterprise = request.kind == ChallengeKind::RecaptchaV2Enterprise;
            fill(
                RECAPTCHA_V2_TEMPLATE,
                &[
                    ("api", if enterprise { "enterprise.js" } else { "api.js" }),
                    ("sitekey_attr", sitekey_attr.as_str()),
                    ("size", if invisible { r#" data-size="invisible""# } else { "" }),
                    ("autorun", if invisible { V2_INVISIBLE_AUTORUN } else { "" }),
                ],
            )
        }
        ChallengeKind::FunCaptcha => {
            fill(FUNCAPTCHA_TEMPLATE, &[("sitekey_attr", sitekey_attr.as_str())])
        }
    }
}

/// Replace each `{key}` in one pass; substituted text is never scanned again
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = values.iter().find_map(|(key, value)| {
            tail.strip_prefix(key)
                .and_then(|after| after.strip_prefix('}'))
                .map(|after| (*value, after))
        });
        match hit {
            Some((value, after)) => {
                out.push_str(value);
                rest = after;
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn turnstile_widget(request: &ChallengeRequest) -> String {
    let mut div = format!(
        r#"<div class="cf-turnstile" style="background: white;" data-sitekey="{}""#,
        escape_attr(&request.sitekey)
    );
    if let Some(action) = &request.action {
        div.push_str(&format!(r#" data-action="{}""#, escape_attr(action)));
    }
    if let Some(cdata) = &request.cdata {
        div.push_str(&format!(r#" data-cdata="{}""#, escape_attr(cdata)));
    }
    div.push_str("></div>");
    div
}

/// Target URL as the page is served (always with a trailing slash)
pub fn target_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// Escape a value for a double-quoted HTML attribute
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a value for a single-quoted JS string inside a `<script>` block
fn escape_js(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '<' => out.push_str("\\x3c"),
            '>' => out.push_str("\\x3e"),
            _ => out.push(c),
        }
    }
    out
}
