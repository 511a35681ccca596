//! HTTP readiness probe for code hosts.

use std::time::Duration;

use {async_trait::async_trait, tracing::debug, url::Url};

/// Decides whether the code server behind a URL answers.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `credentials` are sent as basic auth; userinfo embedded in `url` is
    /// used when none are given.
    async fn is_ready(&self, url: &str, credentials: Option<(&str, &str)>) -> bool;
}

/// Probe that treats `200` and `302` as ready and anything else, including
/// TLS and connection failures, as not ready.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

/// Split userinfo out of `url`, returning the bare URL and the credentials.
fn split_credentials(url: &str) -> Option<(Url, Option<(String, String)>)> {
    let mut parsed = Url::parse(url).ok()?;
    let creds = match (parsed.username(), parsed.password()) {
        ("", _) => None,
        (user, pass) => Some((user.to_string(), pass.unwrap_or_default().to_string())),
    };
    if creds.is_some() {
        parsed.set_username("").ok()?;
        parsed.set_password(None).ok()?;
    }
    Some((parsed, creds))
}

fn failure_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        return "timeout";
    }
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return "tls";
        }
        source = e.source();
    }
    if err.is_connect() { "connect" } else { "request" }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn is_ready(&self, url: &str, credentials: Option<(&str, &str)>) -> bool {
        let Some((target, embedded)) = split_credentials(url) else {
            debug!(url, "readiness probe skipped: unparseable url");
            return false;
        };

        let mut req = self.client.get(target.clone());
        match (credentials, embedded.as_ref()) {
            (Some((user, pass)), _) => req = req.basic_auth(user, Some(pass)),
            (None, Some((user, pass))) => req = req.basic_auth(user, Some(pass)),
            (None, None) => {},
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let ready = matches!(status, 200 | 302);
                debug!(url = %target, status, ready, "readiness probe answered");
                ready
            },
            Err(e) => {
                debug!(url = %target, kind = failure_kind(&e), error = %e, "readiness probe failed");
                false
            },
        }
    }
}
