use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::{
    cookie::{CookieStore, Jar},
    Client, Url,
};
use serde::de::DeserializeOwned;
use shared::protocol::ApiCall;
use storage::StoredCookie;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP seam for the whole client: one cookie-holding `reqwest` client plus
/// typed execution against the service's JSON envelope. The handshake
/// endpoints answer with JS fragments, so raw text fetches live here too.
pub struct Transport {
    http: Client,
    jar: Arc<Jar>,
}

impl Transport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .user_agent(user_agent)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, jar })
    }

    /// Execute one API call: GET when there is no body, POST otherwise.
    /// Decodes into `T` and enforces the uniform result envelope; a non-zero
    /// result code surfaces as `shared::error::ApiError`.
    pub async fn execute<T>(&self, url: &str, body: Option<serde_json::Value>) -> Result<T>
    where
        T: DeserializeOwned + ApiCall,
    {
        debug!(%url, has_body = body.is_some(), "executing api call");
        let request = match &body {
            Some(body) => self.http.post(url).json(body),
            None => self.http.get(url),
        };
        let response: T = request
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("failed to decode response from {url}"))?;

        if !response.base_response().is_success() {
            return Err(response.base_response().to_error().into());
        }
        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let text = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()?
            .text()
            .await
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(text)
    }

    pub async fn post_form_text(&self, url: &str, params: &[(&str, String)]) -> Result<String> {
        let text = self
            .http
            .post(url)
            .form(params)
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()?
            .text()
            .await
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(text)
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()?
            .bytes()
            .await
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(bytes.to_vec())
    }

    /// Snapshot the cookies the jar would send to `base_url`, for session
    /// persistence.
    pub fn snapshot_cookies(&self, base_url: &str) -> Vec<StoredCookie> {
        let Ok(url) = Url::parse(base_url) else {
            return Vec::new();
        };
        let Some(header) = self.jar.cookies(&url) else {
            return Vec::new();
        };
        header
            .to_str()
            .map(parse_cookie_header)
            .unwrap_or_default()
    }

    /// Re-seed the jar from a persisted session so resumed calls carry the
    /// original authentication cookies.
    pub fn restore_cookies(&self, base_url: &str, cookies: &[StoredCookie]) -> Result<()> {
        let url = Url::parse(base_url)
            .with_context(|| format!("persisted base url is invalid: {base_url}"))?;
        for cookie in cookies {
            self.jar
                .add_cookie_str(&format!("{}={}", cookie.name, cookie.value), &url);
        }
        Ok(())
    }
}

fn parse_cookie_header(header: &str) -> Vec<StoredCookie> {
    header
        .split("; ")
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some(StoredCookie {
                name: name.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_cookie_header_into_pairs() {
        let cookies = parse_cookie_header("wxuin=123; wxsid=abc; webwx_data_ticket=x=y");
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0].name, "wxuin");
        assert_eq!(cookies[0].value, "123");
        assert_eq!(cookies[2].value, "x=y");
    }

    #[test]
    fn ignores_malformed_cookie_fragments() {
        let cookies = parse_cookie_header("no-equals-here; =novalue; ok=1");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "ok");
    }

    #[test]
    fn cookie_round_trip_through_the_jar() {
        let transport = Transport::new("test-agent").expect("client");
        let base = "http://127.0.0.1:9/cgi-bin";
        transport
            .restore_cookies(
                base,
                &[
                    StoredCookie {
                        name: "wxuin".into(),
                        value: "123".into(),
                    },
                    StoredCookie {
                        name: "wxsid".into(),
                        value: "abc".into(),
                    },
                ],
            )
            .expect("restore");

        let snapshot = transport.snapshot_cookies(base);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot
            .iter()
            .any(|c| c.name == "wxuin" && c.value == "123"));
    }
}
