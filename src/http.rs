//! HTTP wire client.
//!
//! Blocking reqwest implementation of the remote boundary: JSON bodies for
//! save and load, and a newline-delimited JSON stream for feeds. The core
//! is thread-based, so requests run on whichever worker needs them — the
//! outbox drain for saves, the subscriber stream thread for feeds.

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{FactlineError, FactlineResult, TransportError};
use crate::fact::{FactEnvelope, FactReference};
use crate::remote::{
    AuthenticationProvider, FeedConnection, FeedEvent, RemoteEndpoint, FEED_RECYCLE_INTERVAL,
};

/// Content type of the feed stream.
pub const FEED_STREAM_ACCEPT: &str = "application/x-factline-feed-stream";

#[derive(Debug, Serialize, Deserialize)]
struct SaveRequest {
    envelopes: Vec<FactEnvelope>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadRequest {
    references: Vec<FactReference>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadResponse {
    envelopes: Vec<FactEnvelope>,
}

/// Reference `RemoteEndpoint` over HTTP.
pub struct WebClient {
    http: reqwest::blocking::Client,
    stream_http: reqwest::blocking::Client,
    base_url: String,
    authentication: Arc<dyn AuthenticationProvider>,
}

impl WebClient {
    /// Creates a client for a base URL.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        authentication: Arc<dyn AuthenticationProvider>,
    ) -> FactlineResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FactlineError::internal(format!("http client: {e}")))?;
        // Stream reads block until data arrives; the deadline doubles as
        // the forced recycle.
        let stream_http = reqwest::blocking::Client::builder()
            .timeout(FEED_RECYCLE_INTERVAL + Duration::from_secs(10))
            .build()
            .map_err(|e| FactlineError::internal(format!("http stream client: {e}")))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            http,
            stream_http,
            base_url,
            authentication,
        })
    }

    fn apply_headers(&self, mut request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        for (name, value) in self.authentication.headers() {
            request = request.header(name, value);
        }
        request
    }

    /// Sends a request, refreshing credentials and retrying once when the
    /// server demands reauthentication.
    fn send_with_reauth(
        &self,
        build: impl Fn(&Self) -> reqwest::blocking::RequestBuilder,
    ) -> FactlineResult<reqwest::blocking::Response> {
        let response = self
            .apply_headers(build(self))
            .send()
            .map_err(connection_error)?;

        let status = response.status().as_u16();
        if !demands_reauthentication(status) {
            return Ok(response);
        }
        if !self.authentication.reauthenticate() {
            return Err(TransportError::Unauthenticated { status }.into());
        }

        let retried = self
            .apply_headers(build(self))
            .send()
            .map_err(connection_error)?;
        let retried_status = retried.status().as_u16();
        if demands_reauthentication(retried_status) {
            return Err(TransportError::Unauthenticated {
                status: retried_status,
            }
            .into());
        }
        Ok(retried)
    }
}

const fn demands_reauthentication(status: u16) -> bool {
    matches!(status, 401 | 407 | 419)
}

fn connection_error(err: reqwest::Error) -> FactlineError {
    TransportError::Retryable {
        message: err.to_string(),
    }
    .into()
}

/// Maps a non-2xx save/load status to its error. 403 is a definitive
/// authorization rejection; every other 4xx is reported retryable so the
/// outbox keeps trying through transient proxy faults.
fn status_error(status: u16, body: String) -> FactlineError {
    if status == 403 {
        return TransportError::Fatal {
            status,
            message: body,
        }
        .into();
    }
    TransportError::Retryable {
        message: format!("status {status}: {body}"),
    }
    .into()
}

impl RemoteEndpoint for WebClient {
    fn post_save(&self, envelopes: &[FactEnvelope]) -> FactlineResult<()> {
        let body = SaveRequest {
            envelopes: envelopes.to_vec(),
        };
        let response = self.send_with_reauth(|client| {
            client
                .http
                .post(format!("{}/save", client.base_url))
                .json(&body)
        })?;

        let status = response.status();
        if status.is_success() {
            // 201 is the documented success; any other 2xx is treated as
            // success with an empty body.
            return Ok(());
        }
        let code = status.as_u16();
        let text = response.text().unwrap_or_default();
        Err(status_error(code, text))
    }

    fn post_load(&self, references: &[FactReference]) -> FactlineResult<Vec<FactEnvelope>> {
        let body = LoadRequest {
            references: references.to_vec(),
        };
        let response = self.send_with_reauth(|client| {
            client
                .http
                .post(format!("{}/load", client.base_url))
                .json(&body)
        })?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response.text().unwrap_or_default();
            return Err(status_error(code, text));
        }

        let loaded: LoadResponse = response.json().map_err(|e| {
            FactlineError::Transport(TransportError::Retryable {
                message: format!("malformed load response: {e}"),
            })
        })?;
        Ok(loaded.envelopes)
    }

    fn open_feed(&self, feed: &str, bookmark: &str) -> FactlineResult<Box<dyn FeedConnection>> {
        let response = self.send_with_reauth(|client| {
            client
                .stream_http
                .get(format!("{}/feeds/{feed}", client.base_url))
                .query(&[("bookmark", bookmark)])
                .header(reqwest::header::ACCEPT, FEED_STREAM_ACCEPT)
        })?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let text = response.text().unwrap_or_default();
            return Err(status_error(code, text));
        }

        Ok(Box::new(HttpFeedConnection {
            reader: BufReader::new(response),
            opened_at: Instant::now(),
        }))
    }
}

struct HttpFeedConnection {
    reader: BufReader<reqwest::blocking::Response>,
    opened_at: Instant,
}

impl FeedConnection for HttpFeedConnection {
    fn next_event(&mut self) -> FactlineResult<Option<FeedEvent>> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let event: FeedEvent = serde_json::from_str(line).map_err(|e| {
                        FactlineError::Transport(TransportError::Retryable {
                            message: format!("malformed feed event: {e}"),
                        })
                    })?;
                    return Ok(Some(event));
                }
                Err(err) => {
                    // A read deadline past the recycle window is the
                    // orderly end of this connection's life.
                    if self.opened_at.elapsed() >= FEED_RECYCLE_INTERVAL {
                        return Ok(None);
                    }
                    return Err(TransportError::Retryable {
                        message: format!("feed read failed: {err}"),
                    }
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_status_is_fatal() {
        let err = status_error(403, "no rule".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn other_client_errors_are_retryable() {
        assert!(status_error(404, String::new()).is_retryable());
        assert!(status_error(429, String::new()).is_retryable());
        assert!(status_error(500, String::new()).is_retryable());
    }

    #[test]
    fn reauthentication_statuses() {
        assert!(demands_reauthentication(401));
        assert!(demands_reauthentication(407));
        assert!(demands_reauthentication(419));
        assert!(!demands_reauthentication(403));
        assert!(!demands_reauthentication(200));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = WebClient::new(
            "https://example.test/api///",
            Duration::from_secs(30),
            Arc::new(crate::remote::NullAuthenticationProvider),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://example.test/api");
    }
}
