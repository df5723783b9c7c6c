// Copyright 2025 ContactSearch Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! JSON-over-HTTP transport to the search backend.
//!
//! Every request goes through [`send`], which retries transport failures,
//! 429s and truncated response bodies with exponential backoff before giving
//! up. Any other non-2xx status fails immediately so callers see the backend's
//! complaint on the first attempt.

use std::error::Error;
use std::fmt::{self, Display};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;

/// Maximum number of HTTP attempts for a single logical request.
const MAX_ATTEMPTS: usize = 5;

/// Typed errors surfaced by the transport and the index lifecycle calls
/// built on top of it.
#[derive(Debug)]
pub enum ElasticError {
    /// Connect, timeout or body-read failure after retries were exhausted.
    Transport(String),
    /// Non-2xx response from the backend, with the buffered body.
    Backend { status: u16, body: String },
    /// The backend answered 2xx but the body did not decode as expected.
    Decode(String),
    /// An empty physical index name was passed to a call that requires one.
    IndexMissing,
}

impl Display for ElasticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElasticError::Transport(s) => write!(f, "transport error: {}", s),
            ElasticError::Backend { status, body } => {
                write!(f, "received non-2xx response {}: {}", status, body)
            }
            ElasticError::Decode(s) => write!(f, "error decoding response: {}", s),
            ElasticError::IndexMissing => write!(f, "empty physical index name"),
        }
    }
}

impl Error for ElasticError {}

/// Backoff before retry `attempt` (zero-based): 1s, 2s, 4s, 8s, 16s.
fn backoff(attempt: usize) -> Duration {
    Duration::from_secs(1 << attempt)
}

/// Sends a JSON request and returns the fully buffered response body.
///
/// Retried: no response at all (connect error or timeout), 429, and a body
/// read that ends short. Everything else non-2xx returns
/// [`ElasticError::Backend`] without retrying.
pub async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<&[u8]>,
) -> Result<Vec<u8>, ElasticError> {
    let mut last_err = ElasticError::Transport("no attempts made".to_string());

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt - 1)).await;
        }

        let mut req = client
            .request(method.clone(), url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(b) = body {
            req = req.body(b.to_vec());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(url, method = %method, error = %e, "error making request, retrying");
                last_err = ElasticError::Transport(e.to_string());
                continue;
            }
        };

        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let resp_body = resp.text().await.unwrap_or_default();
            tracing::warn!(url, method = %method, "rate limited by backend, retrying");
            last_err = ElasticError::Backend {
                status: status.as_u16(),
                body: resp_body,
            };
            continue;
        }

        // buffer the whole body up front so it can be logged and re-examined
        let resp_body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(url, method = %method, error = %e, "error reading response, retrying");
                last_err = ElasticError::Transport(e.to_string());
                continue;
            }
        };

        if !status.is_success() {
            let body_text = String::from_utf8_lossy(&resp_body).into_owned();
            tracing::error!(url, method = %method, status = status.as_u16(), response = %body_text, "error reaching backend");
            return Err(ElasticError::Backend {
                status: status.as_u16(),
                body: body_text,
            });
        }

        tracing::debug!(url, method = %method, status = status.as_u16(), "request successful");
        return Ok(resp_body.to_vec());
    }

    Err(last_err)
}

/// Like [`send`] but decodes the response body into `T`.
pub async fn request_json<T: DeserializeOwned>(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<&[u8]>,
) -> Result<T, ElasticError> {
    let resp_body = send(client, method, url, body).await?;

    serde_json::from_slice(&resp_body).map_err(|e| {
        tracing::error!(url, error = %e, response = %String::from_utf8_lossy(&resp_body), "error decoding response");
        ElasticError::Decode(e.to_string())
    })
}
