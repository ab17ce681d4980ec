//! REST client over reqwest.
//!
//! Every non-2xx response becomes a [`RequestError::Http`] carrying the
//! status, the best message the body offers and the parsed details.
//! Transport failures become [`RequestError::Network`]. No retries happen
//! here.

use async_trait::async_trait;
use campus_core::{ApiRequest, Method, RequestError, RequestExecutor, RequestResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{AuthConfig, ClientConfig};
use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_headers: HeaderMap,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        Self::with_settings(&config.api_base_url, &config.auth, config.request_timeout())
    }

    pub fn with_settings(base_url: &str, auth: &AuthConfig, timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_headers: build_auth_headers(auth)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Issue one call and decode the JSON body.
    pub async fn request(&self, request: ApiRequest) -> RequestResult<Value> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .client
            .request(method, self.url(&request.path))
            .headers(self.auth_headers.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, path = %request.path, "Sending request");
        let response = builder.send().await.map_err(network_error)?;
        parse_response(response).await
    }
}

#[async_trait]
impl RequestExecutor for RestClient {
    async fn execute(&self, request: ApiRequest) -> RequestResult<Value> {
        self.request(request).await
    }
}

fn network_error(err: reqwest::Error) -> RequestError {
    RequestError::network(err.to_string())
}

async fn parse_response(response: reqwest::Response) -> RequestResult<Value> {
    let status = response.status();
    let text = response.text().await.map_err(network_error)?;
    if status.is_success() {
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&text).map_err(|e| RequestError::Decode {
            message: e.to_string(),
        });
    }
    Err(error_from_body(status.as_u16(), status.canonical_reason(), &text))
}

/// Build the structured error for a non-2xx response.
///
/// Message preference: a `message`/`error`/`msg` string in a JSON body,
/// then the raw text, then the status line. `details` is the body's
/// `details` field, or the whole JSON body when that field is absent.
pub fn error_from_body(status: u16, reason: Option<&str>, text: &str) -> RequestError {
    let status_line = match reason {
        Some(reason) => format!("{status} {reason}"),
        None => status.to_string(),
    };

    if let Ok(Value::Object(body)) = serde_json::from_str::<Value>(text) {
        let message = ["message", "error", "msg"]
            .iter()
            .find_map(|field| body.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| status_line.clone());
        let details = match body.get("details") {
            Some(details) if !details.is_null() => Some(details.clone()),
            Some(_) => None,
            None => Some(Value::Object(body)),
        };
        return RequestError::Http {
            status,
            message,
            details,
        };
    }

    let trimmed = text.trim();
    RequestError::Http {
        status,
        message: if trimmed.is_empty() {
            status_line
        } else {
            trimmed.to_string()
        },
        details: None,
    }
}

fn build_auth_headers(auth: &AuthConfig) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("apikey"),
            HeaderValue::from_str(api_key).map_err(|e| ClientError::HttpSetup(e.to_string()))?,
        );
    }
    if let Some(token) = &auth.access_token {
        let value = format!("Bearer {}", token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&value).map_err(|e| ClientError::HttpSetup(e.to_string()))?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_from_json_body() {
        let err = error_from_body(
            422,
            Some("Unprocessable Entity"),
            r#"{"message":"title is required","details":{"field":"title"}}"#,
        );
        assert_eq!(
            err,
            RequestError::Http {
                status: 422,
                message: "title is required".to_string(),
                details: Some(json!({"field": "title"})),
            }
        );
    }

    #[test]
    fn test_error_body_without_details_kept_whole() {
        let err = error_from_body(409, None, r#"{"error":"duplicate","code":"23505"}"#);
        match err {
            RequestError::Http {
                message, details, ..
            } => {
                assert_eq!(message, "duplicate");
                assert_eq!(details, Some(json!({"error": "duplicate", "code": "23505"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_falls_back_to_text_then_status_line() {
        let text = error_from_body(502, Some("Bad Gateway"), "upstream timed out\n");
        assert_eq!(text.to_string(), "HTTP 502: upstream timed out");

        let empty = error_from_body(503, Some("Service Unavailable"), "");
        assert_eq!(empty.to_string(), "HTTP 503: 503 Service Unavailable");
    }

    #[test]
    fn test_auth_headers() {
        let headers = build_auth_headers(&AuthConfig {
            api_key: Some("anon".to_string()),
            access_token: Some("jwt".to_string()),
        })
        .unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "anon");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer jwt");
    }

    #[test]
    fn test_url_join() {
        let client = RestClient::with_settings(
            "https://api.campus.test/",
            &AuthConfig::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.url("/api/notes"), "https://api.campus.test/api/notes");
        assert_eq!(client.url("api/notes"), "https://api.campus.test/api/notes");
    }
}
