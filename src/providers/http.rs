//! Shared HTTP plumbing for the REST/GraphQL adapters.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProviderError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a request authenticates against the provider.
#[derive(Clone)]
pub enum Auth<'a> {
    Bearer(&'a str),
    /// GoDaddy style `sso-key KEY:SECRET`.
    SsoKey(&'a str),
    Basic { user: &'a str, password: &'a str },
}

/// A successful response with its decoded body (`Null` when empty).
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("deploy-orchestrator/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str, auth: &Auth<'_>) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match auth {
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::SsoKey(key) => builder.header("Authorization", format!("sso-key {key}")),
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
        }
    }

    pub async fn json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        auth: &Auth<'_>,
        body: Option<&B>,
    ) -> std::result::Result<ApiResponse, ProviderError> {
        let mut builder = self
            .request(method.clone(), path, auth)
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        debug!(%method, path, "provider request");
        send(builder).await
    }

    pub async fn form<B: Serialize + ?Sized>(
        &self,
        path: &str,
        auth: &Auth<'_>,
        body: &B,
    ) -> std::result::Result<ApiResponse, ProviderError> {
        debug!(method = "POST", path, "provider form request");
        send(self.request(Method::POST, path, auth).form(body)).await
    }

    /// Unauthenticated GET of an absolute URL; any status counts as an answer.
    pub async fn fetch_status(&self, url: &str) -> std::result::Result<StatusCode, ProviderError> {
        debug!(url, "checking deployment url");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;
        Ok(response.status())
    }

    /// Like [`HttpApi::json`] but maps 404 to `Ok(None)`.
    pub async fn get_optional(
        &self,
        path: &str,
        auth: &Auth<'_>,
    ) -> std::result::Result<Option<ApiResponse>, ProviderError> {
        match self.json::<Value>(Method::GET, path, auth, None).await {
            Ok(resp) => Ok(Some(resp)),
            Err(ProviderError::PermanentApi {
                status: Some(404), ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

async fn send(builder: RequestBuilder) -> std::result::Result<ApiResponse, ProviderError> {
    let response = builder.send().await.map_err(classify_transport)?;
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.map_err(classify_transport)?;
    if !status.is_success() {
        return Err(classify_status(status, &headers, &text));
    }
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).map_err(|err| ProviderError::PermanentApi {
            status: Some(status.as_u16()),
            message: format!("undecodable response body: {err}"),
        })?
    };
    Ok(ApiResponse { status, body })
}

/// Maps a non-success response onto the adapter error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), summarize_body(body));
    let retry_after = retry_after(headers);
    match status.as_u16() {
        401 => ProviderError::Auth(message),
        429 => ProviderError::RateLimit {
            message,
            retry_after,
        },
        403 if retry_after.is_some() || rate_limit_exhausted(headers) => {
            ProviderError::RateLimit {
                message,
                retry_after,
            }
        }
        403 => ProviderError::Auth(message),
        408 | 500..=599 => ProviderError::TransientNetwork(message),
        code => ProviderError::PermanentApi {
            status: Some(code),
            message,
        },
    }
}

/// Maps a transport-level failure onto the adapter error taxonomy.
pub fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_decode() || err.is_builder() {
        ProviderError::permanent(err.to_string())
    } else {
        ProviderError::TransientNetwork(err.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "0")
}

fn summarize_body(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| match value.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Object(inner)) => inner
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
    });
    let text = message.unwrap_or_else(|| body.trim().to_string());
    if text.is_empty() {
        return "empty response".to_string();
    }
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in pairs {
            map.insert(*key, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn unauthorized_is_auth() {
        let err = classify_status(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "");
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn forbidden_with_rate_headers_is_rate_limit() {
        let err = classify_status(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "0")]),
            r#"{"message":"API rate limit exceeded"}"#,
        );
        assert!(matches!(err, ProviderError::RateLimit { .. }));
        assert!(format!("{err}").contains("API rate limit exceeded"));

        let err = classify_status(StatusCode::FORBIDDEN, &HeaderMap::new(), "forbidden");
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "7")]),
            "",
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_permanent() {
        let err = classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "");
        assert!(matches!(err, ProviderError::TransientNetwork(_)));
        let err = classify_status(StatusCode::REQUEST_TIMEOUT, &HeaderMap::new(), "");
        assert!(matches!(err, ProviderError::TransientNetwork(_)));
        let err = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            &HeaderMap::new(),
            r#"{"message":"name already exists on this account"}"#,
        );
        assert_eq!(
            err,
            ProviderError::PermanentApi {
                status: Some(422),
                message: "HTTP 422: name already exists on this account".into()
            }
        );
    }
}
