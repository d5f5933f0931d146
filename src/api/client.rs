//! HTTP client for the management API and for raw playback fetches.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::context::{CancelCause, RunContext};
use crate::error::HarnessError;

use super::restore::Restore;
use super::types::{paths, Versions};

/// Interval between readiness attempts in [`ApiClient::wait_ready`].
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Response envelope every management endpoint wraps its data in.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    api_secret: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ApiClient {
    /// Build a client for `endpoint` (scheme, host and port, no trailing path).
    pub fn new(
        endpoint: impl Into<String>,
        api_secret: Option<String>,
        insecure_https: bool,
        timeout: Duration,
    ) -> Result<Self, HarnessError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_https)
            .build()
            .map_err(|source| HarnessError::Http {
                url: endpoint.clone(),
                source,
            })?;
        Ok(Self {
            http,
            endpoint,
            api_secret: api_secret.filter(|s| !s.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `body` to `path` and decode the envelope's `data` into `Res`.
    ///
    /// A non-zero envelope code is an [`HarnessError::Api`]. Cancelling `ctx`
    /// abandons the request and returns the context's cause.
    pub async fn request<Req, Res>(
        &self,
        ctx: &RunContext,
        path: &str,
        body: Option<&Req>,
    ) -> Result<Res, HarnessError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.http.post(&url);
        if let Some(secret) = &self.api_secret {
            req = req.bearer_auth(secret);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let text = with_ctx(ctx, async {
            let resp = req.send().await.map_err(|source| HarnessError::Http {
                url: url.clone(),
                source,
            })?;
            let status = resp.status();
            let text = resp.text().await.map_err(|source| HarnessError::Http {
                url: url.clone(),
                source,
            })?;
            if !status.is_success() {
                return Err(HarnessError::Api {
                    path: path.to_string(),
                    code: i64::from(status.as_u16()),
                    body: text,
                });
            }
            Ok(text)
        })
        .await?;
        trace!(%path, body = %text, "api response");

        let envelope: Envelope = serde_json::from_str(&text).map_err(|source| HarnessError::Decode {
            what: format!("response of {}", path),
            source,
        })?;
        if envelope.code != 0 {
            return Err(HarnessError::Api {
                path: path.to_string(),
                code: envelope.code,
                body: text,
            });
        }

        serde_json::from_value(envelope.data.unwrap_or(serde_json::Value::Null)).map_err(|source| {
            HarnessError::Decode {
                what: format!("data of {}", path),
                source,
            }
        })
    }

    /// [`ApiClient::request`] without a request body.
    pub async fn query<Res: DeserializeOwned>(&self, ctx: &RunContext, path: &str) -> Result<Res, HarnessError> {
        self.request::<(), Res>(ctx, path, None).await
    }

    /// [`ApiClient::request`] ignoring whatever data comes back.
    pub async fn update<Req: Serialize + ?Sized>(
        &self,
        ctx: &RunContext,
        path: &str,
        body: &Req,
    ) -> Result<(), HarnessError> {
        self.request::<Req, serde::de::IgnoredAny>(ctx, path, Some(body))
            .await
            .map(|_| ())
    }

    /// GET `url` and return its body as text (playlists, manifests).
    pub async fn fetch_text(&self, ctx: &RunContext, url: &str) -> Result<String, HarnessError> {
        with_ctx(ctx, async {
            let resp = self.http.get(url).send().await.map_err(|source| HarnessError::Http {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            let text = resp.text().await.map_err(|source| HarnessError::Http {
                url: url.to_string(),
                source,
            })?;
            if !status.is_success() {
                return Err(HarnessError::Api {
                    path: url.to_string(),
                    code: i64::from(status.as_u16()),
                    body: text,
                });
            }
            Ok(text)
        })
        .await
    }

    /// Poll the versions endpoint until it answers, or `ctx` finishes.
    pub async fn wait_ready(&self, ctx: &RunContext) -> Result<Versions, HarnessError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.query::<Versions>(ctx, paths::VERSIONS).await {
                Ok(v) => {
                    debug!(attempt, version = %v.version, "service ready");
                    return Ok(v);
                }
                Err(e) if e.is_cancellation() || matches!(e, HarnessError::DeadlineExceeded) => return Err(e),
                Err(e) => debug!(attempt, error = %e, "service not ready yet"),
            }
            tokio::select! {
                _ = ctx.done() => return Err(ctx.err().unwrap_or(CancelCause::Cancelled).into()),
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    /// A restore action that posts `body` to `path` when run or dropped.
    pub fn with_restore<Req: Serialize>(
        &self,
        what: impl Into<String>,
        path: &'static str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Restore, HarnessError> {
        let body = serde_json::to_value(body).map_err(|source| HarnessError::Decode {
            what: format!("restore body for {}", path),
            source,
        })?;
        let api = self.clone();
        Ok(Restore::new(what, timeout, move |ctx| async move {
            api.update(&ctx, path, &body).await
        }))
    }
}

/// Run `fut` unless `ctx` finishes first.
pub(crate) async fn with_ctx<T>(
    ctx: &RunContext,
    fut: impl Future<Output = Result<T, HarnessError>>,
) -> Result<T, HarnessError> {
    if let Some(cause) = ctx.err() {
        return Err(cause.into());
    }
    tokio::select! {
        _ = ctx.done() => Err(ctx.err().unwrap_or(CancelCause::Cancelled).into()),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_without_data() {
        let env: Envelope = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert_eq!(env.code, 0);
        assert!(env.data.is_none());
    }

    #[test]
    fn test_trailing_slash_trimmed_and_secret_hidden() {
        let api = ApiClient::new("http://localhost:2022/", Some("s3cr3t".into()), false, Duration::from_secs(5)).unwrap();
        assert_eq!(api.endpoint(), "http://localhost:2022");
        assert!(!format!("{:?}", api).contains("s3cr3t"));
    }

    #[test]
    fn test_empty_secret_is_none() {
        let api = ApiClient::new("http://localhost:2022", Some(String::new()), false, Duration::from_secs(5)).unwrap();
        assert!(api.api_secret.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_ctx_short_circuits() {
        let api = ApiClient::new("http://127.0.0.1:9", None, false, Duration::from_secs(5)).unwrap();
        let ctx = RunContext::background().with_cancel();
        ctx.cancel();
        let err = api.query::<Versions>(&ctx, paths::VERSIONS).await.unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
    }
}
