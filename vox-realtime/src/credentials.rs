//! Short-lived access credentials.
//!
//! [`CredentialCache`] holds at most one [`Credential`] and refreshes it
//! through a [`CredentialSource`] once it gets within a safety margin of
//! expiry. Concurrent callers during a refresh share the one fetch.

use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{Instrument, debug, info, warn};
use vox_telemetry::credential_refresh_span;

/// Refresh this many seconds before expiry.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 5 * 60;

const MAX_ERROR_BODY: usize = 512;

/// An access token and the model it was issued for.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token for the live endpoint.
    pub token: String,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Model id resolved by the issuer.
    pub model_id: String,
    /// Project the token belongs to, when the issuer reports one.
    pub project_id: Option<String>,
    /// Model name to put in the setup message.
    pub model: String,
}

impl Credential {
    /// Whether the credential is still good for at least `margin`.
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now > margin
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("model_id", &self.model_id)
            .field("project_id", &self.project_id)
            .field("model", &self.model)
            .finish()
    }
}

/// Issues credentials for a model.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch a fresh credential for `model`.
    async fn fetch(&self, model: &str) -> Result<Credential, CredentialError>;
}

/// Fetches credentials from an HTTP token endpoint.
///
/// Sends `POST {"model": ...}` with the caller's bearer token and expects
/// `access_token` plus `expiry_time` (RFC 3339) or `expires_in` (seconds).
#[derive(Debug, Clone)]
pub struct HttpCredentialSource {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    expires_in: Option<i64>,
    expiry_time: Option<String>,
    model_id: Option<String>,
    project_id: Option<String>,
}

impl HttpCredentialSource {
    /// Source at `url`, authenticating with `bearer_token` if given.
    pub fn new(url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), bearer_token, location: None }
    }

    /// Region used to build fully qualified model names.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn parse_response(&self, requested: &str, body: TokenResponse) -> Result<Credential, CredentialError> {
        if body.access_token.is_empty() {
            return Err(CredentialError::InvalidResponse("missing access_token".into()));
        }

        let expires_at = match (&body.expiry_time, body.expires_in) {
            (Some(raw), _) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CredentialError::InvalidResponse(format!("bad expiry_time '{raw}': {e}")))?,
            (None, Some(secs)) => Duration::try_seconds(secs)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or_else(|| CredentialError::InvalidResponse(format!("expires_in out of range: {secs}")))?,
            (None, None) => {
                return Err(CredentialError::InvalidResponse("missing expiry_time and expires_in".into()));
            }
        };

        let model_id = body.model_id.unwrap_or_else(|| requested.to_string());
        let model = match (&body.project_id, &self.location) {
            (Some(project), Some(location)) => {
                format!("projects/{project}/locations/{location}/publishers/google/models/{model_id}")
            }
            _ => model_id.clone(),
        };

        Ok(Credential { token: body.access_token, expires_at, model_id, project_id: body.project_id, model })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, model: &str) -> Result<Credential, CredentialError> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({ "model": model }));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
                body.truncate(cut);
            }
            return Err(CredentialError::Status { status: status.as_u16(), body });
        }

        let body: TokenResponse =
            response.json().await.map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        self.parse_response(model, body)
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, CredentialError>>>;

enum Slot {
    Empty,
    Ready(Credential),
    Refreshing(RefreshFuture),
}

struct CacheState {
    slot: Slot,
    // Bumped by clear_cache so an older refresh cannot repopulate the slot.
    epoch: u64,
}

/// Caches one credential and refreshes it ahead of expiry.
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    model: String,
    margin: Duration,
    state: Mutex<CacheState>,
    fetches: AtomicUsize,
}

impl CredentialCache {
    /// Cache credentials for `model` from `source`.
    pub fn new(source: Arc<dyn CredentialSource>, model: impl Into<String>) -> Self {
        Self {
            source,
            model: model.into(),
            margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            state: Mutex::new(CacheState { slot: Slot::Empty, epoch: 0 }),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Override the refresh margin.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Model credentials are requested for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// A credential valid for at least the safety margin.
    ///
    /// Returns the cached one without I/O when it is fresh enough.
    pub async fn get_valid_token(&self) -> Result<Credential, CredentialError> {
        let (refresh, epoch) = {
            let mut state = self.state.lock();
            let in_flight = match &state.slot {
                Slot::Ready(credential) if credential.is_fresh(self.margin, Utc::now()) => {
                    return Ok(credential.clone());
                }
                Slot::Refreshing(refresh) => Some(refresh.clone()),
                Slot::Ready(_) | Slot::Empty => None,
            };
            let refresh = match in_flight {
                Some(refresh) => refresh,
                None => {
                    let refresh = self.start_refresh();
                    state.slot = Slot::Refreshing(refresh.clone());
                    refresh
                }
            };
            (refresh, state.epoch)
        };

        let result = refresh.await;

        let mut state = self.state.lock();
        if state.epoch == epoch && matches!(state.slot, Slot::Refreshing(_)) {
            state.slot = match &result {
                Ok(credential) => Slot::Ready(credential.clone()),
                Err(_) => Slot::Empty,
            };
        }
        result
    }

    fn start_refresh(&self) -> RefreshFuture {
        let source = self.source.clone();
        let model = self.model.clone();
        let attempt = self.fetches.fetch_add(1, Ordering::Relaxed) + 1;
        info!(model = %model, attempt, "Refreshing access credential");

        async move {
            let result = source.fetch(&model).await;
            match &result {
                Ok(credential) => debug!(model = %credential.model, expires_at = %credential.expires_at, "Credential issued"),
                Err(e) => warn!(model = %model, error = %e, "Credential refresh failed"),
            }
            result
        }
        .instrument(credential_refresh_span(&self.model, attempt))
        .boxed()
        .shared()
    }

    /// Drop the cached credential so the next call fetches a new one.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        state.slot = Slot::Empty;
        state.epoch += 1;
        debug!(model = %self.model, "Credential cache cleared");
    }

    /// The cached credential, if any, regardless of freshness.
    pub fn cached(&self) -> Option<Credential> {
        match &self.state.lock().slot {
            Slot::Ready(credential) => Some(credential.clone()),
            _ => None,
        }
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("model", &self.model)
            .field("margin", &self.margin)
            .field("cached", &self.cached())
            .finish()
    }
}
