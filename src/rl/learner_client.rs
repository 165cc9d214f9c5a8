//! HTTP client for the external learning service.
//!
//! The service owns the model, optimizer and snapshot storage; this side only
//! speaks its JSON contract. Callers go through [`LearnerApi`] so tests can
//! substitute an in-process fake.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rl::observation::PackedObservation;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type LearnerResult<T> = Result<T, LearnerError>;

pub const ACT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TRAIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

const BODY_SNIPPET_MAX: usize = 2000;

#[derive(Debug, Error)]
pub enum LearnerError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String, url: String },
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("decode error for {url}: {message}")]
    Decode { url: String, message: String },
}

impl LearnerError {
    pub fn status(&self) -> Option<u16> {
        match self {
            LearnerError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            LearnerError::Http { .. } => "http",
            LearnerError::Timeout { .. } => "timeout",
            LearnerError::Transport { .. } => "transport",
            LearnerError::Decode { .. } => "decode",
        }
    }
}

/// Truncate a response body to the snippet kept in errors and dumps.
pub fn truncate_body(text: &str) -> String {
    if text.chars().count() > BODY_SNIPPET_MAX {
        let head: String = text.chars().take(BODY_SNIPPET_MAX).collect();
        format!("{head}…")
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    /// `learner`, `snapshot:<id>` or `baseline`.
    pub policy_id: String,
    pub obs: PackedObservation,
    pub mask_left: Vec<u8>,
    pub mask_right: Vec<u8>,
    pub sample: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActResponse {
    pub a_left: usize,
    pub a_right: usize,
    /// Sum of left and right log-probabilities.
    pub logp: f64,
    pub value: f64,
}

/// Column-major rollout batch, plus the bootstrap observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutBatch {
    pub obs: Vec<PackedObservation>,
    pub mask_left: Vec<Vec<u8>>,
    pub mask_right: Vec<Vec<u8>>,
    pub a_left: Vec<usize>,
    pub a_right: Vec<usize>,
    pub old_logp: Vec<f64>,
    pub old_value: Vec<f64>,
    pub reward: Vec<f64>,
    pub done: Vec<u8>,
    pub last_obs: Option<PackedObservation>,
    pub last_done: u8,
}

impl RolloutBatch {
    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub rollout: RolloutBatch,
}

/// Loss metrics nested under `metrics` by older service versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyTrainMetrics {
    pub policy_loss: Option<f64>,
    pub value_loss: Option<f64>,
    pub entropy: Option<f64>,
    pub approx_kl: Option<f64>,
    pub clipfrac: Option<f64>,
    pub adv_mean: Option<f64>,
    pub adv_std: Option<f64>,
    pub grad_norm: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainResponse {
    #[serde(default)]
    pub update_step: u64,
    #[serde(default)]
    pub samples: Option<u64>,
    #[serde(default)]
    pub policy_loss: Option<f64>,
    #[serde(default)]
    pub value_loss: Option<f64>,
    #[serde(default)]
    pub entropy: Option<f64>,
    #[serde(default)]
    pub approx_kl: Option<f64>,
    #[serde(default)]
    pub clipfrac: Option<f64>,
    #[serde(default)]
    pub adv_mean: Option<f64>,
    #[serde(default)]
    pub adv_std: Option<f64>,
    #[serde(default)]
    pub grad_norm: Option<f64>,
    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub n_steps: Option<u64>,
    #[serde(default)]
    pub metrics: Option<LegacyTrainMetrics>,
}

/// Flat metrics with top-level fields preferred over the legacy nesting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    pub approx_kl: f64,
    pub clipfrac: f64,
    pub adv_mean: f64,
    pub adv_std: f64,
    pub grad_norm: f64,
}

impl TrainResponse {
    pub fn sample_count(&self) -> u64 {
        self.samples.or(self.n_steps).unwrap_or(0)
    }

    pub fn resolved_metrics(&self) -> TrainMetrics {
        let legacy = self.metrics.clone().unwrap_or_default();
        let pick = |top: Option<f64>, old: Option<f64>| top.or(old).unwrap_or(0.0);
        TrainMetrics {
            policy_loss: pick(self.policy_loss, legacy.policy_loss),
            value_loss: pick(self.value_loss, legacy.value_loss),
            entropy: pick(self.entropy, legacy.entropy),
            approx_kl: pick(self.approx_kl, legacy.approx_kl),
            clipfrac: pick(self.clipfrac, legacy.clipfrac),
            adv_mean: pick(self.adv_mean, legacy.adv_mean),
            adv_std: pick(self.adv_std, legacy.adv_std),
            grad_norm: pick(self.grad_norm, legacy.grad_norm),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SnapshotListResponse {
    #[serde(default)]
    snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SnapshotSaveResponse {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SnapshotLoadResponse {
    #[serde(default)]
    ok: bool,
}

// ---------------------------------------------------------------------------
// Trait + HTTP implementation
// ---------------------------------------------------------------------------

pub trait LearnerApi: Send + Sync {
    fn act(&self, req: ActRequest) -> BoxFuture<'_, LearnerResult<ActResponse>>;
    fn train(&self, req: TrainRequest) -> BoxFuture<'_, LearnerResult<TrainResponse>>;
    fn list_snapshots(&self) -> BoxFuture<'_, LearnerResult<Vec<SnapshotInfo>>>;
    fn save_snapshot(&self, tag: String) -> BoxFuture<'_, LearnerResult<String>>;
    fn load_snapshot(&self, id: String) -> BoxFuture<'_, LearnerResult<bool>>;
}

#[derive(Debug, Clone)]
pub struct LearnerClient {
    base_url: String,
    http: reqwest::Client,
}

impl LearnerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: String,
        timeout: Duration,
    ) -> LearnerResult<T> {
        let resp = request.timeout(timeout).send().await.map_err(|err| {
            if err.is_timeout() {
                LearnerError::Timeout {
                    url: url.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                LearnerError::Transport {
                    url: url.clone(),
                    message: err.to_string(),
                }
            }
        })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|err| LearnerError::Transport {
            url: url.clone(),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(LearnerError::Http {
                status: status.as_u16(),
                body: truncate_body(&body),
                url,
            });
        }
        serde_json::from_str(&body).map_err(|err| LearnerError::Decode {
            url,
            message: err.to_string(),
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> LearnerResult<T> {
        let url = self.url(path);
        let request = self.http.post(&url).json(body);
        self.send_json(request, url, timeout).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, timeout: Duration) -> LearnerResult<T> {
        let url = self.url(path);
        let request = self.http.get(&url);
        self.send_json(request, url, timeout).await
    }
}

impl LearnerApi for LearnerClient {
    fn act(&self, req: ActRequest) -> BoxFuture<'_, LearnerResult<ActResponse>> {
        Box::pin(async move { self.post("/act", &req, ACT_TIMEOUT).await })
    }

    fn train(&self, req: TrainRequest) -> BoxFuture<'_, LearnerResult<TrainResponse>> {
        Box::pin(async move { self.post("/train", &req, TRAIN_TIMEOUT).await })
    }

    fn list_snapshots(&self) -> BoxFuture<'_, LearnerResult<Vec<SnapshotInfo>>> {
        Box::pin(async move {
            let resp: SnapshotListResponse = self.get("/snapshot/list", SNAPSHOT_TIMEOUT).await?;
            Ok(resp.snapshots)
        })
    }

    fn save_snapshot(&self, tag: String) -> BoxFuture<'_, LearnerResult<String>> {
        Box::pin(async move {
            let body = serde_json::json!({ "tag": tag });
            let resp: SnapshotSaveResponse = self.post("/snapshot/save", &body, SNAPSHOT_TIMEOUT).await?;
            Ok(resp.id.trim().to_string())
        })
    }

    fn load_snapshot(&self, id: String) -> BoxFuture<'_, LearnerResult<bool>> {
        Box::pin(async move {
            let body = serde_json::json!({ "id": id });
            let resp: SnapshotLoadResponse = self.post("/snapshot/load", &body, SNAPSHOT_TIMEOUT).await?;
            Ok(resp.ok)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body() {
        let short = "bad request";
        assert_eq!(truncate_body(short), short);
        let long = "x".repeat(2500);
        let t = truncate_body(&long);
        assert_eq!(t.chars().count(), 2001);
        assert!(t.ends_with('…'));
    }

    #[test]
    fn test_train_response_prefers_top_level_metrics() {
        let resp: TrainResponse = serde_json::from_value(serde_json::json!({
            "update_step": 4,
            "entropy": 1.5,
            "n_steps": 64,
            "metrics": {"entropy": 9.0, "approx_kl": 0.02}
        }))
        .unwrap();
        let m = resp.resolved_metrics();
        assert_eq!(resp.update_step, 4);
        assert_eq!(resp.sample_count(), 64);
        assert_eq!(m.entropy, 1.5);
        assert_eq!(m.approx_kl, 0.02);
        assert_eq!(m.clipfrac, 0.0);
    }

    #[test]
    fn test_act_request_omits_missing_optionals() {
        let req = ActRequest {
            request_id: None,
            battle_id: None,
            turn: None,
            side: None,
            policy_id: "learner".to_string(),
            obs: crate::rl::observation::pack_observation(
                &crate::rl::state_tracker::BattleStateTracker::new(),
            ),
            mask_left: vec![1],
            mask_right: vec![1],
            sample: true,
            seed: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("seed").is_none());
        assert!(v.get("request_id").is_none());
        assert_eq!(v["policy_id"], "learner");
    }

    #[test]
    fn test_error_accessors() {
        let e = LearnerError::Http {
            status: 500,
            body: "boom".into(),
            url: "http://x/act".into(),
        };
        assert_eq!(e.status(), Some(500));
        assert_eq!(e.to_string(), "HTTP 500: boom");
        assert_eq!(e.kind_label(), "http");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        // Port 9 (discard) on localhost is essentially never listening.
        let client = LearnerClient::new("http://127.0.0.1:9/");
        let err = client.list_snapshots().await.unwrap_err();
        assert!(
            matches!(err, LearnerError::Transport { .. } | LearnerError::Timeout { .. }),
            "unexpected {err:?}"
        );
    }
}
