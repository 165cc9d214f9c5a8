// Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vgc_selfplay::rl::learner_client::{
    ActRequest, ActResponse, BoxFuture, LearnerApi, LearnerError, LearnerResult, SnapshotInfo, TrainRequest,
    TrainResponse,
};
use vgc_selfplay::runner::EngineFactory;
use vgc_selfplay::sim::engine::BattleEngine;
use vgc_selfplay::sim::mock_engine::{ScriptConfig, ScriptedEngine};

/// In-process learner: picks the first legal action on each side and counts
/// train calls.
#[derive(Default)]
pub struct FakeLearner {
    pub act_calls: AtomicUsize,
    pub policy_ids: Mutex<Vec<String>>,
    pub train_batches: Mutex<Vec<usize>>,
    pub snapshots: Vec<SnapshotInfo>,
    pub fail_act_status: Option<u16>,
    pub fail_train: bool,
    update_step: AtomicU64,
}

impl FakeLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_act(status: u16) -> Self {
        Self {
            fail_act_status: Some(status),
            ..Self::default()
        }
    }

    pub fn failing_train() -> Self {
        Self {
            fail_train: true,
            ..Self::default()
        }
    }

    pub fn with_snapshots(ids: &[&str]) -> Self {
        Self {
            snapshots: ids
                .iter()
                .enumerate()
                .map(|(i, id)| SnapshotInfo {
                    id: id.to_string(),
                    step: i as u64,
                    path: None,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn trained(&self) -> Vec<usize> {
        self.train_batches.lock().unwrap().clone()
    }
}

fn first_legal(mask: &[u8]) -> usize {
    mask.iter().position(|m| *m == 1).unwrap_or(0)
}

impl LearnerApi for FakeLearner {
    fn act(&self, req: ActRequest) -> BoxFuture<'_, LearnerResult<ActResponse>> {
        Box::pin(async move {
            self.act_calls.fetch_add(1, Ordering::SeqCst);
            self.policy_ids.lock().unwrap().push(req.policy_id.clone());
            if let Some(status) = self.fail_act_status {
                return Err(LearnerError::Http {
                    status,
                    body: "boom".to_string(),
                    url: "http://fake/act".to_string(),
                });
            }
            Ok(ActResponse {
                a_left: first_legal(&req.mask_left),
                a_right: first_legal(&req.mask_right),
                logp: -1.0,
                value: 0.0,
            })
        })
    }

    fn train(&self, req: TrainRequest) -> BoxFuture<'_, LearnerResult<TrainResponse>> {
        Box::pin(async move {
            if self.fail_train {
                return Err(LearnerError::Http {
                    status: 500,
                    body: "train exploded".to_string(),
                    url: "http://fake/train".to_string(),
                });
            }
            let len = req.rollout.len();
            self.train_batches.lock().unwrap().push(len);
            let step = self.update_step.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TrainResponse {
                update_step: step,
                samples: Some(len as u64),
                ..TrainResponse::default()
            })
        })
    }

    fn list_snapshots(&self) -> BoxFuture<'_, LearnerResult<Vec<SnapshotInfo>>> {
        Box::pin(async move { Ok(self.snapshots.clone()) })
    }

    fn save_snapshot(&self, tag: String) -> BoxFuture<'_, LearnerResult<String>> {
        Box::pin(async move { Ok(format!("snap-{tag}")) })
    }

    fn load_snapshot(&self, _id: String) -> BoxFuture<'_, LearnerResult<bool>> {
        Box::pin(async move { Ok(true) })
    }
}

pub fn scripted_engines(config: ScriptConfig) -> EngineFactory {
    Arc::new(move || -> anyhow::Result<Box<dyn BattleEngine>> {
        Ok(Box::new(ScriptedEngine::new(config.clone())) as Box<dyn BattleEngine>)
    })
}

/// Non-empty lines of a JSONL file, parsed.
pub fn read_jsonl(path: &std::path::Path) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}
