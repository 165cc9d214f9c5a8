mod common;

use std::sync::Arc;

use serde_json::json;

use common::FakeLearner;
use vgc_selfplay::rl::coordinator::{CoordinatorError, PolicyPair, RlBattleCoordinator};
use vgc_selfplay::rl::learner_client::LearnerApi;
use vgc_selfplay::rl::rollout::{spawn_rollout_actor, RolloutCollector, RolloutHandle};
use vgc_selfplay::rl::state_tracker::Side;
use vgc_selfplay::rl::stats::{RunStats, SharedStats};
use vgc_selfplay::sim::request::ReceivedRequest;

fn roster(side: &str, fainted_actives: bool) -> serde_json::Value {
    let active_cond = if fainted_actives { "0 fnt" } else { "100/100" };
    json!([
        {"ident": format!("{side}: Flutter Mane"), "details": "Flutter Mane, L50", "condition": active_cond, "active": true},
        {"ident": format!("{side}: Incineroar"), "details": "Incineroar, L50, M", "condition": active_cond, "active": true},
        {"ident": format!("{side}: Rillaboom"), "details": "Rillaboom, L50, M", "condition": "100/100", "active": false},
        {"ident": format!("{side}: Urshifu"), "details": "Urshifu-Rapid-Strike, L50, M", "condition": "100/100", "active": false}
    ])
}

fn moves_request(side: &str) -> ReceivedRequest {
    let tackle = json!({"move": "Tackle", "id": "tackle", "target": "normal", "pp": 35});
    ReceivedRequest::from_value(json!({
        "active": [{"moves": [tackle.clone()]}, {"moves": [tackle]}],
        "side": {"name": side, "id": side, "pokemon": roster(side, false)},
        "rqid": 2
    }))
    .unwrap()
}

fn double_forced_switch(side: &str) -> ReceivedRequest {
    ReceivedRequest::from_value(json!({
        "forceSwitch": [true, true],
        "side": {"name": side, "id": side, "pokemon": roster(side, true)},
        "rqid": 5
    }))
    .unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    dumps: std::path::PathBuf,
    stats: SharedStats,
    rollout: RolloutHandle,
    coordinator: RlBattleCoordinator,
}

fn fixture(learner: Arc<FakeLearner>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let stats = RunStats::new("t", dir.path()).shared();
    let dumps = stats.lock().unwrap().dumps_dir().to_path_buf();
    let api: Arc<dyn LearnerApi> = learner;
    let rollout = spawn_rollout_actor(RolloutCollector::new(8, 1), api.clone(), Some(stats.clone()));
    let coordinator = RlBattleCoordinator::new(
        api,
        rollout.clone(),
        PolicyPair {
            p1_policy_id: "learner".to_string(),
            p2_policy_id: "snapshot:s1".to_string(),
        },
        Some(stats.clone()),
        "t-0",
    );
    Fixture {
        _dir: dir,
        dumps,
        stats,
        rollout,
        coordinator,
    }
}

#[tokio::test]
async fn duplicate_forced_switch_is_spread_over_bench() {
    let learner = Arc::new(FakeLearner::new());
    let mut fx = fixture(learner.clone());

    // The fake learner picks the lowest legal id on both sides: the same
    // bench slot twice.
    let choice = fx
        .coordinator
        .choose_for_request(Side::P2, &double_forced_switch("p2"), 3, Some(11))
        .await
        .unwrap();
    assert_eq!(choice, "switch 3, switch 4");

    let last = fx.coordinator.last_decision(Side::P2).unwrap();
    assert_ne!(last.chosen_action_left, last.chosen_action_right);
    assert_eq!(learner.policy_ids.lock().unwrap().as_slice(), ["snapshot:s1"]);
}

#[tokio::test]
async fn only_p1_decisions_enter_the_rollout() {
    let learner = Arc::new(FakeLearner::new());
    let mut fx = fixture(learner);

    let p2 = fx
        .coordinator
        .choose_for_request(Side::P2, &moves_request("p2"), 1, None)
        .await
        .unwrap();
    assert!(p2.starts_with("move 1"), "{p2}");
    assert_eq!(fx.rollout.len().await.unwrap(), 0);

    let p1 = fx
        .coordinator
        .choose_for_request(Side::P1, &moves_request("p1"), 1, None)
        .await
        .unwrap();
    assert_eq!(p1.split(", ").count(), 2, "{p1}");
    assert_eq!(fx.rollout.len().await.unwrap(), 1);

    fx.coordinator.finalize_battle(Some(Side::P1)).await.unwrap();
    assert_eq!(fx.stats.lock().unwrap().episodes_finished, 1);
    assert_eq!(fx.rollout.len().await.unwrap(), 1, "terminal reward lands on the buffered step");
}

#[tokio::test]
async fn act_http_error_writes_dump_and_propagates() {
    let learner = Arc::new(FakeLearner::failing_act(503));
    let mut fx = fixture(learner);

    let err = fx
        .coordinator
        .choose_for_request(Side::P1, &moves_request("p1"), 4, None)
        .await
        .unwrap_err();
    match &err {
        CoordinatorError::Learner(e) => assert_eq!(e.status(), Some(503)),
        other => panic!("unexpected error: {other}"),
    }

    let dump_path = fx.dumps.join("t-0_turn4_ppo_act_http_error.json");
    let dump: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&dump_path).unwrap()).unwrap();
    assert_eq!(dump["reason"], "ppo_act_http_error");
    assert_eq!(dump["http_status"], 503);
    assert_eq!(dump["response_body_snippet"], "boom");
    assert_eq!(dump["request_id"], "t-0:4:p1");
    assert_eq!(fx.stats.lock().unwrap().ppo_act_http_error_count, 1);
    assert_eq!(fx.rollout.len().await.unwrap(), 0, "failed act pushes nothing");
}
