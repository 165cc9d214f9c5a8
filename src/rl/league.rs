// src/rl/league.rs
//
// Opponent sampling over the learning service's snapshot history.
//
// Mix: 50% mirror (current learner), 40% stratified historical snapshot,
// 10% baseline. The random stream is a seeded xorshift32 so a given seed and
// cache always yield the same opponent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::rl::learner_client::{LearnerApi, SnapshotInfo};

pub const LEARNER_POLICY_ID: &str = "learner";
pub const BASELINE_POLICY_ID: &str = "baseline";
pub const SNAPSHOT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Seeded xorshift32 yielding floats in [0, 1).
#[derive(Debug, Clone)]
pub struct XorShift32 {
    x: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        Self {
            x: if seed == 0 { 0x1234_5678 } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.x;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.x = x;
        x
    }

    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / 4_294_967_296.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeagueSample {
    Learner,
    Snapshot { snapshot_id: String },
    Baseline,
}

impl LeagueSample {
    pub fn policy_id(&self) -> String {
        match self {
            LeagueSample::Learner => LEARNER_POLICY_ID.to_string(),
            LeagueSample::Snapshot { snapshot_id } => format!("snapshot:{snapshot_id}"),
            LeagueSample::Baseline => BASELINE_POLICY_ID.to_string(),
        }
    }
}

/// Recent / mid / old thirds, empty buckets dropped.
fn stratified_pick<'a>(snapshots: &'a [SnapshotInfo], rng: &mut XorShift32) -> Option<&'a SnapshotInfo> {
    let n = snapshots.len();
    if n == 0 {
        return None;
    }
    let thirds = (n / 3).max(1);
    let recent = &snapshots[n.saturating_sub(thirds)..];
    let mid = &snapshots[n.saturating_sub(2 * thirds)..n.saturating_sub(thirds)];
    let old = &snapshots[..n.saturating_sub(2 * thirds)];
    let buckets: Vec<&[SnapshotInfo]> = [recent, mid, old]
        .into_iter()
        .filter(|b| !b.is_empty())
        .collect();

    let bi = (rng.next_f64() * buckets.len() as f64).floor() as usize;
    let bucket = buckets.get(bi).copied().unwrap_or(snapshots);
    let ei = (rng.next_f64() * bucket.len() as f64).floor() as usize;
    bucket.get(ei).or_else(|| snapshots.last())
}

/// Snapshot cache plus sampler. Owned by the run loop.
pub struct LeagueManager {
    client: Arc<dyn LearnerApi>,
    cached: Vec<SnapshotInfo>,
    last_fetch: Option<Instant>,
}

impl LeagueManager {
    pub fn new(client: Arc<dyn LearnerApi>) -> Self {
        Self {
            client,
            cached: Vec::new(),
            last_fetch: None,
        }
    }

    pub fn cached(&self) -> &[SnapshotInfo] {
        &self.cached
    }

    /// Replace the cache, normalizing order and dropping blank ids.
    pub fn set_cache(&mut self, mut snapshots: Vec<SnapshotInfo>) {
        snapshots.retain(|s| !s.id.trim().is_empty());
        snapshots.sort_by(|a, b| a.step.cmp(&b.step).then_with(|| a.id.cmp(&b.id)));
        self.cached = snapshots;
    }

    pub async fn refresh_snapshots(&mut self) {
        self.refresh_snapshots_with_interval(SNAPSHOT_REFRESH_INTERVAL).await;
    }

    /// Fetch the snapshot list unless the last attempt was within
    /// `min_interval`. Failures keep the previous cache.
    pub async fn refresh_snapshots_with_interval(&mut self, min_interval: Duration) {
        let now = Instant::now();
        if let Some(last) = self.last_fetch {
            if now.duration_since(last) < min_interval {
                return;
            }
        }
        self.last_fetch = Some(now);
        match self.client.list_snapshots().await {
            Ok(snaps) => {
                self.set_cache(snaps);
                debug!(snapshots = self.cached.len(), "league snapshot cache refreshed");
            }
            Err(err) => {
                warn!(error = %err, cached = self.cached.len(), "league snapshot refresh failed; keeping cache");
            }
        }
    }

    pub fn sample_opponent(&self, seed: u32) -> LeagueSample {
        let mut rng = XorShift32::new(seed);
        let r = rng.next_f64();
        if r < 0.5 {
            return LeagueSample::Learner;
        }
        if r < 0.9 {
            return match stratified_pick(&self.cached, &mut rng) {
                Some(snap) => LeagueSample::Snapshot {
                    snapshot_id: snap.id.clone(),
                },
                None => LeagueSample::Learner,
            };
        }
        LeagueSample::Baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::learner_client::{
        ActRequest, ActResponse, BoxFuture, LearnerError, LearnerResult, TrainRequest, TrainResponse,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ListOnly {
        calls: AtomicUsize,
        reply: Mutex<Option<Vec<SnapshotInfo>>>,
    }

    impl LearnerApi for ListOnly {
        fn act(&self, _req: ActRequest) -> BoxFuture<'_, LearnerResult<ActResponse>> {
            Box::pin(async { Err(unsupported()) })
        }
        fn train(&self, _req: TrainRequest) -> BoxFuture<'_, LearnerResult<TrainResponse>> {
            Box::pin(async { Err(unsupported()) })
        }
        fn list_snapshots(&self) -> BoxFuture<'_, LearnerResult<Vec<SnapshotInfo>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.lock().unwrap().clone();
            Box::pin(async move {
                reply.ok_or(LearnerError::Transport {
                    url: "fake".into(),
                    message: "down".into(),
                })
            })
        }
        fn save_snapshot(&self, _tag: String) -> BoxFuture<'_, LearnerResult<String>> {
            Box::pin(async { Err(unsupported()) })
        }
        fn load_snapshot(&self, _id: String) -> BoxFuture<'_, LearnerResult<bool>> {
            Box::pin(async { Err(unsupported()) })
        }
    }

    fn unsupported() -> LearnerError {
        LearnerError::Transport {
            url: "fake".into(),
            message: "unsupported".into(),
        }
    }

    fn snap(id: &str, step: u64) -> SnapshotInfo {
        SnapshotInfo {
            id: id.to_string(),
            step,
            path: None,
        }
    }

    fn manager(reply: Option<Vec<SnapshotInfo>>) -> (LeagueManager, Arc<ListOnly>) {
        let fake = Arc::new(ListOnly {
            calls: AtomicUsize::new(0),
            reply: Mutex::new(reply),
        });
        (LeagueManager::new(fake.clone()), fake)
    }

    #[test]
    fn test_xorshift_reference_sequence() {
        let mut rng = XorShift32::new(1);
        assert_eq!(rng.next_u32(), 270_369);
        assert_eq!(rng.next_u32(), 67_634_689);
        let mut zero = XorShift32::new(0);
        let mut fixed = XorShift32::new(0x1234_5678);
        assert_eq!(zero.next_u32(), fixed.next_u32(), "seed 0 maps to the fixed seed");
    }

    #[test]
    fn test_sample_is_stable_for_same_seed_and_cache() {
        let (mut m, _) = manager(None);
        m.set_cache((0..9).map(|i| snap(&format!("s{i}"), i)).collect());
        for seed in [1u32, 7, 42, 1234, 99_999] {
            assert_eq!(m.sample_opponent(seed), m.sample_opponent(seed));
        }
    }

    #[test]
    fn test_empty_cache_never_yields_snapshot() {
        let (m, _) = manager(None);
        for i in 1..500u32 {
            let seed = i.wrapping_mul(2_654_435_761);
            assert!(!matches!(m.sample_opponent(seed), LeagueSample::Snapshot { .. }));
        }
    }

    #[test]
    fn test_sample_mix_covers_all_kinds() {
        let (mut m, _) = manager(None);
        m.set_cache(vec![snap("a", 1), snap("b", 2), snap("c", 3)]);
        let mut kinds = [0usize; 3];
        for i in 1..2000u32 {
            // Small seeds give small first draws; spread them over u32.
            let seed = i.wrapping_mul(2_654_435_761);
            match m.sample_opponent(seed) {
                LeagueSample::Learner => kinds[0] += 1,
                LeagueSample::Snapshot { .. } => kinds[1] += 1,
                LeagueSample::Baseline => kinds[2] += 1,
            }
        }
        assert!(kinds.iter().all(|k| *k > 0), "mix {kinds:?}");
        assert!(kinds[0] > kinds[2], "learner should dominate baseline: {kinds:?}");
    }

    #[test]
    fn test_set_cache_sorts_and_drops_blank_ids() {
        let (mut m, _) = manager(None);
        m.set_cache(vec![snap("b", 2), snap(" ", 1), snap("a", 2), snap("z", 1)]);
        let ids: Vec<&str> = m.cached().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_policy_ids() {
        assert_eq!(LeagueSample::Learner.policy_id(), "learner");
        assert_eq!(LeagueSample::Baseline.policy_id(), "baseline");
        let s = LeagueSample::Snapshot {
            snapshot_id: "abc".into(),
        };
        assert_eq!(s.policy_id(), "snapshot:abc");
    }

    #[tokio::test]
    async fn test_refresh_is_throttled_and_keeps_cache_on_error() {
        let (mut m, fake) = manager(Some(vec![snap("a", 1)]));
        m.refresh_snapshots().await;
        m.refresh_snapshots().await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1, "second refresh within 5s is skipped");
        assert_eq!(m.cached().len(), 1);

        *fake.reply.lock().unwrap() = None;
        m.refresh_snapshots_with_interval(Duration::ZERO).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.cached().len(), 1, "failed refresh keeps the old cache");
    }
}
