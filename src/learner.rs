// =============================================================================
// Incremental learner — online logistic updates over the outcome journal
// =============================================================================
//
// Consumes labeled outcomes from the journal cursor in batches, applies one
// SGD step per sample to the candidate heads, and tracks a rolling accuracy
// over the most recent predictions (scored before each update, so the metric
// is honest about generalisation). When the candidate has seen enough samples
// and its rolling accuracy clears the promotion threshold, and it beats the
// currently active model, it is promoted through the model store. Every
// consumed outcome also replays into the timing agent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::model::{ModelSnapshot, ModelStatus, ModelStore, ModelVersion, PatternHead};
use crate::store::{OutcomeRepo, TradeOutcome};
use crate::timing::TimingAgent;

/// Rolling accuracy window length.
const METRIC_WINDOW: usize = 200;
/// Minimum scored predictions before the rolling metric is trusted.
const METRIC_MIN: usize = 20;

/// Required margin over the active model's recorded metric.
const PROMOTION_MARGIN: f64 = 0.01;

#[derive(Default)]
struct CandidateState {
    heads: HashMap<String, PatternHead>,
    recent: VecDeque<bool>,
    samples: usize,
}

impl CandidateState {
    fn metric(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().filter(|c| **c).count() as f64 / self.recent.len() as f64
    }
}

pub struct IncrementalLearner {
    outcomes: Arc<dyn OutcomeRepo>,
    model_store: Arc<ModelStore>,
    timing: Arc<TimingAgent>,
    config: Arc<EngineConfig>,
    namespace: String,
    cursor: Mutex<u64>,
    candidate: Mutex<CandidateState>,
}

impl IncrementalLearner {
    pub fn new(
        outcomes: Arc<dyn OutcomeRepo>,
        model_store: Arc<ModelStore>,
        timing: Arc<TimingAgent>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let namespace = format!("seq{}", config.learned_window);
        Self {
            outcomes,
            model_store,
            timing,
            config,
            namespace,
            cursor: Mutex::new(0),
            candidate: Mutex::new(CandidateState::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Periodic training loop. Drains all new outcomes each tick.
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.config.learner_interval_secs));
        loop {
            ticker.tick().await;
            let mut total = 0;
            loop {
                let processed = self.run_once();
                total += processed;
                if processed < self.config.learner_batch_size {
                    break;
                }
            }
            if total > 0 {
                info!(processed = total, "learner pass complete");
            }
        }
    }

    /// Consume up to one batch of new outcomes. Returns samples processed.
    pub fn run_once(&self) -> usize {
        let batch = {
            let cursor = *self.cursor.lock();
            let mut batch = self.outcomes.outcomes_since(cursor);
            batch.truncate(self.config.learner_batch_size);
            batch
        };
        if batch.is_empty() {
            return 0;
        }

        let mut candidate = self.candidate.lock();
        let mut last_seq = 0;
        let mut processed = 0;

        for (seq, outcome) in &batch {
            last_seq = *seq;
            if outcome.features.is_empty() {
                continue;
            }
            self.train_one(&mut candidate, outcome);
            self.timing.learn(outcome);
            processed += 1;
        }
        *self.cursor.lock() = last_seq;

        let metric = candidate.metric();
        debug!(
            processed,
            samples = candidate.samples,
            metric = format!("{metric:.3}"),
            "learner batch applied"
        );

        if self.should_promote(&candidate, metric) {
            self.promote(&candidate, metric);
        }
        processed
    }

    fn train_one(&self, candidate: &mut CandidateState, outcome: &TradeOutcome) {
        let dim = outcome.features.len();
        let head = candidate
            .heads
            .entry(outcome.pattern_name.clone())
            .or_insert_with(|| PatternHead::zeros(dim));

        // Score before updating so the rolling metric reflects held-out
        // behaviour, not memorisation of the sample just applied.
        let p = head.predict(&outcome.features);
        let correct = (p >= 0.5) == (outcome.label >= 0.5);
        if candidate.recent.len() >= METRIC_WINDOW {
            candidate.recent.pop_front();
        }
        candidate.recent.push_back(correct);

        let err = outcome.label - p;
        let lr = self.config.learning_rate;
        for (w, x) in head.weights.iter_mut().zip(&outcome.features) {
            *w += lr * err * x;
        }
        head.bias += lr * err;
        candidate.samples += 1;
    }

    fn should_promote(&self, candidate: &CandidateState, metric: f64) -> bool {
        if candidate.samples < self.config.promotion_min_samples
            || candidate.recent.len() < METRIC_MIN
            || metric < self.config.promotion_threshold
        {
            return false;
        }
        match self.model_store.active(&self.namespace) {
            Some(active) => metric > active.version.metric + PROMOTION_MARGIN,
            None => true,
        }
    }

    fn promote(&self, candidate: &CandidateState, metric: f64) {
        let feature_dim = candidate
            .heads
            .values()
            .map(|h| h.weights.len())
            .max()
            .unwrap_or(0);
        let snapshot = ModelSnapshot {
            version: ModelVersion {
                namespace: self.namespace.clone(),
                version: self.model_store.next_version(&self.namespace),
                trained_at: Utc::now(),
                metric,
                status: ModelStatus::Candidate,
            },
            feature_dim,
            heads: candidate.heads.clone(),
        };
        self.model_store.promote(snapshot);
    }
}
