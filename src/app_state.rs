// =============================================================================
// AppState — wired engine subsystems shared across tasks
// =============================================================================
//
// Built once at startup and handed around as an `Arc`. Everything here is
// cheap to clone through the outer Arc; the subsystems synchronise
// internally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::alerts::{Alert, AlertChannel, AlertDispatcher};
use crate::alerts::dispatcher::DispatcherStats;
use crate::composite::{CompositeScorer, CompositeSignal, ScoreInputs};
use crate::config::EngineConfig;
use crate::detect::{
    LearnedClassifier, LogisticSequenceScorer, PatternCandidate, PatternDetector, RuleEngine,
    SequenceScorer,
};
use crate::error::SignalError;
use crate::fusion::FusionEngine;
use crate::gateway::provider::{CandleProvider, RestCandleProvider};
use crate::gateway::{ProviderGateway, ProviderHealthSnapshot};
use crate::learner::IncrementalLearner;
use crate::market_data::CandleKey;
use crate::model::{ModelStore, ModelVersion};
use crate::outcome::OutcomeLabeler;
use crate::sentiment::{RestSentimentSource, SentimentAggregator, SentimentSource};
use crate::store::{AlertFilter, AlertRepo, DetectionLog, MemoryStore};
use crate::timing::{TimingAdvice, TimingAgent};

/// Fully scored per-symbol pipeline output, before dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub signal: CompositeSignal,
    /// Feature window captured at scoring time, carried onto the alert.
    pub features: Vec<f64>,
}

/// Aggregate operational snapshot for the health log line.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub uptime_secs: i64,
    pub providers: Vec<ProviderHealthSnapshot>,
    pub dispatcher: DispatcherStats,
    pub model_versions: Vec<ModelVersion>,
    pub timing_states: usize,
    pub alerts: usize,
    pub outcomes: usize,
}

pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub gateway: Arc<ProviderGateway>,
    pub detector: Arc<PatternDetector>,
    pub fusion: Arc<FusionEngine>,
    pub sentiment: Arc<SentimentAggregator>,
    pub scorer: Arc<CompositeScorer>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub store: Arc<MemoryStore>,
    pub model_store: Arc<ModelStore>,
    pub sequence_scorer: Arc<dyn SequenceScorer>,
    pub timing: Arc<TimingAgent>,
    pub labeler: Arc<OutcomeLabeler>,
    pub learner: Arc<IncrementalLearner>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the engine from config, building REST providers and sentiment
    /// sources from the configured endpoints.
    pub fn build(config: EngineConfig, channels: Vec<Arc<dyn AlertChannel>>) -> Arc<Self> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let providers: Vec<Arc<dyn CandleProvider>> = config
            .providers
            .iter()
            .map(|p| {
                Arc::new(RestCandleProvider::new(
                    p.name.clone(),
                    p.base_url.clone(),
                    timeout,
                )) as Arc<dyn CandleProvider>
            })
            .collect();

        let sources: Vec<Arc<dyn SentimentSource>> = config
            .sentiment_endpoints
            .iter()
            .map(|s| {
                Arc::new(RestSentimentSource::new(&s.name, &s.base_url, s.weight))
                    as Arc<dyn SentimentSource>
            })
            .collect();

        Self::build_with(config, providers, sources, channels)
    }

    /// Wire the engine with explicit providers and sentiment sources.
    pub fn build_with(
        config: EngineConfig,
        providers: Vec<Arc<dyn CandleProvider>>,
        sources: Vec<Arc<dyn SentimentSource>>,
        channels: Vec<Arc<dyn AlertChannel>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let model_store = Arc::new(ModelStore::new());
        let timing = Arc::new(TimingAgent::new(config.learning_rate));

        let gateway = Arc::new(ProviderGateway::new(
            providers,
            config.freshness_secs,
            Duration::from_secs(config.fetch_timeout_secs),
            config.provider_failure_threshold,
            config.provider_cooldown_secs,
        ));

        let sequence_scorer: Arc<LogisticSequenceScorer> = Arc::new(LogisticSequenceScorer::new(
            model_store.clone(),
            format!("seq{}", config.learned_window),
            config.learned_window,
        ));

        let detector = Arc::new(PatternDetector::new(
            vec![
                Arc::new(RuleEngine::new(config.detector_min_candles)),
                Arc::new(LearnedClassifier::new(
                    sequence_scorer.clone(),
                    config.learned_gate,
                )),
            ],
            store.clone() as Arc<dyn DetectionLog>,
        ));

        let fusion = Arc::new(FusionEngine::new(
            gateway.clone(),
            detector.clone(),
            config.clone(),
        ));
        let sentiment = Arc::new(SentimentAggregator::new(sources, config.sentiment_ttl_secs));
        let scorer = Arc::new(CompositeScorer::new(&config));
        let dispatcher = Arc::new(AlertDispatcher::new(channels, store.clone(), &config));
        let labeler = Arc::new(OutcomeLabeler::new(
            gateway.clone(),
            store.clone(),
            store.clone(),
            config.clone(),
        ));
        let learner = Arc::new(IncrementalLearner::new(
            store.clone(),
            model_store.clone(),
            timing.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            config,
            gateway,
            detector,
            fusion,
            sentiment,
            scorer,
            dispatcher,
            store,
            model_store,
            sequence_scorer,
            timing,
            labeler,
            learner,
            started_at: Utc::now(),
        })
    }

    /// Full pipeline for one symbol: fusion, learned validation, sentiment,
    /// composite. `Ok(None)` when no pattern candidate surfaced.
    pub async fn evaluate(&self, symbol: &str) -> Result<Option<Evaluation>, SignalError> {
        let fusion = self.fusion.analyze(symbol).await?;

        let Some(primary) = fusion.signal.primary.clone() else {
            return Ok(None);
        };

        let validation = self
            .sequence_scorer
            .score(&fusion.context_candles)
            .get(&primary.pattern_name)
            .copied();
        let features = self.sequence_scorer.features(&fusion.context_candles);

        let sentiment = self.sentiment.get(symbol).await;

        let signal = self.scorer.score(&ScoreInputs {
            primary: &primary,
            validation,
            sentiment: &sentiment,
            fused: &fusion.signal,
            context_candles: &fusion.context_candles,
        });

        Ok(Some(Evaluation { signal, features }))
    }

    // ── Inbound interface, consumed by the web tier (separate service) ───

    /// One-off detection pass for a single series, outside the scan cycle.
    pub async fn detect_on_demand(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<PatternCandidate>, SignalError> {
        let candles = self
            .gateway
            .fetch(symbol, timeframe, self.config.lookback)
            .await?;
        let key = CandleKey::new(symbol, timeframe);
        Ok(self.detector.detect(&key, &candles))
    }

    /// Timing advice from the current feature window of a symbol.
    pub async fn timing_advice(&self, symbol: &str) -> Result<TimingAdvice, SignalError> {
        let candles = self
            .gateway
            .fetch(symbol, &self.config.label_timeframe, self.config.lookback)
            .await?;
        let features = self.sequence_scorer.features(&candles);
        Ok(self.timing.advise(&features))
    }

    pub fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.store.list_alerts(filter)
    }

    pub fn dismiss_alert(&self, id: Uuid) -> bool {
        self.dispatcher.dismiss(id)
    }

    pub fn pattern_catalogue(&self) -> Vec<&'static str> {
        self.detector.catalogue()
    }

    pub fn recent_detections(&self, limit: usize) -> Vec<PatternCandidate> {
        self.store.recent_detections(limit)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            providers: self.gateway.health_snapshot(),
            dispatcher: self.dispatcher.stats(),
            model_versions: self.model_store.history(),
            timing_states: self.timing.known_states(),
            alerts: self.store.alert_count(),
            outcomes: self.store.outcome_count(),
        }
    }
}
