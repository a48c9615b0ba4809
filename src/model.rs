// =============================================================================
// Model store — versioned per-pattern classifier weights with atomic promotion
// =============================================================================
//
// The learner trains candidate snapshots offline and promotes them here. The
// detection hot path only ever reads the active snapshot for a namespace, a
// cheap `Arc` clone under a short read lock. Promotion swaps the active
// snapshot atomically and retires the previous one; at most one snapshot per
// namespace is ever Active.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle stage of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    Candidate,
    Active,
    Retired,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate => write!(f, "candidate"),
            Self::Active => write!(f, "active"),
            Self::Retired => write!(f, "retired"),
        }
    }
}

/// Bookkeeping record for one trained version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub namespace: String,
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    /// Rolling validation accuracy at promotion time.
    pub metric: f64,
    pub status: ModelStatus,
}

/// Logistic weights for a single pattern head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternHead {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl PatternHead {
    pub fn zeros(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            bias: 0.0,
        }
    }

    /// Probability in (0, 1) for a feature vector. Mismatched dimensions
    /// contribute nothing beyond the shared prefix.
    pub fn predict(&self, features: &[f64]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// One complete trained model: a set of pattern heads sharing a feature
/// layout, tagged with its version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: ModelVersion,
    pub feature_dim: usize,
    pub heads: HashMap<String, PatternHead>,
}

impl ModelSnapshot {
    /// Per-pattern probabilities for a feature vector.
    pub fn predict_all(&self, features: &[f64]) -> HashMap<String, f64> {
        self.heads
            .iter()
            .map(|(name, head)| (name.clone(), head.predict(features)))
            .collect()
    }
}

/// In-memory registry of active snapshots and the version history.
#[derive(Default)]
pub struct ModelStore {
    active: RwLock<HashMap<String, Arc<ModelSnapshot>>>,
    versions: RwLock<Vec<ModelVersion>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active snapshot for a namespace, if one has been promoted.
    pub fn active(&self, namespace: &str) -> Option<Arc<ModelSnapshot>> {
        self.active.read().get(namespace).cloned()
    }

    /// Next version number for a namespace (monotonic across promotions).
    pub fn next_version(&self, namespace: &str) -> u64 {
        self.versions
            .read()
            .iter()
            .filter(|v| v.namespace == namespace)
            .map(|v| v.version)
            .max()
            .map_or(1, |v| v + 1)
    }

    /// Promote a snapshot to Active for its namespace. The previous active
    /// version, if any, is marked Retired in the same critical section.
    pub fn promote(&self, mut snapshot: ModelSnapshot) {
        snapshot.version.status = ModelStatus::Active;
        let namespace = snapshot.version.namespace.clone();
        let version = snapshot.version.version;
        let metric = snapshot.version.metric;

        {
            let mut versions = self.versions.write();
            for v in versions.iter_mut() {
                if v.namespace == namespace && v.status == ModelStatus::Active {
                    v.status = ModelStatus::Retired;
                }
            }
            versions.push(snapshot.version.clone());
        }
        self.active.write().insert(namespace.clone(), Arc::new(snapshot));

        info!(
            namespace = %namespace,
            version,
            metric = format!("{metric:.3}"),
            "model promoted to active"
        );
    }

    /// Full version history, newest last.
    pub fn history(&self) -> Vec<ModelVersion> {
        self.versions.read().clone()
    }
}
