//! # Stage: Learning Engine
//!
//! ## Responsibility
//! Correlates outcomes with the adjustments that preceded them. Maintains one
//! [`LearningPattern`] per (subject, module, knob, pattern type) and turns
//! well-sampled patterns into [`OptimizationSuggestion`]s. Maintenance also
//! pairs knobs whose patterns succeed close together in time into
//! [`CorrelationPattern`]s, and every stored suggestion seeds a neutral one.
//!
//! ## Guarantees
//! - At-most-once ingestion: an outcome id is only ever learned from once
//! - Monotone samples: `sample_size` never decreases
//! - Bounded: each pattern keeps at most `max_observations` observations
//! - Per-pattern serialization: updates to one pattern key hold its own lock;
//!   different keys proceed concurrently
//! - Suggestion lifecycle: `pending -> {applied, rejected, expired}`, terminal
//!   thereafter; a newer suggestion for the same knob expires the pending one
//! - Correlation windows are counted once: re-analysing an unchanged window
//!   does not add evidence
//!
//! ## NOT Responsible For
//! - Applying suggestions to the registry (orchestrator)
//! - Publishing recommendations (orchestrator pipeline)

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{TuneError, TuneResult};
use crate::now_ms;
use crate::tuning::registry::{KnobDescriptor, KnobKey, KnobRegistry, SubjectContext};
use crate::tuning::telemetry::{GameOutcome, TelemetryStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Patterns above this confidence count as high-confidence in metrics.
pub const HIGH_CONFIDENCE: f64 = 0.7;

/// Idle patterns below this confidence are eligible for deletion.
pub const LOW_CONFIDENCE: f64 = 0.3;

/// Ceiling on the confidence of a weighted-delta suggestion.
pub const MAX_SUGGESTION_CONFIDENCE: f64 = 0.95;

/// Confidence attached to an optimal-range suggestion.
pub const RANGE_SUGGESTION_CONFIDENCE: f64 = 0.75;

/// Minimum pattern success rate for its values to enter range analysis.
const RANGE_MIN_SUCCESS_RATE: f64 = 0.6;

/// Minimum average success of the best window for a range suggestion.
const RANGE_MIN_WINDOW_SUCCESS: f64 = 0.7;

/// Idle time at which decay bottoms out at 50%.
const DECAY_HORIZON_HOURS: f64 = 168.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Both patterns of a pair need a success rate above this to correlate.
pub const CORRELATION_MIN_SUCCESS_RATE: f64 = 0.7;

/// Correlation scores above this are strong.
pub const STRONG_CORRELATION: f64 = 0.8;

/// Score of a recommendation-seeded correlation until outcomes say otherwise.
const NEUTRAL_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// How far before an outcome an adjustment may be and still be credited.
    pub lookback: Duration,
    /// `k` in `n / (n + k)`.
    pub confidence_k: f64,
    pub max_observations: usize,
    /// Patterns need this many samples before they drive a suggestion.
    pub min_pattern_samples: u64,
    /// Idle time before a pattern's confidence starts decaying.
    pub decay_after: Duration,
    /// Idle low-confidence patterns older than this are deleted.
    pub pattern_retention: Duration,
    /// Pending suggestions older than this expire.
    pub suggestion_ttl: Duration,
    pub generation_deadline: Duration,
    /// Patterns updated within this span of a window's first pattern are
    /// analysed together for correlations.
    pub correlation_window: Duration,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(24 * 3600),
            confidence_k: 5.0,
            max_observations: 50,
            min_pattern_samples: 3,
            decay_after: Duration::from_secs(3600),
            pattern_retention: Duration::from_secs(7 * 24 * 3600),
            suggestion_ttl: Duration::from_secs(24 * 3600),
            generation_deadline: Duration::from_millis(250),
            correlation_window: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Class of an adjustment, by the sign of its delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Increase,
    Decrease,
    Hold,
}

impl PatternType {
    pub const ALL: [PatternType; 3] =
        [PatternType::Increase, PatternType::Decrease, PatternType::Hold];

    pub fn of_delta(delta: f64) -> Self {
        if delta > 0.0 {
            PatternType::Increase
        } else if delta < 0.0 {
            PatternType::Decrease
        } else {
            PatternType::Hold
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternType::Increase => "increase",
            PatternType::Decrease => "decrease",
            PatternType::Hold     => "hold",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey {
    pub subject_id: String,
    pub knob: KnobKey,
    pub pattern_type: PatternType,
}

/// One adjustment-outcome pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub adjustment_id: String,
    pub delta: f64,
    /// Knob value right after the adjustment.
    pub value_after: f64,
    pub adjustment_confidence: f64,
    pub context: SubjectContext,
    pub outcome_id: String,
    pub outcome_type: String,
    pub outcome_value: f64,
    pub success: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPattern {
    pub id: String,
    pub subject_id: String,
    pub module: String,
    pub knob: String,
    pub pattern_type: PatternType,
    pub observations: VecDeque<Observation>,
    pub sample_size: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub confidence: f64,
    pub created_at_ms: u64,
    pub last_updated_ms: u64,
    /// Sum of adjustment confidences over every sample, including evicted ones.
    #[serde(skip)]
    confidence_sum: f64,
}

impl LearningPattern {
    fn new(key: &PatternKey, now: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: key.subject_id.clone(),
            module: key.knob.module.clone(),
            knob: key.knob.knob.clone(),
            pattern_type: key.pattern_type,
            observations: VecDeque::new(),
            sample_size: 0,
            successes: 0,
            success_rate: 0.0,
            confidence: 0.0,
            created_at_ms: now,
            last_updated_ms: now,
            confidence_sum: 0.0,
        }
    }

    pub fn knob_key(&self) -> KnobKey {
        KnobKey::new(self.module.clone(), self.knob.clone())
    }

    /// Confidence derived from samples alone, before any idle decay.
    fn sampled_confidence(&self, k: f64) -> f64 {
        if self.sample_size == 0 {
            return 0.0;
        }
        let n = self.sample_size as f64;
        let mean_adjustment_confidence = self.confidence_sum / n;
        (n / (n + k) * mean_adjustment_confidence).clamp(0.0, 1.0)
    }

    fn observe(&mut self, obs: Observation, config: &LearningConfig, now: u64) {
        self.sample_size += 1;
        if obs.success {
            self.successes += 1;
        }
        self.confidence_sum += obs.adjustment_confidence;
        self.observations.push_back(obs);
        while self.observations.len() > config.max_observations.max(1) {
            self.observations.pop_front();
        }
        self.success_rate = self.successes as f64 / self.sample_size as f64;
        self.confidence = self.sampled_confidence(config.confidence_k);
        self.last_updated_ms = now;
    }

    fn successful_deltas(&self) -> impl Iterator<Item = f64> + '_ {
        self.observations.iter().filter(|o| o.success).map(|o| o.delta)
    }
}

// ---------------------------------------------------------------------------
// Correlations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStrength {
    Strong,
    Moderate,
    Neutral,
}

impl CorrelationStrength {
    pub fn of_score(score: f64) -> Self {
        if score > STRONG_CORRELATION {
            CorrelationStrength::Strong
        } else if score > CORRELATION_MIN_SUCCESS_RATE {
            CorrelationStrength::Moderate
        } else {
            CorrelationStrength::Neutral
        }
    }
}

/// What a correlation was learned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CorrelationEvidence {
    /// Patterns of both knobs succeeded inside the same analysis window.
    CoSuccess { windows: u64, last_window_start_ms: u64 },
    /// Seeded by a stored suggestion for a single knob.
    Recommendation { current_value: f64, suggested_value: f64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub subject_id: String,
    pub knob: KnobKey,
    /// `None` for a recommendation seed. For a pair, `knob < partner`.
    pub partner: Option<KnobKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPattern {
    pub id: String,
    pub subject_id: String,
    pub knob: KnobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<KnobKey>,
    /// Mean over windows of the weaker success rate of the pair.
    pub score: f64,
    pub confidence: f64,
    pub strength: CorrelationStrength,
    pub sample_size: u64,
    pub evidence: CorrelationEvidence,
    pub created_at_ms: u64,
    pub last_updated_ms: u64,
}

impl CorrelationPattern {
    fn new(
        key: &CorrelationKey,
        score: f64,
        confidence: f64,
        evidence: CorrelationEvidence,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: key.subject_id.clone(),
            knob: key.knob.clone(),
            partner: key.partner.clone(),
            score,
            confidence,
            strength: CorrelationStrength::of_score(score),
            sample_size: 1,
            evidence,
            created_at_ms: now,
            last_updated_ms: now,
        }
    }
}

/// The parts of a pattern correlation analysis reads.
#[derive(Debug, Clone)]
struct PatternSnapshot {
    knob: KnobKey,
    success_rate: f64,
    confidence: f64,
    last_updated_ms: u64,
}

/// Split patterns sorted by `last_updated_ms` into windows. A window opens at
/// its first pattern and takes every later one at most `span_ms` after it.
fn time_windows(sorted: &[PatternSnapshot], span_ms: u64) -> Vec<&[PatternSnapshot]> {
    let mut windows = Vec::new();
    let mut start = 0;
    for (i, p) in sorted.iter().enumerate() {
        if p.last_updated_ms.saturating_sub(sorted[start].last_updated_ms) > span_ms {
            windows.push(&sorted[start..i]);
            start = i;
        }
    }
    if start < sorted.len() {
        windows.push(&sorted[start..]);
    }
    windows
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Applied,
    Rejected,
    Expired,
}

impl SuggestionStatus {
    pub fn is_terminal(self) -> bool {
        self != SuggestionStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub id: String,
    pub subject_id: String,
    pub module: String,
    pub knob: String,
    pub current_value: f64,
    pub suggested_value: f64,
    pub reason: String,
    pub expected_improvement: f64,
    pub confidence: f64,
    pub pattern_ids: Vec<String>,
    pub status: SuggestionStatus,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    /// Generation hit its deadline before considering every pattern.
    pub partial: bool,
}

impl OptimizationSuggestion {
    pub fn key(&self) -> KnobKey {
        KnobKey::new(self.module.clone(), self.knob.clone())
    }

    /// Ranking score: `confidence × expected_improvement`.
    pub fn score(&self) -> f64 {
        self.confidence * self.expected_improvement
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub total_patterns: usize,
    pub correlation_patterns: usize,
    pub high_confidence_patterns: usize,
    pub pending_suggestions: usize,
    pub applied_suggestions: usize,
    pub rejected_suggestions: usize,
    pub expired_suggestions: usize,
    pub average_expected_improvement: f64,
    pub last_learning_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningCleanup {
    pub patterns_removed: usize,
    pub patterns_decayed: usize,
    pub suggestions_expired: usize,
    pub suggestions_removed: usize,
    /// Pairs that gained a new co-success window this sweep.
    pub correlations_recorded: usize,
    pub correlations_removed: usize,
}

// ---------------------------------------------------------------------------
// LearningEngine
// ---------------------------------------------------------------------------

pub struct LearningEngine {
    registry: Arc<KnobRegistry>,
    telemetry: Arc<TelemetryStore>,
    config: LearningConfig,
    patterns: RwLock<HashMap<PatternKey, Arc<Mutex<LearningPattern>>>>,
    /// Outcome id -> outcome timestamp, for at-most-once ingestion.
    ingested: Mutex<HashMap<String, u64>>,
    suggestions: Mutex<HashMap<String, Vec<OptimizationSuggestion>>>,
    correlations: Mutex<HashMap<CorrelationKey, CorrelationPattern>>,
    last_learning_ms: Mutex<Option<u64>>,
}

impl LearningEngine {
    pub fn new(
        registry: Arc<KnobRegistry>,
        telemetry: Arc<TelemetryStore>,
        config: LearningConfig,
    ) -> Self {
        Self {
            registry,
            telemetry,
            config,
            patterns: RwLock::new(HashMap::new()),
            ingested: Mutex::new(HashMap::new()),
            suggestions: Mutex::new(HashMap::new()),
            correlations: Mutex::new(HashMap::new()),
            last_learning_ms: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    // --- ingestion ---

    /// Learn from one outcome. Returns the knobs whose patterns changed.
    ///
    /// A repeated outcome id is ignored and returns an empty list.
    pub fn ingest_outcome(&self, outcome: &GameOutcome) -> TuneResult<Vec<KnobKey>> {
        // Every fallible lookup runs before the id is claimed, so a failed
        // ingestion can be retried.
        let context = self.registry.subject(&outcome.subject_id)?.context;
        let since = outcome.timestamp_ms.saturating_sub(self.config.lookback.as_millis() as u64);
        let mut credited = Vec::new();
        for key in &outcome.related_knobs {
            let adjustments = self.telemetry.adjustments_for(
                &outcome.subject_id,
                key,
                since,
                outcome.timestamp_ms,
            )?;
            if !adjustments.is_empty() {
                credited.push((key, adjustments));
            }
        }

        {
            let mut ingested =
                self.ingested.lock().map_err(|_| TuneError::poisoned("ingested outcomes"))?;
            if ingested.contains_key(&outcome.id) {
                return Ok(Vec::new());
            }
            ingested.insert(outcome.id.clone(), outcome.timestamp_ms);
        }

        let now = now_ms();
        let mut touched = Vec::new();
        for (key, adjustments) in credited {
            for adj in adjustments {
                let pattern_key = PatternKey {
                    subject_id: outcome.subject_id.clone(),
                    knob: key.clone(),
                    pattern_type: PatternType::of_delta(adj.delta()),
                };
                let cell = self.pattern_or_create(&pattern_key, now)?;
                let mut pattern = cell.lock().map_err(|_| TuneError::poisoned("learning pattern"))?;
                pattern.observe(
                    Observation {
                        adjustment_id: adj.id.clone(),
                        delta: adj.delta(),
                        value_after: adj.new_value,
                        adjustment_confidence: adj.confidence,
                        context: context.clone(),
                        outcome_id: outcome.id.clone(),
                        outcome_type: outcome.outcome_type.clone(),
                        outcome_value: outcome.value,
                        success: outcome.value > 0.0,
                        timestamp_ms: outcome.timestamp_ms,
                    },
                    &self.config,
                    now,
                );
            }
            touched.push(key.clone());
        }

        if !touched.is_empty() {
            if let Ok(mut last) = self.last_learning_ms.lock() {
                *last = Some(now);
            }
        }
        Ok(touched)
    }

    // --- suggestions ---

    /// Generate and store a suggestion for one knob, if the data supports one.
    pub fn generate_suggestion(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
    ) -> TuneResult<Option<OptimizationSuggestion>> {
        let deadline = Instant::now() + self.config.generation_deadline;
        let key = self.registry.schema().lookup(module, knob)?.key();
        self.generate_with_deadline(subject_id, &key, deadline)
    }

    /// As [`generate_suggestion`](Self::generate_suggestion), under a caller
    /// supplied deadline shared across several knobs.
    pub fn generate_with_deadline(
        &self,
        subject_id: &str,
        key: &KnobKey,
        deadline: Instant,
    ) -> TuneResult<Option<OptimizationSuggestion>> {
        let descriptor = self.registry.schema().lookup(&key.module, &key.knob)?.clone();
        let current = self.registry.value(subject_id, key)?;

        let mut partial = false;
        let mut patterns = Vec::new();
        for pattern_type in PatternType::ALL {
            if Instant::now() >= deadline {
                partial = true;
                break;
            }
            let pattern_key = PatternKey {
                subject_id: subject_id.to_string(),
                knob: key.clone(),
                pattern_type,
            };
            if let Some(cell) = self.pattern(&pattern_key)? {
                let pattern = cell.lock().map_err(|_| TuneError::poisoned("learning pattern"))?;
                patterns.push(pattern.clone());
            }
        }

        let eligible: Vec<&LearningPattern> = patterns
            .iter()
            .filter(|p| p.sample_size >= self.config.min_pattern_samples)
            .collect();

        let suggestion = weighted_delta_suggestion(subject_id, &descriptor, current, &eligible)
            .or_else(|| optimal_range_suggestion(subject_id, &descriptor, current, &eligible));
        let Some(mut suggestion) = suggestion else { return Ok(None) };
        suggestion.partial = partial;
        self.store_suggestion(suggestion.clone())?;
        Ok(Some(suggestion))
    }

    /// Every suggestion ever stored for a subject, oldest first.
    pub fn suggestions(&self, subject_id: &str) -> TuneResult<Vec<OptimizationSuggestion>> {
        let suggestions = self.suggestions.lock().map_err(|_| TuneError::poisoned("suggestions"))?;
        Ok(suggestions.get(subject_id).cloned().unwrap_or_default())
    }

    pub fn pending_suggestions(&self, subject_id: &str) -> TuneResult<Vec<OptimizationSuggestion>> {
        Ok(self
            .suggestions(subject_id)?
            .into_iter()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .collect())
    }

    pub fn suggestion(
        &self,
        subject_id: &str,
        suggestion_id: &str,
    ) -> TuneResult<OptimizationSuggestion> {
        self.suggestions(subject_id)?
            .into_iter()
            .find(|s| s.id == suggestion_id)
            .ok_or_else(|| suggestion_not_found(suggestion_id))
    }

    /// Move a pending suggestion to a terminal status.
    pub fn resolve_suggestion(
        &self,
        subject_id: &str,
        suggestion_id: &str,
        status: SuggestionStatus,
    ) -> TuneResult<OptimizationSuggestion> {
        if !status.is_terminal() {
            return Err(TuneError::InvalidValue(
                "a suggestion cannot be moved back to pending".into(),
            ));
        }
        let mut suggestions =
            self.suggestions.lock().map_err(|_| TuneError::poisoned("suggestions"))?;
        let suggestion = suggestions
            .get_mut(subject_id)
            .and_then(|list| list.iter_mut().find(|s| s.id == suggestion_id))
            .ok_or_else(|| suggestion_not_found(suggestion_id))?;
        if suggestion.status.is_terminal() {
            return Err(TuneError::InvalidValue(format!(
                "suggestion {suggestion_id} is already {:?}",
                suggestion.status
            )));
        }
        suggestion.status = status;
        suggestion.resolved_at_ms = Some(now_ms());
        Ok(suggestion.clone())
    }

    // --- projections ---

    /// All patterns of a subject, ordered by knob then pattern type.
    pub fn patterns(&self, subject_id: &str) -> TuneResult<Vec<LearningPattern>> {
        let cells: BTreeMap<PatternKey, Arc<Mutex<LearningPattern>>> = self
            .patterns
            .read()
            .map_err(|_| TuneError::poisoned("patterns"))?
            .iter()
            .filter(|(k, _)| k.subject_id == subject_id)
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        cells
            .values()
            .map(|cell| {
                cell.lock()
                    .map(|p| p.clone())
                    .map_err(|_| TuneError::poisoned("learning pattern"))
            })
            .collect()
    }

    /// Correlations of a subject ordered by knob. A knob's recommendation
    /// seed precedes the pairs it leads.
    pub fn correlation_patterns(&self, subject_id: &str) -> TuneResult<Vec<CorrelationPattern>> {
        let correlations =
            self.correlations.lock().map_err(|_| TuneError::poisoned("correlations"))?;
        let mut found: Vec<(&CorrelationKey, &CorrelationPattern)> =
            correlations.iter().filter(|(k, _)| k.subject_id == subject_id).collect();
        found.sort_by(|a, b| a.0.cmp(b.0));
        Ok(found.into_iter().map(|(_, p)| p.clone()).collect())
    }

    pub fn metrics(&self) -> LearningMetrics {
        let mut metrics = LearningMetrics::default();
        if let Ok(patterns) = self.patterns.read() {
            metrics.total_patterns = patterns.len();
            metrics.high_confidence_patterns = patterns
                .values()
                .filter_map(|cell| cell.lock().ok().map(|p| p.confidence))
                .filter(|&c| c > HIGH_CONFIDENCE)
                .count();
        }
        if let Ok(correlations) = self.correlations.lock() {
            metrics.correlation_patterns = correlations.len();
        }
        if let Ok(suggestions) = self.suggestions.lock() {
            let mut improvement_sum = 0.0;
            let mut count = 0usize;
            for s in suggestions.values().flatten() {
                match s.status {
                    SuggestionStatus::Pending => metrics.pending_suggestions += 1,
                    SuggestionStatus::Applied => metrics.applied_suggestions += 1,
                    SuggestionStatus::Rejected => metrics.rejected_suggestions += 1,
                    SuggestionStatus::Expired => metrics.expired_suggestions += 1,
                }
                improvement_sum += s.expected_improvement;
                count += 1;
            }
            if count > 0 {
                metrics.average_expected_improvement = improvement_sum / count as f64;
            }
        }
        metrics.last_learning_at_ms = self.last_learning_ms.lock().ok().and_then(|l| *l);
        metrics
    }

    // --- maintenance ---

    /// Decay idle patterns, drop stale ones, expire old suggestions and
    /// re-run correlation analysis.
    pub fn maintain(&self) -> TuneResult<LearningCleanup> {
        self.maintain_at(now_ms())
    }

    pub fn maintain_at(&self, now: u64) -> TuneResult<LearningCleanup> {
        let mut report = LearningCleanup::default();
        let decay_after = self.config.decay_after.as_millis() as u64;
        let retention = self.config.pattern_retention.as_millis() as u64;

        {
            let mut patterns = self.patterns.write().map_err(|_| TuneError::poisoned("patterns"))?;
            let mut doomed = Vec::new();
            for (key, cell) in patterns.iter() {
                let mut p = cell.lock().map_err(|_| TuneError::poisoned("learning pattern"))?;
                let idle = now.saturating_sub(p.last_updated_ms);
                if idle > decay_after {
                    let idle_hours = idle as f64 / MS_PER_HOUR;
                    let factor = (1.0 - idle_hours / DECAY_HORIZON_HOURS).max(0.5);
                    // Recomputed from samples so repeated sweeps do not compound.
                    p.confidence = p.sampled_confidence(self.config.confidence_k) * factor;
                    report.patterns_decayed += 1;
                }
                if idle > retention && p.confidence < LOW_CONFIDENCE {
                    doomed.push(key.clone());
                }
            }
            for key in doomed {
                patterns.remove(&key);
                report.patterns_removed += 1;
            }
        }

        let ttl = self.config.suggestion_ttl.as_millis() as u64;
        {
            let mut suggestions =
                self.suggestions.lock().map_err(|_| TuneError::poisoned("suggestions"))?;
            for list in suggestions.values_mut() {
                for s in list.iter_mut() {
                    let overdue = now.saturating_sub(s.created_at_ms) > ttl;
                    if s.status == SuggestionStatus::Pending && overdue {
                        s.status = SuggestionStatus::Expired;
                        s.resolved_at_ms = Some(now);
                        report.suggestions_expired += 1;
                    }
                }
                let before = list.len();
                list.retain(|s| {
                    s.status == SuggestionStatus::Pending
                        || s.resolved_at_ms.map_or(true, |at| now.saturating_sub(at) <= retention)
                });
                report.suggestions_removed += before - list.len();
            }
            suggestions.retain(|_, list| !list.is_empty());
        }

        if let Ok(mut ingested) = self.ingested.lock() {
            let horizon = retention.max(self.config.lookback.as_millis() as u64);
            ingested.retain(|_, ts| now.saturating_sub(*ts) <= horizon);
        }

        report.correlations_recorded = self.analyze_correlations(now)?;
        {
            let mut correlations =
                self.correlations.lock().map_err(|_| TuneError::poisoned("correlations"))?;
            let before = correlations.len();
            correlations.retain(|_, c| now.saturating_sub(c.last_updated_ms) <= retention);
            report.correlations_removed = before - correlations.len();
        }
        Ok(report)
    }

    /// Pair up knobs whose patterns both succeed within one time window.
    /// Returns how many pairs gained a window.
    fn analyze_correlations(&self, now: u64) -> TuneResult<usize> {
        let mut by_subject: BTreeMap<String, Vec<PatternSnapshot>> = BTreeMap::new();
        {
            let patterns = self.patterns.read().map_err(|_| TuneError::poisoned("patterns"))?;
            for (key, cell) in patterns.iter() {
                let p = cell.lock().map_err(|_| TuneError::poisoned("learning pattern"))?;
                by_subject.entry(key.subject_id.clone()).or_default().push(PatternSnapshot {
                    knob: key.knob.clone(),
                    success_rate: p.success_rate,
                    confidence: p.confidence,
                    last_updated_ms: p.last_updated_ms,
                });
            }
        }

        let span_ms = self.config.correlation_window.as_millis() as u64;
        let mut recorded = 0;
        for (subject_id, mut snapshots) in by_subject {
            snapshots.sort_by(|a, b| {
                a.last_updated_ms.cmp(&b.last_updated_ms).then_with(|| a.knob.cmp(&b.knob))
            });
            for window in time_windows(&snapshots, span_ms) {
                let window_start = window[0].last_updated_ms;
                for (i, a) in window.iter().enumerate() {
                    for b in &window[i + 1..] {
                        if a.knob == b.knob
                            || a.success_rate <= CORRELATION_MIN_SUCCESS_RATE
                            || b.success_rate <= CORRELATION_MIN_SUCCESS_RATE
                        {
                            continue;
                        }
                        if self.record_co_success(&subject_id, a, b, window_start, now)? {
                            recorded += 1;
                        }
                    }
                }
            }
        }
        Ok(recorded)
    }

    /// Returns whether the pair gained a new window.
    fn record_co_success(
        &self,
        subject_id: &str,
        a: &PatternSnapshot,
        b: &PatternSnapshot,
        window_start: u64,
        now: u64,
    ) -> TuneResult<bool> {
        let (first, second) = if a.knob < b.knob { (a, b) } else { (b, a) };
        let key = CorrelationKey {
            subject_id: subject_id.to_string(),
            knob: first.knob.clone(),
            partner: Some(second.knob.clone()),
        };
        let score = first.success_rate.min(second.success_rate);
        let confidence = first.confidence.min(second.confidence);

        let mut correlations =
            self.correlations.lock().map_err(|_| TuneError::poisoned("correlations"))?;
        let Some(existing) = correlations.get_mut(&key) else {
            let evidence =
                CorrelationEvidence::CoSuccess { windows: 1, last_window_start_ms: window_start };
            let pattern = CorrelationPattern::new(&key, score, confidence, evidence, now);
            correlations.insert(key, pattern);
            return Ok(true);
        };

        let windows = match &mut existing.evidence {
            CorrelationEvidence::CoSuccess { windows, last_window_start_ms } => {
                if *last_window_start_ms == window_start {
                    // Same window, another pattern type of the same knobs.
                    existing.score = existing.score.max(score);
                    existing.confidence = existing.confidence.max(confidence);
                    existing.strength = CorrelationStrength::of_score(existing.score);
                    return Ok(false);
                }
                *windows += 1;
                *last_window_start_ms = window_start;
                *windows
            }
            CorrelationEvidence::Recommendation { .. } => {
                existing.evidence = CorrelationEvidence::CoSuccess {
                    windows: 1,
                    last_window_start_ms: window_start,
                };
                1
            }
        };
        let w = windows as f64;
        existing.score = (existing.score * (w - 1.0) + score) / w;
        existing.confidence = confidence;
        existing.strength = CorrelationStrength::of_score(existing.score);
        existing.sample_size += 1;
        existing.last_updated_ms = now;
        Ok(true)
    }

    // --- internal ---

    fn pattern(&self, key: &PatternKey) -> TuneResult<Option<Arc<Mutex<LearningPattern>>>> {
        Ok(self
            .patterns
            .read()
            .map_err(|_| TuneError::poisoned("patterns"))?
            .get(key)
            .cloned())
    }

    fn pattern_or_create(
        &self,
        key: &PatternKey,
        now: u64,
    ) -> TuneResult<Arc<Mutex<LearningPattern>>> {
        if let Some(cell) = self.pattern(key)? {
            return Ok(cell);
        }
        let mut patterns = self.patterns.write().map_err(|_| TuneError::poisoned("patterns"))?;
        Ok(Arc::clone(
            patterns
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(LearningPattern::new(key, now)))),
        ))
    }

    fn store_suggestion(&self, suggestion: OptimizationSuggestion) -> TuneResult<()> {
        let mut suggestions =
            self.suggestions.lock().map_err(|_| TuneError::poisoned("suggestions"))?;
        let list = suggestions.entry(suggestion.subject_id.clone()).or_default();
        for prior in list.iter_mut() {
            if prior.status == SuggestionStatus::Pending
                && prior.module == suggestion.module
                && prior.knob == suggestion.knob
            {
                prior.status = SuggestionStatus::Expired;
                prior.resolved_at_ms = Some(suggestion.created_at_ms);
            }
        }
        list.push(suggestion.clone());
        drop(suggestions);
        self.seed_correlation(&suggestion)
    }

    /// A stored suggestion seeds a neutral single-knob correlation.
    fn seed_correlation(&self, suggestion: &OptimizationSuggestion) -> TuneResult<()> {
        let key = CorrelationKey {
            subject_id: suggestion.subject_id.clone(),
            knob: suggestion.key(),
            partner: None,
        };
        let evidence = CorrelationEvidence::Recommendation {
            current_value: suggestion.current_value,
            suggested_value: suggestion.suggested_value,
            reason: suggestion.reason.clone(),
        };
        let now = suggestion.created_at_ms;
        let mut correlations =
            self.correlations.lock().map_err(|_| TuneError::poisoned("correlations"))?;
        match correlations.get_mut(&key) {
            Some(seed) => {
                seed.confidence = suggestion.confidence;
                seed.evidence = evidence;
                seed.sample_size += 1;
                seed.last_updated_ms = now;
            }
            None => {
                let confidence = suggestion.confidence;
                let seed = CorrelationPattern::new(&key, NEUTRAL_SCORE, confidence, evidence, now);
                correlations.insert(key, seed);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Suggestion strategies
// ---------------------------------------------------------------------------

fn suggestion_not_found(id: &str) -> TuneError {
    TuneError::NotFound { what: "suggestion", id: id.to_string() }
}

fn new_suggestion(
    subject_id: &str,
    descriptor: &KnobDescriptor,
    current: f64,
    suggested: f64,
    reason: String,
    expected_improvement: f64,
    confidence: f64,
    pattern_ids: Vec<String>,
) -> OptimizationSuggestion {
    OptimizationSuggestion {
        id: uuid::Uuid::new_v4().to_string(),
        subject_id: subject_id.to_string(),
        module: descriptor.module.clone(),
        knob: descriptor.name.clone(),
        current_value: current,
        suggested_value: suggested,
        reason,
        expected_improvement,
        confidence,
        pattern_ids,
        status: SuggestionStatus::Pending,
        created_at_ms: now_ms(),
        resolved_at_ms: None,
        partial: false,
    }
}

/// `current + Σ(w·mean successful delta) / Σw`, with `w = confidence × success_rate`.
fn weighted_delta_suggestion(
    subject_id: &str,
    descriptor: &KnobDescriptor,
    current: f64,
    patterns: &[&LearningPattern],
) -> Option<OptimizationSuggestion> {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut used: Vec<&LearningPattern> = Vec::new();

    for p in patterns {
        let deltas: Vec<f64> = p.successful_deltas().collect();
        let weight = p.confidence * p.success_rate;
        if deltas.is_empty() || weight <= 0.0 {
            continue;
        }
        let mean_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;
        weighted_sum += mean_delta * weight;
        total_weight += weight;
        used.push(p);
    }
    if total_weight <= 0.0 {
        return None;
    }

    let suggested = descriptor.clamp(current + weighted_sum / total_weight);
    if (suggested - current).abs() <= f64::EPSILON * descriptor.range().max(1.0) {
        return None;
    }
    let n = used.len() as f64;
    let mean_success = used.iter().map(|p| p.success_rate).sum::<f64>() / n;
    let mean_confidence = used.iter().map(|p| p.confidence).sum::<f64>() / n;
    let reason = format!(
        "{} learned pattern(s) with average success rate {:.1}%",
        used.len(),
        mean_success * 100.0
    );
    Some(new_suggestion(
        subject_id,
        descriptor,
        current,
        suggested,
        reason,
        mean_success * mean_confidence * 0.5,
        (total_weight / n).min(MAX_SUGGESTION_CONFIDENCE),
        used.iter().map(|p| p.id.clone()).collect(),
    ))
}

/// Slide a window over successful post-adjustment values sorted by value and
/// suggest the mean of the best window when `current` lies outside it.
fn optimal_range_suggestion(
    subject_id: &str,
    descriptor: &KnobDescriptor,
    current: f64,
    patterns: &[&LearningPattern],
) -> Option<OptimizationSuggestion> {
    let sources: Vec<&&LearningPattern> =
        patterns.iter().filter(|p| p.success_rate > RANGE_MIN_SUCCESS_RATE).collect();
    let mut values: Vec<(f64, f64)> = sources
        .iter()
        .flat_map(|p| {
            let rate = p.success_rate;
            p.observations.iter().filter(|o| o.success).map(move |o| (o.value_after, rate))
        })
        .collect();
    if values.len() < 3 {
        return None;
    }
    values.sort_by(|a, b| a.0.total_cmp(&b.0));

    let window = (values.len() / 3).max(3);
    let (lo, hi, optimal, best) = values
        .windows(window)
        .map(|w| {
            let avg_success = w.iter().map(|v| v.1).sum::<f64>() / w.len() as f64;
            let mean_value = w.iter().map(|v| v.0).sum::<f64>() / w.len() as f64;
            (w[0].0, w[w.len() - 1].0, mean_value, avg_success)
        })
        .fold((0.0, 0.0, 0.0, 0.0), |acc, cur| if cur.3 > acc.3 { cur } else { acc });

    if best <= RANGE_MIN_WINDOW_SUCCESS || (current >= lo && current <= hi) {
        return None;
    }
    let suggested = descriptor.clamp(optimal);
    let range = descriptor.range();
    let expected = if range > 0.0 { (current - suggested).abs() / range * 0.3 } else { 0.0 };
    Some(new_suggestion(
        subject_id,
        descriptor,
        current,
        suggested,
        format!("current value {current} lies outside the best observed range [{lo}, {hi}]"),
        expected,
        RANGE_SUGGESTION_CONFIDENCE,
        sources.iter().map(|p| p.id.clone()).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
