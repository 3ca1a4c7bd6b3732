//! # Stage: Telemetry Store
//!
//! ## Responsibility
//! Append-only log of knob adjustments, free-form telemetry events and game
//! outcomes, one stream per subject. Computes [`PerformanceMetric`]
//! effectiveness reports from that log and caches them per
//! (subject, module, knob).
//!
//! ## Guarantees
//! - Arrival order: each subject stream preserves the order records arrive in
//! - Cache coherence: a new adjustment or outcome for a key invalidates its
//!   cached report; a recompute that raced an invalidation is not cached
//! - Bounded work: recomputation stops at its deadline and reports
//!   `complete = false`; incomplete reports are never cached
//! - Effectiveness lies in `[0, 1]`, sub-scores in `[-1, 1]`, confidence in `[0, 1)`
//!
//! ## NOT Responsible For
//! - Learning patterns from outcomes (learning engine)
//! - Publishing reports (orchestrator pipeline)
//! - Durable persistence

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{TuneError, TuneResult};
use crate::now_ms;
use crate::tuning::registry::{KnobAdjustment, KnobKey, KnobRegistry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight given to an outcome that has no preceding adjustment of its knob.
pub const NO_ADJUSTMENT_CONFIDENCE: f64 = 0.5;

const MS_PER_DAY: u64 = 86_400_000;

/// Outcomes scored between two deadline checks.
const DEADLINE_CHECK_EVERY: usize = 256;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Outcomes older than this are ignored by effectiveness reports.
    pub lookback: Duration,
    /// Recency half-life of an outcome's weight.
    pub half_life: Duration,
    /// `k` in `confidence = n / (n + k)`.
    pub confidence_k: f64,
    /// Cutoff for a single recompute (or one batch of them).
    pub recompute_deadline: Duration,
    /// How long cached metric rows outlive the record retention window.
    pub metric_grace: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(7 * 24 * 3600),
            half_life: Duration::from_secs(24 * 3600),
            confidence_k: 5.0,
            recompute_deadline: Duration::from_millis(250),
            metric_grace: Duration::from_secs(24 * 3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A free-form observation from the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub subject_id: String,
    pub event_type: String,
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knob: Option<String>,
    pub value: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp_ms: u64,
}

impl TelemetryEvent {
    pub fn new(
        subject_id: impl Into<String>,
        event_type: impl Into<String>,
        module: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            event_type: event_type.into(),
            module: module.into(),
            knob: None,
            value,
            metadata: BTreeMap::new(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_knob(mut self, knob: impl Into<String>) -> Self {
        self.knob = Some(knob.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// An externally observed result, attributed to an explicit set of knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub id: String,
    pub subject_id: String,
    pub outcome_type: String,
    /// Positive values are good for the subject, negative bad.
    pub value: f64,
    #[serde(default)]
    pub related_knobs: Vec<KnobKey>,
    pub timestamp_ms: u64,
}

impl GameOutcome {
    pub fn new(
        subject_id: impl Into<String>,
        outcome_type: impl Into<String>,
        value: f64,
        related_knobs: Vec<KnobKey>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            outcome_type: outcome_type.into(),
            value,
            related_knobs,
            timestamp_ms: now_ms(),
        }
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// Cached effectiveness of one knob for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub subject_id: String,
    pub module: String,
    pub knob: String,
    /// `(1 + tanh(raw_score)) / 2`; 0.5 is neutral.
    pub effectiveness: f64,
    /// Weighted mean of direction-signed outcome values.
    pub raw_score: f64,
    /// `tanh` of the weighted mean per outcome type.
    pub sub_scores: BTreeMap<String, f64>,
    pub sample_size: usize,
    pub confidence: f64,
    pub window_ms: u64,
    pub computed_at_ms: u64,
    pub recompute_seq: u64,
    /// False when the recompute hit its deadline before seeing every sample.
    pub complete: bool,
}

impl PerformanceMetric {
    pub fn key(&self) -> KnobKey {
        KnobKey::new(self.module.clone(), self.knob.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub total_adjustments: usize,
    pub total_events: usize,
    pub total_outcomes: usize,
    pub cached_metrics: usize,
    pub active_subjects: usize,
    pub recomputations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryCleanup {
    pub adjustments_removed: usize,
    pub events_removed: usize,
    pub outcomes_removed: usize,
    pub metrics_removed: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SubjectStream {
    adjustments: VecDeque<KnobAdjustment>,
    events: VecDeque<TelemetryEvent>,
    outcomes: VecDeque<GameOutcome>,
}

impl SubjectStream {
    fn is_empty(&self) -> bool {
        self.adjustments.is_empty() && self.events.is_empty() && self.outcomes.is_empty()
    }
}

/// A cache row. `generation` advances on every invalidation so a recompute
/// that started before one can detect it.
#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    metric: Option<PerformanceMetric>,
}

type CacheKey = (String, KnobKey);

#[derive(Debug, Default, Clone, Copy)]
struct WeightedMean {
    sum: f64,
    weight: f64,
}

impl WeightedMean {
    fn push(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weight += weight;
    }

    fn mean(&self) -> f64 {
        if self.weight > 0.0 { self.sum / self.weight } else { 0.0 }
    }
}

/// The parts of an outcome a recompute reads.
#[derive(Debug)]
struct OutcomeSample {
    timestamp_ms: u64,
    value: f64,
    outcome_type: String,
}

/// The parts of an adjustment a recompute reads.
#[derive(Debug)]
struct AdjustmentMark {
    timestamp_ms: u64,
    sign: f64,
    confidence: f64,
}

fn direction_sign(delta: f64) -> f64 {
    if delta < 0.0 { -1.0 } else { 1.0 }
}

// ---------------------------------------------------------------------------
// TelemetryStore
// ---------------------------------------------------------------------------

pub struct TelemetryStore {
    registry: Arc<KnobRegistry>,
    config: TelemetryConfig,
    streams: RwLock<HashMap<String, Arc<Mutex<SubjectStream>>>>,
    cache: Mutex<HashMap<CacheKey, CacheSlot>>,
    recompute_seq: AtomicU64,
}

impl TelemetryStore {
    pub fn new(registry: Arc<KnobRegistry>, config: TelemetryConfig) -> Self {
        Self {
            registry,
            config,
            streams: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            recompute_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    // --- appends ---

    /// Append a committed adjustment and invalidate its cached report.
    pub fn record_adjustment(&self, adjustment: KnobAdjustment) -> TuneResult<()> {
        let key = adjustment.key();
        let subject_id = adjustment.subject_id.clone();
        self.stream_or_create(&subject_id)?
            .lock()
            .map_err(|_| TuneError::poisoned("telemetry stream"))?
            .adjustments
            .push_back(adjustment);
        self.invalidate(&subject_id, &key)
    }

    pub fn record_event(&self, event: TelemetryEvent) -> TuneResult<TelemetryEvent> {
        if !self.registry.contains(&event.subject_id) {
            return Err(TuneError::subject_not_found(&event.subject_id));
        }
        if !event.value.is_finite() {
            return Err(TuneError::InvalidValue(format!(
                "event value {} is not a finite number",
                event.value
            )));
        }
        if event.event_type.trim().is_empty() {
            return Err(TuneError::InvalidValue("event type may not be empty".into()));
        }
        self.stream_or_create(&event.subject_id)?
            .lock()
            .map_err(|_| TuneError::poisoned("telemetry stream"))?
            .events
            .push_back(event.clone());
        Ok(event)
    }

    /// Validate and append an outcome, invalidating the cached report of
    /// every related knob.
    pub fn record_outcome(&self, outcome: GameOutcome) -> TuneResult<GameOutcome> {
        if !self.registry.contains(&outcome.subject_id) {
            return Err(TuneError::subject_not_found(&outcome.subject_id));
        }
        if !outcome.value.is_finite() {
            return Err(TuneError::InvalidValue(format!(
                "outcome value {} is not a finite number",
                outcome.value
            )));
        }
        if outcome.outcome_type.trim().is_empty() {
            return Err(TuneError::InvalidValue("outcome type may not be empty".into()));
        }
        let schema = self.registry.schema();
        for key in &outcome.related_knobs {
            schema.lookup(&key.module, &key.knob)?;
        }

        self.stream_or_create(&outcome.subject_id)?
            .lock()
            .map_err(|_| TuneError::poisoned("telemetry stream"))?
            .outcomes
            .push_back(outcome.clone());
        for key in &outcome.related_knobs {
            self.invalidate(&outcome.subject_id, key)?;
        }
        Ok(outcome)
    }

    // --- reads ---

    /// Adjustments of one knob with `since_ms <= timestamp <= until_ms`, in
    /// arrival order.
    pub fn adjustments_for(
        &self,
        subject_id: &str,
        key: &KnobKey,
        since_ms: u64,
        until_ms: u64,
    ) -> TuneResult<Vec<KnobAdjustment>> {
        let Some(stream) = self.stream(subject_id)? else { return Ok(Vec::new()) };
        let stream = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
        Ok(stream
            .adjustments
            .iter()
            .filter(|a| a.module == key.module && a.knob == key.knob)
            .filter(|a| a.timestamp_ms >= since_ms && a.timestamp_ms <= until_ms)
            .cloned()
            .collect())
    }

    /// The newest `limit` adjustments of a subject, oldest first.
    pub fn recent_adjustments(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> TuneResult<Vec<KnobAdjustment>> {
        let Some(stream) = self.stream(subject_id)? else { return Ok(Vec::new()) };
        let stream = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
        let skip = stream.adjustments.len().saturating_sub(limit);
        Ok(stream.adjustments.iter().skip(skip).cloned().collect())
    }

    pub fn events(&self, subject_id: &str) -> TuneResult<Vec<TelemetryEvent>> {
        let Some(stream) = self.stream(subject_id)? else { return Ok(Vec::new()) };
        let stream = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
        Ok(stream.events.iter().cloned().collect())
    }

    pub fn outcomes(&self, subject_id: &str) -> TuneResult<Vec<GameOutcome>> {
        let Some(stream) = self.stream(subject_id)? else { return Ok(Vec::new()) };
        let stream = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
        Ok(stream.outcomes.iter().cloned().collect())
    }

    // --- effectiveness ---

    /// Cached effectiveness of one knob; recomputed when stale or forced.
    pub fn effectiveness_report(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
        force_recalculate: bool,
    ) -> TuneResult<PerformanceMetric> {
        self.effectiveness_report_at(subject_id, module, knob, force_recalculate, now_ms())
    }

    /// [`effectiveness_report`](Self::effectiveness_report) evaluated at an
    /// explicit wall-clock time.
    pub fn effectiveness_report_at(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
        force_recalculate: bool,
        now: u64,
    ) -> TuneResult<PerformanceMetric> {
        let key = self.validate_key(subject_id, module, knob)?;
        let deadline = Instant::now() + self.config.recompute_deadline;
        self.report(subject_id, &key, force_recalculate, now, deadline)
    }

    /// Reports for every knob with at least one outcome in the lookback
    /// window, ordered by key. All recomputes share one deadline.
    pub fn all_effectiveness_reports(
        &self,
        subject_id: &str,
    ) -> TuneResult<Vec<PerformanceMetric>> {
        self.all_effectiveness_reports_at(subject_id, now_ms())
    }

    pub fn all_effectiveness_reports_at(
        &self,
        subject_id: &str,
        now: u64,
    ) -> TuneResult<Vec<PerformanceMetric>> {
        if !self.registry.contains(subject_id) {
            return Err(TuneError::subject_not_found(subject_id));
        }
        let since = now.saturating_sub(self.window_ms());
        let keys: BTreeSet<KnobKey> = self
            .outcomes(subject_id)?
            .into_iter()
            .filter(|o| o.timestamp_ms >= since)
            .flat_map(|o| o.related_knobs)
            .collect();

        let deadline = Instant::now() + self.config.recompute_deadline;
        keys.iter()
            .map(|key| self.report(subject_id, key, false, now, deadline))
            .collect()
    }

    // --- maintenance ---

    pub fn stats(&self) -> TelemetryStats {
        let mut stats = TelemetryStats {
            recomputations: self.recompute_seq.load(Ordering::SeqCst),
            ..TelemetryStats::default()
        };
        if let Ok(streams) = self.streams.read() {
            for stream in streams.values() {
                let Ok(s) = stream.lock() else { continue };
                stats.total_adjustments += s.adjustments.len();
                stats.total_events += s.events.len();
                stats.total_outcomes += s.outcomes.len();
                if !s.is_empty() {
                    stats.active_subjects += 1;
                }
            }
        }
        if let Ok(cache) = self.cache.lock() {
            stats.cached_metrics = cache.values().filter(|slot| slot.metric.is_some()).count();
        }
        stats
    }

    /// Drop records older than `retention_days`. Cached metrics survive for
    /// an extra grace period beyond that.
    pub fn cleanup(&self, retention_days: u32) -> TuneResult<TelemetryCleanup> {
        self.cleanup_at(retention_days, now_ms())
    }

    pub fn cleanup_at(&self, retention_days: u32, now: u64) -> TuneResult<TelemetryCleanup> {
        let cutoff = now.saturating_sub(u64::from(retention_days) * MS_PER_DAY);
        let metric_cutoff = cutoff.saturating_sub(self.config.metric_grace.as_millis() as u64);
        let mut report = TelemetryCleanup::default();

        let streams: Vec<Arc<Mutex<SubjectStream>>> = self
            .streams
            .read()
            .map_err(|_| TuneError::poisoned("telemetry streams"))?
            .values()
            .cloned()
            .collect();
        for stream in streams {
            let mut s = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
            let before = (s.adjustments.len(), s.events.len(), s.outcomes.len());
            s.adjustments.retain(|a| a.timestamp_ms >= cutoff);
            s.events.retain(|e| e.timestamp_ms >= cutoff);
            s.outcomes.retain(|o| o.timestamp_ms >= cutoff);
            report.adjustments_removed += before.0 - s.adjustments.len();
            report.events_removed += before.1 - s.events.len();
            report.outcomes_removed += before.2 - s.outcomes.len();
        }

        let mut cache = self.cache.lock().map_err(|_| TuneError::poisoned("metric cache"))?;
        for slot in cache.values_mut() {
            if slot.metric.as_ref().is_some_and(|m| m.computed_at_ms < metric_cutoff) {
                slot.metric = None;
                slot.generation += 1;
                report.metrics_removed += 1;
            }
        }
        Ok(report)
    }

    // --- internal ---

    fn window_ms(&self) -> u64 {
        self.config.lookback.as_millis() as u64
    }

    fn validate_key(&self, subject_id: &str, module: &str, knob: &str) -> TuneResult<KnobKey> {
        if !self.registry.contains(subject_id) {
            return Err(TuneError::subject_not_found(subject_id));
        }
        Ok(self.registry.schema().lookup(module, knob)?.key())
    }

    fn stream(&self, subject_id: &str) -> TuneResult<Option<Arc<Mutex<SubjectStream>>>> {
        Ok(self
            .streams
            .read()
            .map_err(|_| TuneError::poisoned("telemetry streams"))?
            .get(subject_id)
            .cloned())
    }

    fn stream_or_create(&self, subject_id: &str) -> TuneResult<Arc<Mutex<SubjectStream>>> {
        if let Some(stream) = self.stream(subject_id)? {
            return Ok(stream);
        }
        let mut streams =
            self.streams.write().map_err(|_| TuneError::poisoned("telemetry streams"))?;
        Ok(Arc::clone(streams.entry(subject_id.to_string()).or_default()))
    }

    fn invalidate(&self, subject_id: &str, key: &KnobKey) -> TuneResult<()> {
        let mut cache = self.cache.lock().map_err(|_| TuneError::poisoned("metric cache"))?;
        let slot = cache.entry((subject_id.to_string(), key.clone())).or_default();
        slot.generation += 1;
        slot.metric = None;
        Ok(())
    }

    fn report(
        &self,
        subject_id: &str,
        key: &KnobKey,
        force: bool,
        now: u64,
        deadline: Instant,
    ) -> TuneResult<PerformanceMetric> {
        let cache_key = (subject_id.to_string(), key.clone());
        let generation = {
            let cache = self.cache.lock().map_err(|_| TuneError::poisoned("metric cache"))?;
            match cache.get(&cache_key) {
                Some(slot) => {
                    if let (false, Some(metric)) = (force, &slot.metric) {
                        return Ok(metric.clone());
                    }
                    slot.generation
                }
                None => 0,
            }
        };

        let metric = self.compute(subject_id, key, now, deadline)?;
        if metric.complete {
            let mut cache = self.cache.lock().map_err(|_| TuneError::poisoned("metric cache"))?;
            let slot = cache.entry(cache_key).or_default();
            if slot.generation == generation {
                slot.metric = Some(metric.clone());
            }
        }
        Ok(metric)
    }

    fn compute(
        &self,
        subject_id: &str,
        key: &KnobKey,
        now: u64,
        deadline: Instant,
    ) -> TuneResult<PerformanceMetric> {
        let window_ms = self.window_ms();
        let since = now.saturating_sub(window_ms);
        let (mut outcomes, mut adjustments) = match self.stream(subject_id)? {
            Some(stream) => {
                let s = stream.lock().map_err(|_| TuneError::poisoned("telemetry stream"))?;
                let outcomes: Vec<OutcomeSample> = s
                    .outcomes
                    .iter()
                    .filter(|o| o.timestamp_ms >= since && o.timestamp_ms <= now)
                    .filter(|o| o.related_knobs.contains(key))
                    .map(|o| OutcomeSample {
                        timestamp_ms: o.timestamp_ms,
                        value: o.value,
                        outcome_type: o.outcome_type.clone(),
                    })
                    .collect();
                let adjustments: Vec<AdjustmentMark> = s
                    .adjustments
                    .iter()
                    .filter(|a| a.module == key.module && a.knob == key.knob)
                    .map(|a| AdjustmentMark {
                        timestamp_ms: a.timestamp_ms,
                        sign: direction_sign(a.delta()),
                        confidence: a.confidence,
                    })
                    .collect();
                (outcomes, adjustments)
            }
            None => (Vec::new(), Vec::new()),
        };

        // Stable sort: among equal timestamps the later arrival stays last.
        adjustments.sort_by_key(|a| a.timestamp_ms);
        // Newest first, so a deadline cut drops only the lightest weights.
        outcomes.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let recompute_seq = self.recompute_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let half_life_ms = (self.config.half_life.as_millis() as f64).max(1.0);
        let mut overall = WeightedMean::default();
        let mut by_type: BTreeMap<String, WeightedMean> = BTreeMap::new();
        let mut sample_size = 0usize;
        let mut complete = true;

        for (i, outcome) in outcomes.iter().enumerate() {
            if i % DEADLINE_CHECK_EVERY == 0 && Instant::now() >= deadline {
                complete = false;
                break;
            }
            let governing = adjustments
                .partition_point(|a| a.timestamp_ms <= outcome.timestamp_ms)
                .checked_sub(1)
                .map(|idx| &adjustments[idx]);
            let sign = governing.map_or(1.0, |a| a.sign);
            let base = governing.map_or(NO_ADJUSTMENT_CONFIDENCE, |a| a.confidence);
            let age_ms = now.saturating_sub(outcome.timestamp_ms) as f64;
            let weight = base * 0.5f64.powf(age_ms / half_life_ms);

            let signed = sign * outcome.value;
            overall.push(signed, weight);
            by_type.entry(outcome.outcome_type.clone()).or_default().push(signed, weight);
            sample_size += 1;
        }

        let raw_score = overall.mean();
        let n = sample_size as f64;
        Ok(PerformanceMetric {
            subject_id: subject_id.to_string(),
            module: key.module.clone(),
            knob: key.knob.clone(),
            effectiveness: (1.0 + raw_score.tanh()) / 2.0,
            raw_score,
            sub_scores: by_type.into_iter().map(|(t, m)| (t, m.mean().tanh())).collect(),
            sample_size,
            confidence: n / (n + self.config.confidence_k.max(f64::MIN_POSITIVE)),
            window_ms,
            computed_at_ms: now,
            recompute_seq,
            complete,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
