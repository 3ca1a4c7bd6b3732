//! # Tuning Orchestrator
//!
//! Composition root for the tuning core. Owns the registry, telemetry store,
//! learning engine and event bus, and exposes the public API.
//!
//! ```text
//! adjust_knob ──► KnobRegistry (sync commit)
//!                      │
//!                      ▼  PipelineMsg (unbounded, FIFO)
//!               pipeline worker ──► TelemetryStore ──► EventBus ──► gateway
//!                      ▲                  │
//! record_outcome ──────┘                  ▼
//!                                   LearningEngine ──► recommendations
//! ```
//!
//! ## What It Does
//!
//! 1. Commits mutations synchronously and returns to the caller.
//! 2. Queues every side effect (telemetry append, learning, publish) onto a
//!    single pipeline worker, so callers never wait on fan-out.
//! 3. After each outcome, publishes a `performance_update` per related knob
//!    and, when effectiveness drops below the threshold, fresh
//!    `recommendations`.
//! 4. Runs a periodic maintenance sweep (retention and confidence decay).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knob_tuner::tuning::bus::EventBus;
//! use knob_tuner::tuning::catalog;
//! use knob_tuner::tuning::orchestrator::{Orchestrator, OrchestratorConfig};
//! use std::sync::Arc;
//!
//! let schema = Arc::new(catalog::build_schema(true, Vec::new())?);
//! let bus = Arc::new(EventBus::default());
//! let orc = Orchestrator::start(OrchestratorConfig::default(), schema, bus);
//! orc.register_subject("civ-1", Default::default())?;
//! orc.adjust_knob("civ-1", "fiscal", "taxRate", 0.8, "manual", 0.9)?;
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{TuneError, TuneResult};
use crate::task::PeriodicTask;
use crate::tuning::bus::{BusEvent, EventBus, EventPayload};
use crate::tuning::learning::{
    CorrelationPattern, LearningCleanup, LearningConfig, LearningEngine, LearningMetrics,
    LearningPattern, OptimizationSuggestion, SuggestionStatus,
};
use crate::tuning::registry::{
    KnobAdjustment, KnobKey, KnobRegistry, KnobSchema, KnobView, Subject, SubjectContext,
};
use crate::tuning::telemetry::{
    GameOutcome, PerformanceMetric, TelemetryCleanup, TelemetryConfig, TelemetryEvent,
    TelemetryStats, TelemetryStore,
};

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub telemetry: TelemetryConfig,
    pub learning: LearningConfig,
    /// Effectiveness below which an outcome triggers suggestion generation.
    pub auto_suggest_threshold: f64,
    /// Shared deadline for one `analyze_and_recommend` call.
    pub analyze_deadline: Duration,
    /// How often the maintenance sweep runs.
    pub maintenance_interval: Duration,
    /// Record retention applied by the maintenance sweep.
    pub retention_days: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            telemetry: TelemetryConfig::default(),
            learning: LearningConfig::default(),
            auto_suggest_threshold: 0.6,
            analyze_deadline: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(3600),
            retention_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(flatten)]
    pub telemetry: TelemetryStats,
    pub registered_subjects: usize,
    pub total_patterns: usize,
    pub pending_suggestions: usize,
    pub events_published: u64,
    pub pipeline: PipelineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub telemetry: TelemetryCleanup,
    pub learning: LearningCleanup,
}

/// Observable state of the pipeline worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub processed: u64,
    pub side_effect_failures: u64,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    running: AtomicBool,
    processed: AtomicU64,
    failures: AtomicU64,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PipelineMsg {
    SubjectRegistered(Subject),
    Adjustment(KnobAdjustment),
    Outcome(GameOutcome),
    Event(TelemetryEvent),
    Recommendations(Vec<OptimizationSuggestion>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// The single worker that applies side effects in submission order.
struct Pipeline {
    telemetry: Arc<TelemetryStore>,
    learning: Arc<LearningEngine>,
    bus: Arc<EventBus>,
    counters: Arc<PipelineCounters>,
    auto_suggest_threshold: f64,
}

impl Pipeline {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PipelineMsg>) {
        self.counters.running.store(true, Ordering::SeqCst);
        info!("tuning pipeline started");
        while let Some(msg) = rx.recv().await {
            match msg {
                PipelineMsg::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
                PipelineMsg::Shutdown => break,
                other => self.handle(other),
            }
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.running.store(false, Ordering::SeqCst);
        info!("tuning pipeline stopped");
    }

    fn handle(&self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::SubjectRegistered(subject) => {
                self.bus.publish(EventPayload::SubjectRegistered(subject));
            }
            PipelineMsg::Adjustment(adjustment) => {
                if let Err(e) = self.telemetry.record_adjustment(adjustment.clone()) {
                    self.failed("record_adjustment", &e);
                }
                self.bus.publish(EventPayload::KnobAdjustment(adjustment));
            }
            PipelineMsg::Event(event) => {
                self.bus.publish(EventPayload::SimulationEvent(event));
            }
            PipelineMsg::Outcome(outcome) => self.on_outcome(outcome),
            PipelineMsg::Recommendations(list) => {
                self.bus.publish(EventPayload::Recommendations(list));
            }
            PipelineMsg::Flush(_) | PipelineMsg::Shutdown => {}
        }
    }

    fn on_outcome(&self, outcome: GameOutcome) {
        let touched = match self.learning.ingest_outcome(&outcome) {
            Ok(touched) => touched,
            Err(e) => {
                self.failed("ingest_outcome", &e);
                Vec::new()
            }
        };

        let related: BTreeSet<&KnobKey> = outcome.related_knobs.iter().collect();
        let mut suggestions = Vec::new();
        for key in related {
            let subject_id = &outcome.subject_id;
            let report =
                self.telemetry.effectiveness_report(subject_id, &key.module, &key.knob, false);
            let metric = match report {
                Ok(metric) => metric,
                Err(e) => {
                    self.failed("effectiveness_report", &e);
                    continue;
                }
            };
            let underperforming = metric.effectiveness < self.auto_suggest_threshold;
            self.bus.publish(EventPayload::PerformanceUpdate(metric));

            if underperforming && touched.contains(key) {
                let generated =
                    self.learning.generate_suggestion(&outcome.subject_id, &key.module, &key.knob);
                match generated {
                    Ok(Some(s)) => suggestions.push(s),
                    Ok(None) => {}
                    Err(e) => self.failed("generate_suggestion", &e),
                }
            }
        }

        if !suggestions.is_empty() {
            rank(&mut suggestions);
            debug!(
                subject = %outcome.subject_id,
                count = suggestions.len(),
                "auto-generated suggestions"
            );
            self.bus.publish(EventPayload::Recommendations(suggestions));
        }
    }

    fn failed(&self, operation: &'static str, error: &TuneError) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(operation, error = %error, "pipeline side effect failed");
    }
}

/// Highest `confidence × expected_improvement` first.
fn rank(suggestions: &mut [OptimizationSuggestion]) {
    suggestions.sort_by(|a, b| b.score().total_cmp(&a.score()));
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<KnobRegistry>,
    telemetry: Arc<TelemetryStore>,
    learning: Arc<LearningEngine>,
    bus: Arc<EventBus>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
    counters: Arc<PipelineCounters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component and spawn the pipeline worker on the current
    /// runtime.
    pub fn start(
        config: OrchestratorConfig,
        schema: Arc<KnobSchema>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let registry = Arc::new(KnobRegistry::new(schema));
        let telemetry =
            Arc::new(TelemetryStore::new(Arc::clone(&registry), config.telemetry.clone()));
        let learning = Arc::new(LearningEngine::new(
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            config.learning.clone(),
        ));
        let counters = Arc::new(PipelineCounters::default());
        counters.running.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline {
            telemetry: Arc::clone(&telemetry),
            learning: Arc::clone(&learning),
            bus: Arc::clone(&bus),
            counters: Arc::clone(&counters),
            auto_suggest_threshold: config.auto_suggest_threshold,
        };
        let worker = tokio::spawn(pipeline.run(rx));
        info!(knobs = registry.schema().len(), "orchestrator started");

        Arc::new(Self {
            config,
            registry,
            telemetry,
            learning,
            bus,
            tx,
            counters,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn registry(&self) -> &Arc<KnobRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn schema(&self) -> &Arc<KnobSchema> {
        self.registry.schema()
    }

    // --- subjects and knobs ---

    /// Idempotent. Publishes `subject_registered` only on first registration.
    pub fn register_subject(&self, id: &str, context: SubjectContext) -> TuneResult<Subject> {
        let (subject, created) = self.registry.register(id, context)?;
        if created {
            info!(subject = %subject.id, "subject registered");
            self.enqueue(PipelineMsg::SubjectRegistered(subject.clone()));
        }
        Ok(subject)
    }

    pub fn knob_states(
        &self,
        subject_id: &str,
    ) -> TuneResult<std::collections::BTreeMap<String, KnobView>> {
        self.registry.knob_states(subject_id)
    }

    /// Commit a knob change. Telemetry and broadcast follow asynchronously.
    pub fn adjust_knob(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
        value: f64,
        reason: &str,
        confidence: f64,
    ) -> TuneResult<KnobAdjustment> {
        match self.registry.adjust(subject_id, module, knob, value, reason, confidence) {
            Ok(adjustment) => {
                debug!(
                    subject = %subject_id,
                    knob = %adjustment.key(),
                    old = adjustment.old_value,
                    new = adjustment.new_value,
                    clamped = adjustment.was_clamped(),
                    "knob adjusted"
                );
                self.enqueue(PipelineMsg::Adjustment(adjustment.clone()));
                Ok(adjustment)
            }
            Err(e) => {
                debug!(
                    subject = %subject_id,
                    module,
                    knob,
                    value,
                    error = %e,
                    "knob adjustment rejected"
                );
                Err(e)
            }
        }
    }

    // --- telemetry ---

    /// Append an outcome synchronously; learning and fan-out follow.
    pub fn record_outcome(&self, outcome: GameOutcome) -> TuneResult<GameOutcome> {
        let outcome = self.telemetry.record_outcome(outcome)?;
        self.enqueue(PipelineMsg::Outcome(outcome.clone()));
        Ok(outcome)
    }

    /// Append a telemetry event and publish it as a `simulation_event`.
    pub fn record_event(&self, event: TelemetryEvent) -> TuneResult<TelemetryEvent> {
        let event = self.telemetry.record_event(event)?;
        self.enqueue(PipelineMsg::Event(event.clone()));
        Ok(event)
    }

    pub fn performance_metrics(&self, subject_id: &str) -> TuneResult<Vec<PerformanceMetric>> {
        self.telemetry.all_effectiveness_reports(subject_id)
    }

    pub fn effectiveness_report(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
        force_recalculate: bool,
    ) -> TuneResult<PerformanceMetric> {
        self.telemetry.effectiveness_report(subject_id, module, knob, force_recalculate)
    }

    pub fn stats(&self) -> SystemStats {
        let learning = self.learning.metrics();
        SystemStats {
            telemetry: self.telemetry.stats(),
            registered_subjects: self.registry.len(),
            total_patterns: learning.total_patterns,
            pending_suggestions: learning.pending_suggestions,
            events_published: self.bus.published(),
            pipeline: self.status(),
        }
    }

    pub fn cleanup(&self, retention_days: u32) -> TuneResult<CleanupReport> {
        let telemetry = self.telemetry.cleanup(retention_days)?;
        let learning = self.learning.maintain()?;
        info!(
            retention_days,
            adjustments = telemetry.adjustments_removed,
            outcomes = telemetry.outcomes_removed,
            patterns = learning.patterns_removed,
            correlations = learning.correlations_recorded,
            "cleanup finished"
        );
        Ok(CleanupReport { telemetry, learning })
    }

    // --- learning ---

    /// Generate suggestions for every knob of a subject under one deadline,
    /// rank them and publish the non-empty result.
    pub fn analyze_and_recommend(
        &self,
        subject_id: &str,
    ) -> TuneResult<Vec<OptimizationSuggestion>> {
        if !self.registry.contains(subject_id) {
            return Err(TuneError::subject_not_found(subject_id));
        }
        let deadline = Instant::now() + self.config.analyze_deadline;
        let mut suggestions = Vec::new();
        let mut cut_short = false;
        for key in self.schema().keys() {
            if Instant::now() >= deadline {
                cut_short = true;
                break;
            }
            if let Some(s) = self.learning.generate_with_deadline(subject_id, key, deadline)? {
                suggestions.push(s);
            }
        }
        if cut_short {
            warn!(
                subject = %subject_id,
                found = suggestions.len(),
                "analysis deadline reached, returning partial result"
            );
            suggestions.iter_mut().for_each(|s| s.partial = true);
        }
        rank(&mut suggestions);
        if !suggestions.is_empty() {
            self.enqueue(PipelineMsg::Recommendations(suggestions.clone()));
        }
        Ok(suggestions)
    }

    pub fn generate_optimization_suggestions(
        &self,
        subject_id: &str,
        module: &str,
        knob: &str,
    ) -> TuneResult<Option<OptimizationSuggestion>> {
        let suggestion = self.learning.generate_suggestion(subject_id, module, knob)?;
        if let Some(s) = &suggestion {
            self.enqueue(PipelineMsg::Recommendations(vec![s.clone()]));
        }
        Ok(suggestion)
    }

    /// Every stored suggestion of a subject, any status, oldest first.
    pub fn optimization_suggestions(
        &self,
        subject_id: &str,
    ) -> TuneResult<Vec<OptimizationSuggestion>> {
        self.require_subject(subject_id)?;
        self.learning.suggestions(subject_id)
    }

    pub fn learning_patterns(&self, subject_id: &str) -> TuneResult<Vec<LearningPattern>> {
        self.require_subject(subject_id)?;
        self.learning.patterns(subject_id)
    }

    /// Knob pairs that succeed together, plus one seed per recommended knob.
    pub fn correlation_patterns(&self, subject_id: &str) -> TuneResult<Vec<CorrelationPattern>> {
        self.require_subject(subject_id)?;
        self.learning.correlation_patterns(subject_id)
    }

    pub fn learning_metrics(&self) -> LearningMetrics {
        self.learning.metrics()
    }

    /// Mark a pending suggestion applied and move its knob to the suggested
    /// value.
    pub fn apply_suggestion(
        &self,
        subject_id: &str,
        suggestion_id: &str,
    ) -> TuneResult<KnobAdjustment> {
        // The status transition is the claim; a concurrent apply fails here.
        let suggestion =
            self.learning.resolve_suggestion(subject_id, suggestion_id, SuggestionStatus::Applied)?;
        self.adjust_knob(
            subject_id,
            &suggestion.module,
            &suggestion.knob,
            suggestion.suggested_value,
            &format!("suggestion:{}", suggestion.id),
            suggestion.confidence,
        )
    }

    pub fn reject_suggestion(
        &self,
        subject_id: &str,
        suggestion_id: &str,
    ) -> TuneResult<OptimizationSuggestion> {
        self.learning.resolve_suggestion(subject_id, suggestion_id, SuggestionStatus::Rejected)
    }

    // --- events and lifecycle ---

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Bus events as a stream. Events a lagging consumer missed are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = BusEvent> {
        BroadcastStream::new(self.bus.subscribe()).filter_map(|r| r.ok())
    }

    /// Wait until every side effect queued before this call has been applied.
    pub async fn flush(&self) -> TuneResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(PipelineMsg::Flush(done_tx))
            .map_err(|_| TuneError::Unavailable("tuning pipeline".into()))?;
        done_rx.await.map_err(|_| TuneError::Unavailable("tuning pipeline".into()))
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            running: self.counters.running.load(Ordering::SeqCst),
            processed: self.counters.processed.load(Ordering::Relaxed),
            side_effect_failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic retention and decay sweep.
    pub fn start_maintenance(self: &Arc<Self>) -> PeriodicTask {
        let orc = Arc::clone(self);
        PeriodicTask::spawn("maintenance", self.config.maintenance_interval, move || {
            if let Err(e) = orc.cleanup(orc.config.retention_days) {
                warn!(error = %e, "maintenance sweep failed");
            }
        })
    }

    /// Drain queued side effects and stop the pipeline worker.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PipelineMsg::Shutdown);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    // --- internal ---

    fn enqueue(&self, msg: PipelineMsg) {
        if self.tx.send(msg).is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("tuning pipeline is not running; side effect dropped");
        }
    }

    fn require_subject(&self, subject_id: &str) -> TuneResult<()> {
        if self.registry.contains(subject_id) {
            Ok(())
        } else {
            Err(TuneError::subject_not_found(subject_id))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::bus::Topic;
    use crate::tuning::registry::KnobDescriptor;

    fn schema() -> Arc<KnobSchema> {
        Arc::new(
            KnobSchema::builder()
                .knob(KnobDescriptor::new("fiscal", "taxRate", 0.5, 0.0, 1.0, "Tax rate"))
                .unwrap()
                .knob(KnobDescriptor::new("culture", "cohesion", 0.7, 0.0, 1.0, "Cohesion"))
                .unwrap()
                .build(),
        )
    }

    async fn start(config: OrchestratorConfig) -> Arc<Orchestrator> {
        let orc = Orchestrator::start(config, schema(), Arc::new(EventBus::default()));
        orc.register_subject("S1", SubjectContext::default()).unwrap();
        orc.flush().await.unwrap();
        orc
    }

    fn tax() -> KnobKey {
        KnobKey::new("fiscal", "taxRate")
    }

    #[tokio::test]
    async fn test_adjust_then_flush_records_telemetry_and_publishes() {
        let orc = start(OrchestratorConfig::default()).await;
        let mut rx = orc.subscribe();
        let adj = orc.adjust_knob("S1", "fiscal", "taxRate", 0.8, "manual", 0.9).unwrap();
        assert_eq!(adj.new_value, 0.8);
        orc.flush().await.unwrap();

        assert_eq!(orc.telemetry().stats().total_adjustments, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, Topic::KnobAdjustments);
        assert!(matches!(event.payload, EventPayload::KnobAdjustment(ref a) if a.id == adj.id));
    }

    #[tokio::test]
    async fn test_register_publishes_once() {
        let bus = Arc::new(EventBus::default());
        let orc = Orchestrator::start(OrchestratorConfig::default(), schema(), bus);
        orc.register_subject("S9", SubjectContext::default()).unwrap();
        orc.register_subject("S9", SubjectContext::default()).unwrap();
        orc.flush().await.unwrap();
        assert_eq!(orc.bus().published(), 1);
    }

    #[tokio::test]
    async fn test_outcome_updates_pattern_and_publishes_performance() {
        let orc = start(OrchestratorConfig::default()).await;
        let mut rx = orc.subscribe();
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.8, "manual", 0.9).unwrap();
        orc.record_outcome(GameOutcome::new("S1", "gdp", 1.0, vec![tax()])).unwrap();
        orc.flush().await.unwrap();

        let patterns = orc.learning_patterns("S1").unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].sample_size, 1);

        let mut topics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            topics.push(event.topic);
        }
        assert_eq!(topics, vec![Topic::KnobAdjustments, Topic::PerformanceUpdates]);
    }

    #[tokio::test]
    async fn test_underperforming_outcome_triggers_recommendations() {
        let config = OrchestratorConfig {
            learning: LearningConfig { min_pattern_samples: 1, ..LearningConfig::default() },
            ..OrchestratorConfig::default()
        };
        let orc = start(config).await;
        let mut rx = orc.subscribe();
        // A decrease that is followed by a good outcome scores below neutral.
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.3, "manual", 0.9).unwrap();
        orc.record_outcome(GameOutcome::new("S1", "gdp", 1.0, vec![tax()])).unwrap();
        orc.flush().await.unwrap();

        let mut saw_recommendations = false;
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::Recommendations(list) = event.payload {
                saw_recommendations = true;
                assert_eq!(list[0].knob, "taxRate");
                assert!(list[0].suggested_value < 0.3);
            }
        }
        assert!(saw_recommendations);
        assert_eq!(orc.learning_metrics().pending_suggestions, 1);
    }

    #[tokio::test]
    async fn test_apply_and_reject_suggestion() {
        let config = OrchestratorConfig {
            learning: LearningConfig { min_pattern_samples: 1, ..LearningConfig::default() },
            ..OrchestratorConfig::default()
        };
        let orc = start(config).await;
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.6, "manual", 0.9).unwrap();
        orc.record_outcome(GameOutcome::new("S1", "gdp", 1.0, vec![tax()])).unwrap();
        orc.flush().await.unwrap();

        let s = orc.generate_optimization_suggestions("S1", "fiscal", "taxRate").unwrap().unwrap();
        let adj = orc.apply_suggestion("S1", &s.id).unwrap();
        assert_eq!(adj.new_value, s.suggested_value);
        assert_eq!(adj.reason, format!("suggestion:{}", s.id));
        assert!(matches!(orc.apply_suggestion("S1", &s.id), Err(TuneError::InvalidValue(_))));
        assert!(matches!(orc.reject_suggestion("S1", &s.id), Err(TuneError::InvalidValue(_))));
        assert!(matches!(orc.reject_suggestion("S1", "nope"), Err(TuneError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_analyze_ranks_and_publishes() {
        let config = OrchestratorConfig {
            learning: LearningConfig { min_pattern_samples: 1, ..LearningConfig::default() },
            ..OrchestratorConfig::default()
        };
        let orc = start(config).await;
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.6, "manual", 0.9).unwrap();
        orc.adjust_knob("S1", "culture", "cohesion", 0.8, "manual", 0.4).unwrap();
        let both = vec![tax(), KnobKey::new("culture", "cohesion")];
        orc.record_outcome(GameOutcome::new("S1", "gdp", 1.0, both)).unwrap();
        orc.flush().await.unwrap();

        let ranked = orc.analyze_and_recommend("S1").unwrap();
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].score() >= ranked[1].score());
        assert!(matches!(orc.analyze_and_recommend("ghost"), Err(TuneError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_pairs_knobs_that_succeed_together() {
        use crate::tuning::learning::{CorrelationEvidence, CorrelationStrength};

        let config = OrchestratorConfig {
            learning: LearningConfig { min_pattern_samples: 1, ..LearningConfig::default() },
            ..OrchestratorConfig::default()
        };
        let orc = start(config).await;
        let cohesion = KnobKey::new("culture", "cohesion");
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.6, "manual", 0.9).unwrap();
        orc.adjust_knob("S1", "culture", "cohesion", 0.8, "manual", 0.9).unwrap();
        let both = vec![tax(), cohesion.clone()];
        orc.record_outcome(GameOutcome::new("S1", "gdp", 1.0, both)).unwrap();
        orc.flush().await.unwrap();
        orc.analyze_and_recommend("S1").unwrap();

        let report = orc.cleanup(30).unwrap();
        assert_eq!(report.learning.correlations_recorded, 1);

        let correlations = orc.correlation_patterns("S1").unwrap();
        assert_eq!(correlations.len(), 3);
        let pair = correlations.iter().find(|c| c.partner.is_some()).unwrap();
        assert_eq!(pair.knob, cohesion);
        assert_eq!(pair.partner, Some(tax()));
        assert_eq!(pair.strength, CorrelationStrength::Strong);
        let seeds = correlations
            .iter()
            .filter(|c| matches!(c.evidence, CorrelationEvidence::Recommendation { .. }))
            .count();
        assert_eq!(seeds, 2);
        assert!(matches!(orc.correlation_patterns("ghost"), Err(TuneError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_analyze_without_data_is_empty_and_silent() {
        let orc = start(OrchestratorConfig::default()).await;
        let before = orc.bus().published();
        assert!(orc.analyze_and_recommend("S1").unwrap().is_empty());
        orc.flush().await.unwrap();
        assert_eq!(orc.bus().published(), before);
    }

    #[tokio::test]
    async fn test_record_outcome_rejects_unknown_knob_synchronously() {
        let orc = start(OrchestratorConfig::default()).await;
        let unknown = GameOutcome::new("S1", "gdp", 1.0, vec![KnobKey::new("fiscal", "nope")]);
        let err = orc.record_outcome(unknown).unwrap_err();
        assert!(matches!(err, TuneError::NotFound { what: "knob", .. }));
    }

    #[tokio::test]
    async fn test_stats_merge_components() {
        let orc = start(OrchestratorConfig::default()).await;
        orc.adjust_knob("S1", "fiscal", "taxRate", 0.8, "manual", 0.9).unwrap();
        orc.record_event(TelemetryEvent::new("S1", "tick", "fiscal", 1.0)).unwrap();
        orc.flush().await.unwrap();
        let stats = orc.stats();
        assert_eq!(stats.registered_subjects, 1);
        assert_eq!(stats.telemetry.total_adjustments, 1);
        assert_eq!(stats.telemetry.total_events, 1);
        assert!(stats.pipeline.running);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_adjustments"], 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_pipeline() {
        let orc = start(OrchestratorConfig::default()).await;
        orc.shutdown().await;
        assert!(!orc.status().running);
        assert!(matches!(orc.flush().await, Err(TuneError::Unavailable(_))));
        // Commits still succeed; only the side effects are dropped.
        assert!(orc.adjust_knob("S1", "fiscal", "taxRate", 0.2, "late", 0.5).is_ok());
    }
}
