//! # Stage: Knob Registry
//!
//! ## Responsibility
//! Owns the knob schema (one [`KnobDescriptor`] per module/knob, immutable once
//! built) and the current value of every knob for every registered subject.
//! Validates and clamps adjustments and produces the [`KnobAdjustment`] record
//! for each committed change.
//!
//! ## Guarantees
//! - Bounded: every stored value lies in `[min, max]` of its descriptor
//! - Clamping, not rejection: out-of-range requests store the nearest bound
//! - Per-knob linearization: each knob has its own lock; adjustments to
//!   different knobs of one subject never contend
//! - Idempotent registration: registering a known subject is a no-op
//!
//! ## NOT Responsible For
//! - Recording adjustments (telemetry store)
//! - Publishing events (orchestrator pipeline)

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{TuneError, TuneResult};
use crate::now_ms;

// ---------------------------------------------------------------------------
// KnobKey
// ---------------------------------------------------------------------------

/// `(module, knob)` pair. Displays and parses as `module.knob`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KnobKey {
    pub module: String,
    pub knob: String,
}

impl KnobKey {
    pub fn new(module: impl Into<String>, knob: impl Into<String>) -> Self {
        Self { module: module.into(), knob: knob.into() }
    }

    /// Parse `"module.knob"`. The module part may not contain a dot; the knob
    /// part is everything after the first one.
    pub fn parse(s: &str) -> TuneResult<Self> {
        match s.trim().split_once('.') {
            Some((module, knob)) if !module.is_empty() && !knob.is_empty() => {
                Ok(Self::new(module, knob))
            }
            _ => Err(TuneError::InvalidValue(format!(
                "knob reference '{s}' is not of the form module.knob"
            ))),
        }
    }
}

impl std::fmt::Display for KnobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.knob)
    }
}

// ---------------------------------------------------------------------------
// KnobDescriptor: bounds and default for one knob
// ---------------------------------------------------------------------------

/// Schema entry for a single tunable knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobDescriptor {
    pub module: String,
    pub name: String,
    /// Value every subject starts with.
    pub default: f64,
    /// Minimum allowed value (inclusive).
    pub min: f64,
    /// Maximum allowed value (inclusive).
    pub max: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl KnobDescriptor {
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        default: f64,
        min: f64,
        max: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            default,
            min,
            max,
            description: description.into(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn key(&self) -> KnobKey {
        KnobKey::new(self.module.clone(), self.name.clone())
    }

    /// Clamp a candidate value to `[min, max]`.
    pub fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }

    /// Width of the allowed interval.
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Reject descriptors that could not hold a valid knob.
    pub fn validate(&self) -> TuneResult<()> {
        let key = format!("{}.{}", self.module, self.name);
        if self.module.trim().is_empty() || self.name.trim().is_empty() {
            return Err(TuneError::InvalidValue(format!(
                "knob '{key}' has an empty module or name"
            )));
        }
        if self.module.contains('.') {
            return Err(TuneError::InvalidValue(format!(
                "module name '{}' may not contain '.'",
                self.module
            )));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.default.is_finite()) {
            return Err(TuneError::InvalidValue(format!(
                "knob '{key}' has non-finite bounds or default"
            )));
        }
        if self.min > self.max {
            return Err(TuneError::InvalidValue(format!(
                "knob '{key}' has min {} greater than max {}",
                self.min, self.max
            )));
        }
        if self.default < self.min || self.default > self.max {
            return Err(TuneError::InvalidValue(format!(
                "knob '{key}' default {} lies outside [{}, {}]",
                self.default, self.min, self.max
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KnobSchema
// ---------------------------------------------------------------------------

/// Collects descriptors at startup. Each is validated on insertion.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    descriptors: BTreeMap<KnobKey, KnobDescriptor>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knob(mut self, descriptor: KnobDescriptor) -> TuneResult<Self> {
        descriptor.validate()?;
        let key = descriptor.key();
        if self.descriptors.contains_key(&key) {
            return Err(TuneError::InvalidValue(format!("knob '{key}' registered twice")));
        }
        self.descriptors.insert(key, descriptor);
        Ok(self)
    }

    pub fn knobs<I>(self, descriptors: I) -> TuneResult<Self>
    where
        I: IntoIterator<Item = KnobDescriptor>,
    {
        descriptors.into_iter().try_fold(self, |b, d| b.knob(d))
    }

    pub fn build(self) -> KnobSchema {
        KnobSchema { descriptors: self.descriptors }
    }
}

/// The immutable set of knob descriptors shared by every subject.
#[derive(Debug, Clone, Default)]
pub struct KnobSchema {
    descriptors: BTreeMap<KnobKey, KnobDescriptor>,
}

impl KnobSchema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn get(&self, key: &KnobKey) -> Option<&KnobDescriptor> {
        self.descriptors.get(key)
    }

    pub fn lookup(&self, module: &str, knob: &str) -> TuneResult<&KnobDescriptor> {
        self.descriptors
            .get(&KnobKey::new(module, knob))
            .ok_or_else(|| TuneError::knob_not_found(module, knob))
    }

    /// Descriptors ordered by module, then knob name.
    pub fn iter(&self) -> impl Iterator<Item = &KnobDescriptor> {
        self.descriptors.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &KnobKey> {
        self.descriptors.keys()
    }

    pub fn modules(&self) -> Vec<&str> {
        let mut mods: Vec<&str> = self.descriptors.keys().map(|k| k.module.as_str()).collect();
        mods.dedup();
        mods
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Structured context supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectContext {
    /// Free-form labels such as `campaign_id` or `player_id`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Numeric attributes of the simulated entity at registration time.
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

impl SubjectContext {
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub registered_at_ms: u64,
    pub context: SubjectContext,
}

#[derive(Debug, Clone, Copy)]
struct KnobState {
    value: f64,
    last_adjusted_ms: Option<u64>,
}

/// Read-only view of one knob of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobView {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub last_adjusted_ms: Option<u64>,
}

struct SubjectEntry {
    subject: Subject,
    knobs: HashMap<KnobKey, Mutex<KnobState>>,
}

// ---------------------------------------------------------------------------
// KnobAdjustment: the committed change record
// ---------------------------------------------------------------------------

/// Magnitude of a change relative to the knob's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactClass {
    Minimal,
    Moderate,
    Significant,
    Major,
}

impl ImpactClass {
    pub fn classify(descriptor: &KnobDescriptor, old_value: f64, new_value: f64) -> Self {
        let range = descriptor.range();
        let frac = if range > 0.0 { (new_value - old_value).abs() / range } else { 0.0 };
        if frac < 0.05 {
            ImpactClass::Minimal
        } else if frac < 0.15 {
            ImpactClass::Moderate
        } else if frac < 0.30 {
            ImpactClass::Significant
        } else {
            ImpactClass::Major
        }
    }
}

/// One committed adjustment. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobAdjustment {
    pub id: String,
    pub subject_id: String,
    pub module: String,
    pub knob: String,
    pub old_value: f64,
    /// The stored value, after clamping.
    pub new_value: f64,
    /// The value the caller asked for.
    pub requested_value: f64,
    pub reason: String,
    pub confidence: f64,
    pub impact: ImpactClass,
    pub timestamp_ms: u64,
}

impl KnobAdjustment {
    pub fn key(&self) -> KnobKey {
        KnobKey::new(self.module.clone(), self.knob.clone())
    }

    pub fn delta(&self) -> f64 {
        self.new_value - self.old_value
    }

    pub fn was_clamped(&self) -> bool {
        self.requested_value != self.new_value
    }
}

// ---------------------------------------------------------------------------
// KnobRegistry
// ---------------------------------------------------------------------------

/// Current knob values for every registered subject.
///
/// The subject map is read-mostly (written only on first registration); each
/// knob value sits behind its own mutex.
pub struct KnobRegistry {
    schema: Arc<KnobSchema>,
    subjects: RwLock<HashMap<String, Arc<SubjectEntry>>>,
}

impl KnobRegistry {
    pub fn new(schema: Arc<KnobSchema>) -> Self {
        Self { schema, subjects: RwLock::new(HashMap::new()) }
    }

    pub fn schema(&self) -> &Arc<KnobSchema> {
        &self.schema
    }

    /// Register a subject, seeding every knob from its descriptor default.
    ///
    /// Returns the subject and `true` when it was newly created. A known
    /// subject keeps its original context and values. Ids are matched
    /// exactly, so surrounding whitespace is rejected rather than trimmed.
    pub fn register(&self, id: &str, context: SubjectContext) -> TuneResult<(Subject, bool)> {
        if id.trim().is_empty() {
            return Err(TuneError::InvalidValue("subject id may not be empty".into()));
        }
        if id.trim() != id {
            return Err(TuneError::InvalidValue(format!(
                "subject id '{id}' has leading or trailing whitespace"
            )));
        }
        if let Some(entry) = self.read()?.get(id) {
            return Ok((entry.subject.clone(), false));
        }

        let mut guard = self.subjects.write().map_err(|_| TuneError::poisoned("registry"))?;
        // Another writer may have won the race between the two locks.
        if let Some(entry) = guard.get(id) {
            return Ok((entry.subject.clone(), false));
        }
        let subject = Subject { id: id.to_string(), registered_at_ms: now_ms(), context };
        let knobs = self
            .schema
            .iter()
            .map(|d| (d.key(), Mutex::new(KnobState { value: d.default, last_adjusted_ms: None })))
            .collect();
        guard.insert(id.to_string(), Arc::new(SubjectEntry { subject: subject.clone(), knobs }));
        Ok((subject, true))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().map(|g| g.contains_key(id)).unwrap_or(false)
    }

    pub fn subject(&self, id: &str) -> TuneResult<Subject> {
        Ok(self.entry(id)?.subject.clone())
    }

    /// Ids of all registered subjects, sorted.
    pub fn subject_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.read().map(|g| g.keys().cloned().collect()).unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every knob of a subject, keyed by `module.knob`.
    pub fn knob_states(&self, id: &str) -> TuneResult<BTreeMap<String, KnobView>> {
        let entry = self.entry(id)?;
        let mut out = BTreeMap::new();
        for desc in self.schema.iter() {
            let key = desc.key();
            let Some(cell) = entry.knobs.get(&key) else { continue };
            let state = *cell.lock().map_err(|_| TuneError::poisoned("knob state"))?;
            out.insert(
                key.to_string(),
                KnobView {
                    value: state.value,
                    min: desc.min,
                    max: desc.max,
                    default: desc.default,
                    last_adjusted_ms: state.last_adjusted_ms,
                },
            );
        }
        Ok(out)
    }

    /// Current value of one knob.
    pub fn value(&self, id: &str, key: &KnobKey) -> TuneResult<f64> {
        let entry = self.entry(id)?;
        let cell = entry
            .knobs
            .get(key)
            .ok_or_else(|| TuneError::knob_not_found(&key.module, &key.knob))?;
        let value = cell.lock().map_err(|_| TuneError::poisoned("knob state"))?.value;
        Ok(value)
    }

    /// Commit a new value for one knob.
    ///
    /// The requested value is clamped into the descriptor's bounds; the
    /// confidence is clamped into `[0, 1]`. Non-finite inputs are rejected.
    pub fn adjust(
        &self,
        id: &str,
        module: &str,
        knob: &str,
        requested: f64,
        reason: &str,
        confidence: f64,
    ) -> TuneResult<KnobAdjustment> {
        if !requested.is_finite() {
            return Err(TuneError::InvalidValue(format!(
                "requested value {requested} for {module}.{knob} is not a finite number"
            )));
        }
        if !confidence.is_finite() {
            return Err(TuneError::InvalidValue(format!(
                "confidence {confidence} is not a finite number"
            )));
        }
        let entry = self.entry(id)?;
        let descriptor = self.schema.lookup(module, knob)?;
        let key = descriptor.key();
        let cell = entry.knobs.get(&key).ok_or_else(|| TuneError::knob_not_found(module, knob))?;
        let new_value = descriptor.clamp(requested);

        let mut state = cell.lock().map_err(|_| TuneError::poisoned("knob state"))?;
        let old_value = state.value;
        // Stamped under the lock so timestamps follow commit order per knob.
        let timestamp_ms = now_ms();
        state.value = new_value;
        state.last_adjusted_ms = Some(timestamp_ms);
        drop(state);

        Ok(KnobAdjustment {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: entry.subject.id.clone(),
            module: key.module,
            knob: key.knob,
            old_value,
            new_value,
            requested_value: requested,
            reason: reason.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            impact: ImpactClass::classify(descriptor, old_value, new_value),
            timestamp_ms,
        })
    }

    // --- internal ---

    fn read(
        &self,
    ) -> TuneResult<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SubjectEntry>>>> {
        self.subjects.read().map_err(|_| TuneError::poisoned("registry"))
    }

    fn entry(&self, id: &str) -> TuneResult<Arc<SubjectEntry>> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| TuneError::subject_not_found(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn schema() -> Arc<KnobSchema> {
        Arc::new(
            KnobSchema::builder()
                .knob(KnobDescriptor::new("fiscal", "taxRate", 0.5, 0.0, 1.0, "Tax rate"))
                .unwrap()
                .knob(KnobDescriptor::new("fiscal", "spending", 50.0, 0.0, 100.0, "Spending level"))
                .unwrap()
                .knob(KnobDescriptor::new("culture", "cohesion", 0.7, 0.0, 1.0, "Cohesion"))
                .unwrap()
                .build(),
        )
    }

    fn registry() -> KnobRegistry {
        let reg = KnobRegistry::new(schema());
        reg.register("S1", SubjectContext::default()).unwrap();
        reg
    }

    // ===== KnobKey =====

    #[test]
    fn test_knob_key_display_and_parse() {
        let key = KnobKey::parse("fiscal.taxRate").unwrap();
        assert_eq!(key, KnobKey::new("fiscal", "taxRate"));
        assert_eq!(key.to_string(), "fiscal.taxRate");
    }

    #[rstest]
    #[case("fiscal")]
    #[case(".taxRate")]
    #[case("fiscal.")]
    #[case("")]
    fn test_knob_key_parse_rejects_malformed(#[case] input: &str) {
        assert!(matches!(KnobKey::parse(input), Err(TuneError::InvalidValue(_))));
    }

    // ===== KnobDescriptor =====

    #[rstest]
    #[case(KnobDescriptor::new("m", "k", 0.5, 1.0, 0.0, ""))]
    #[case(KnobDescriptor::new("m", "k", 2.0, 0.0, 1.0, ""))]
    #[case(KnobDescriptor::new("m", "k", f64::NAN, 0.0, 1.0, ""))]
    #[case(KnobDescriptor::new("", "k", 0.5, 0.0, 1.0, ""))]
    #[case(KnobDescriptor::new("a.b", "k", 0.5, 0.0, 1.0, ""))]
    fn test_descriptor_validation_rejects(#[case] d: KnobDescriptor) {
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_schema_rejects_duplicate_knob() {
        let d = KnobDescriptor::new("fiscal", "taxRate", 0.5, 0.0, 1.0, "");
        let result = KnobSchema::builder().knob(d.clone()).unwrap().knob(d);
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_modules_deduplicated_and_ordered() {
        assert_eq!(schema().modules(), vec!["culture", "fiscal"]);
    }

    #[rstest]
    #[case(0.51, ImpactClass::Minimal)]
    #[case(0.6, ImpactClass::Moderate)]
    #[case(0.7, ImpactClass::Significant)]
    #[case(1.0, ImpactClass::Major)]
    fn test_impact_classification(#[case] new_value: f64, #[case] expected: ImpactClass) {
        let d = KnobDescriptor::new("fiscal", "taxRate", 0.5, 0.0, 1.0, "");
        assert_eq!(ImpactClass::classify(&d, 0.5, new_value), expected);
    }

    // ===== Registration =====

    #[test]
    fn test_register_seeds_defaults() {
        let reg = registry();
        let states = reg.knob_states("S1").unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states["fiscal.taxRate"].value, 0.5);
        assert_eq!(states["fiscal.spending"].value, 50.0);
        assert!(states["culture.cohesion"].last_adjusted_ms.is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = registry();
        reg.adjust("S1", "fiscal", "taxRate", 0.9, "t", 1.0).unwrap();
        let (_, created) =
            reg.register("S1", SubjectContext::default().with_label("x", "y")).unwrap();
        assert!(!created);
        assert_eq!(reg.value("S1", &KnobKey::new("fiscal", "taxRate")).unwrap(), 0.9);
        assert!(reg.subject("S1").unwrap().context.labels.is_empty());
    }

    #[test]
    fn test_register_empty_id_rejected() {
        let reg = registry();
        let result = reg.register("  ", SubjectContext::default());
        assert!(matches!(result, Err(TuneError::InvalidValue(_))));
    }

    #[rstest]
    #[case(" S2")]
    #[case("S2 ")]
    #[case("\tS2\n")]
    fn test_register_padded_id_rejected(#[case] id: &str) {
        let reg = registry();
        let result = reg.register(id, SubjectContext::default());
        assert!(matches!(result, Err(TuneError::InvalidValue(_))));
        assert!(!reg.contains("S2"));
        assert!(!reg.contains(id));
    }

    #[test]
    fn test_knob_states_unknown_subject() {
        let reg = registry();
        let result = reg.knob_states("nope");
        assert!(matches!(result, Err(TuneError::NotFound { what: "subject", .. })));
    }

    // ===== Adjustment =====

    #[test]
    fn test_adjust_in_range_stores_exact_value() {
        let reg = registry();
        let adj = reg.adjust("S1", "fiscal", "taxRate", 0.8, "test", 0.9).unwrap();
        assert_eq!(adj.old_value, 0.5);
        assert_eq!(adj.new_value, 0.8);
        assert!(!adj.was_clamped());
        assert_eq!(reg.knob_states("S1").unwrap()["fiscal.taxRate"].value, 0.8);
    }

    #[rstest]
    #[case(1.5, 1.0)]
    #[case(-3.0, 0.0)]
    #[case(f64::MAX, 1.0)]
    fn test_adjust_out_of_range_clamps(#[case] requested: f64, #[case] stored: f64) {
        let reg = registry();
        let adj = reg.adjust("S1", "fiscal", "taxRate", requested, "test", 0.9).unwrap();
        assert_eq!(adj.new_value, stored);
        assert_eq!(adj.requested_value, requested);
        assert_eq!(reg.value("S1", &KnobKey::new("fiscal", "taxRate")).unwrap(), stored);
    }

    #[test]
    fn test_adjust_non_finite_rejected() {
        let reg = registry();
        let err = reg.adjust("S1", "fiscal", "taxRate", f64::NAN, "t", 0.5).unwrap_err();
        assert!(matches!(err, TuneError::InvalidValue(_)));
        assert_eq!(reg.value("S1", &KnobKey::new("fiscal", "taxRate")).unwrap(), 0.5);
    }

    #[test]
    fn test_adjust_unknown_knob_not_found() {
        let reg = registry();
        let err = reg.adjust("S1", "fiscal", "nope", 0.1, "t", 0.5).unwrap_err();
        assert!(matches!(err, TuneError::NotFound { what: "knob", .. }));
    }

    #[test]
    fn test_adjust_confidence_clamped() {
        let reg = registry();
        let adj = reg.adjust("S1", "fiscal", "taxRate", 0.6, "t", 7.0).unwrap();
        assert_eq!(adj.confidence, 1.0);
    }

    #[test]
    fn test_adjust_sets_last_adjusted() {
        let reg = registry();
        let adj = reg.adjust("S1", "culture", "cohesion", 0.2, "t", 0.5).unwrap();
        let view = &reg.knob_states("S1").unwrap()["culture.cohesion"];
        assert_eq!(view.last_adjusted_ms, Some(adj.timestamp_ms));
    }

    #[test]
    fn test_concurrent_adjustments_same_knob_form_one_chain() {
        let reg = Arc::new(registry());
        let default = 0.5;
        // Distinct, in bounds, and never equal to the default.
        let values: Vec<f64> = (0..16).map(|i| 0.01 + i as f64 * 0.05).collect();
        let adjustments: Vec<KnobAdjustment> = std::thread::scope(|s| {
            let handles: Vec<_> = values
                .iter()
                .map(|&v| {
                    let reg = Arc::clone(&reg);
                    s.spawn(move || reg.adjust("S1", "fiscal", "taxRate", v, "race", 0.5).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(adjustments.len(), 16);

        // Exactly one adjustment replaced the default.
        let heads: Vec<&KnobAdjustment> =
            adjustments.iter().filter(|a| a.old_value == default).collect();
        assert_eq!(heads.len(), 1);

        // Every other adjustment replaced a distinct predecessor's value.
        let mut predecessors: Vec<usize> = adjustments
            .iter()
            .filter(|a| a.old_value != default)
            .map(|a| {
                adjustments
                    .iter()
                    .position(|p| p.new_value == a.old_value)
                    .expect("old_value written by another adjustment")
            })
            .collect();
        predecessors.sort_unstable();
        predecessors.dedup();
        assert_eq!(predecessors.len(), 15);

        // The tail is the one adjustment nobody replaced, and it is stored.
        let tails: Vec<&KnobAdjustment> = adjustments
            .iter()
            .filter(|a| !adjustments.iter().any(|b| b.old_value == a.new_value))
            .collect();
        assert_eq!(tails.len(), 1);
        let stored = reg.value("S1", &KnobKey::new("fiscal", "taxRate")).unwrap();
        assert_eq!(stored, tails[0].new_value);
    }

    #[test]
    fn test_concurrent_adjustments_different_knobs_independent() {
        let reg = Arc::new(registry());
        std::thread::scope(|s| {
            let r1 = Arc::clone(&reg);
            let r2 = Arc::clone(&reg);
            s.spawn(move || {
                for i in 0..100 {
                    r1.adjust("S1", "fiscal", "spending", i as f64, "a", 0.5).unwrap();
                }
            });
            s.spawn(move || {
                for i in 0..100 {
                    r2.adjust("S1", "culture", "cohesion", i as f64 / 100.0, "b", 0.5).unwrap();
                }
            });
        });
        let states = reg.knob_states("S1").unwrap();
        assert_eq!(states["fiscal.spending"].value, 99.0);
        assert_eq!(states["culture.cohesion"].value, 0.99);
    }
}
