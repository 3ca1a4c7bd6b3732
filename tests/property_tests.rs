//! Property tests: knob values never leave their bounds, and learned rates
//! stay normalised whatever the adjustment and outcome sequence.

use std::sync::Arc;

use proptest::prelude::*;

use knob_tuner::tuning::learning::{LearningConfig, LearningEngine};
use knob_tuner::tuning::registry::KnobRegistry;
use knob_tuner::tuning::telemetry::{GameOutcome, TelemetryConfig, TelemetryStore};
use knob_tuner::{KnobDescriptor, KnobKey, KnobSchema, SubjectContext};

fn registry(min: f64, max: f64, default: f64) -> Arc<KnobRegistry> {
    let schema = KnobSchema::builder()
        .knob(KnobDescriptor::new("m", "k", default, min, max, ""))
        .unwrap()
        .build();
    let registry = Arc::new(KnobRegistry::new(Arc::new(schema)));
    registry.register("S", SubjectContext::default()).unwrap();
    registry
}

fn bounds() -> impl Strategy<Value = (f64, f64, f64)> {
    (-1000.0f64..1000.0, 0.001f64..1000.0, 0.0f64..=1.0)
        .prop_map(|(min, width, t)| (min, min + width, min + width * t))
}

proptest! {
    #[test]
    fn prop_adjust_stays_within_bounds(
        (min, max, default) in bounds(),
        requests in prop::collection::vec(-1e6f64..1e6, 1..20),
    ) {
        let reg = registry(min, max, default);
        for requested in requests {
            let adj = reg.adjust("S", "m", "k", requested, "prop", 0.5).unwrap();
            prop_assert!(adj.new_value >= min && adj.new_value <= max);
            if requested >= min && requested <= max {
                prop_assert_eq!(adj.new_value, requested);
            } else if requested < min {
                prop_assert_eq!(adj.new_value, min);
            } else {
                prop_assert_eq!(adj.new_value, max);
            }
            prop_assert_eq!(reg.value("S", &KnobKey::new("m", "k")).unwrap(), adj.new_value);
        }
    }

    #[test]
    fn prop_descriptor_clamp_is_idempotent((min, max, default) in bounds(), v in -1e6f64..1e6) {
        let d = KnobDescriptor::new("m", "k", default, min, max, "");
        let once = d.clamp(v);
        prop_assert_eq!(d.clamp(once), once);
    }

    #[test]
    fn prop_learned_rates_stay_normalised(
        steps in prop::collection::vec((-1.0f64..1.0, -5.0f64..5.0, 0.0f64..=1.0), 1..15),
    ) {
        let reg = registry(-10.0, 10.0, 0.0);
        let telemetry = Arc::new(TelemetryStore::new(Arc::clone(&reg), TelemetryConfig::default()));
        let config = LearningConfig::default();
        let learning = LearningEngine::new(Arc::clone(&reg), Arc::clone(&telemetry), config);
        let key = KnobKey::new("m", "k");
        let mut previous_samples = 0u64;

        for (delta, outcome_value, confidence) in steps {
            let current = reg.value("S", &key).unwrap();
            let adj = reg.adjust("S", "m", "k", current + delta, "prop", confidence).unwrap();
            let ts = adj.timestamp_ms;
            telemetry.record_adjustment(adj).unwrap();
            let outcome = GameOutcome::new("S", "score", outcome_value, vec![key.clone()]).at(ts);
            telemetry.record_outcome(outcome.clone()).unwrap();
            learning.ingest_outcome(&outcome).unwrap();

            let patterns = learning.patterns("S").unwrap();
            let samples: u64 = patterns.iter().map(|p| p.sample_size).sum();
            prop_assert!(samples >= previous_samples);
            previous_samples = samples;
            for p in &patterns {
                prop_assert!((0.0..=1.0).contains(&p.success_rate));
                prop_assert!((0.0..=1.0).contains(&p.confidence));
            }
        }

        let metric = telemetry.effectiveness_report("S", "m", "k", true).unwrap();
        prop_assert!((0.0..=1.0).contains(&metric.effectiveness));
        prop_assert!((0.0..=1.0).contains(&metric.confidence));
    }
}
