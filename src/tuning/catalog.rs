//! Built-in knob catalog.
//!
//! Sixteen simulation modules with four knobs each, plus the `fiscal` module.
//! Deployments extend this with `[[knobs]]` entries in the config file.

use crate::error::TuneResult;
use crate::tuning::registry::{KnobDescriptor, KnobSchema};

/// `(module, knob, default, min, max, unit, description)`
type CatalogRow = (&'static str, &'static str, f64, f64, f64, &'static str, &'static str);

#[rustfmt::skip]
const BUILTIN: &[CatalogRow] = &[
    // fiscal
    ("fiscal", "taxRate", 0.5, 0.0, 1.0, "rate", "Base tax rate"),
    // business_cycle
    ("business_cycle", "cycle_volatility", 0.5, 0.0, 1.0, "intensity", "Business cycle volatility"),
    ("business_cycle", "expansion_duration", 1.0, 0.3, 3.0, "multiplier", "Expansion phase duration"),
    ("business_cycle", "recession_severity", 1.0, 0.1, 2.0, "multiplier", "Recession severity factor"),
    ("business_cycle", "recovery_speed", 1.0, 0.2, 2.5, "multiplier", "Economic recovery speed"),
    // world_wonders
    ("world_wonders", "construction_speed", 1.0, 0.2, 3.0, "multiplier", "Wonder construction speed"),
    ("world_wonders", "availability_rate", 0.6, 0.1, 1.0, "rate", "Wonder availability rate"),
    ("world_wonders", "cultural_impact", 1.0, 0.5, 2.0, "multiplier", "Cultural impact multiplier"),
    ("world_wonders", "maintenance_cost", 1.0, 0.3, 2.0, "multiplier", "Maintenance cost factor"),
    // political_systems
    ("political_systems", "multiparty_stability", 0.7, 0.0, 1.0, "stability", "Multiparty system stability"),
    ("political_systems", "polarization_tendency", 0.4, 0.0, 1.0, "tendency", "Political polarization tendency"),
    ("political_systems", "voter_turnout", 0.65, 0.3, 0.95, "rate", "Base voter turnout rate"),
    ("political_systems", "democratic_health", 0.7, 0.0, 1.0, "health", "Democratic health index"),
    // culture
    ("culture", "cultural_diversity", 0.6, 0.0, 1.0, "diversity", "Cultural diversity level"),
    ("culture", "social_cohesion", 0.7, 0.0, 1.0, "cohesion", "Social cohesion strength"),
    ("culture", "tradition_preservation", 0.5, 0.0, 1.0, "preservation", "Tradition preservation rate"),
    ("culture", "innovation_acceptance", 0.6, 0.0, 1.0, "acceptance", "Cultural innovation acceptance"),
    // treasury
    ("treasury", "tax_efficiency", 0.7, 0.3, 1.0, "efficiency", "Tax collection efficiency"),
    ("treasury", "spending_transparency", 0.6, 0.0, 1.0, "transparency", "Government spending transparency"),
    ("treasury", "budget_discipline", 0.5, 0.0, 1.0, "discipline", "Budget discipline level"),
    ("treasury", "revenue_diversification", 0.4, 0.0, 1.0, "diversification", "Revenue source diversification"),
    // character_awareness
    ("character_awareness", "story_awareness", 0.7, 0.0, 1.0, "awareness", "Character story awareness level"),
    ("character_awareness", "game_state_knowledge", 0.6, 0.0, 1.0, "knowledge", "Game state knowledge depth"),
    ("character_awareness", "specialty_expertise", 0.8, 0.0, 1.0, "expertise", "Specialty area expertise"),
    ("character_awareness", "contextual_adaptation", 0.5, 0.0, 1.0, "adaptation", "Contextual adaptation ability"),
    // national_symbols
    ("national_symbols", "symbol_recognition", 0.8, 0.0, 1.0, "recognition", "National symbol recognition"),
    ("national_symbols", "cultural_significance", 0.7, 0.0, 1.0, "significance", "Cultural significance level"),
    ("national_symbols", "unity_impact", 0.6, 0.0, 1.0, "impact", "National unity impact"),
    ("national_symbols", "evolution_rate", 0.2, 0.0, 1.0, "rate", "Symbol evolution rate"),
    // missions
    ("missions", "generation_rate", 1.0, 0.1, 2.0, "rate", "Mission generation rate"),
    ("missions", "difficulty_scaling", 1.0, 0.3, 2.0, "scaling", "Mission difficulty scaling"),
    ("missions", "story_integration", 0.7, 0.0, 1.0, "integration", "Story integration level"),
    ("missions", "reward_scaling", 1.0, 0.5, 2.0, "scaling", "Mission reward scaling"),
    // debt_to_gdp
    ("debt_to_gdp", "debt_sustainability", 0.6, 0.0, 1.0, "sustainability", "Debt sustainability index"),
    ("debt_to_gdp", "borrowing_capacity", 0.7, 0.0, 1.0, "capacity", "Government borrowing capacity"),
    ("debt_to_gdp", "interest_sensitivity", 0.5, 0.0, 1.0, "sensitivity", "Interest rate sensitivity"),
    ("debt_to_gdp", "fiscal_discipline", 0.6, 0.0, 1.0, "discipline", "Fiscal discipline level"),
    // gamemaster_videos
    ("gamemaster_videos", "production_frequency", 1.0, 0.1, 2.0, "frequency", "Video production frequency"),
    ("gamemaster_videos", "content_quality", 0.7, 0.3, 1.0, "quality", "Content quality level"),
    ("gamemaster_videos", "narrative_impact", 0.8, 0.0, 1.0, "impact", "Narrative impact strength"),
    ("gamemaster_videos", "player_engagement", 0.6, 0.0, 1.0, "engagement", "Player engagement level"),
    // military_defense
    ("military_defense", "readiness_level", 0.7, 0.0, 1.0, "readiness", "Military readiness level"),
    ("military_defense", "joint_coordination", 0.6, 0.0, 1.0, "coordination", "Joint chiefs coordination"),
    ("military_defense", "defense_efficiency", 0.7, 0.3, 1.0, "efficiency", "Defense system efficiency"),
    ("military_defense", "threat_assessment", 0.8, 0.0, 1.0, "assessment", "Threat assessment accuracy"),
    // leader_speeches
    ("leader_speeches", "speech_frequency", 1.0, 0.1, 2.0, "frequency", "Leader speech frequency"),
    ("leader_speeches", "message_effectiveness", 0.7, 0.0, 1.0, "effectiveness", "Message effectiveness"),
    ("leader_speeches", "authenticity_level", 0.8, 0.0, 1.0, "authenticity", "Speech authenticity level"),
    ("leader_speeches", "issue_addressing", 0.6, 0.0, 1.0, "addressing", "Issue addressing completeness"),
    // address_nation
    ("address_nation", "broadcast_reach", 0.8, 0.3, 1.0, "reach", "National address broadcast reach"),
    ("address_nation", "message_impact", 0.7, 0.0, 1.0, "impact", "Message impact strength"),
    ("address_nation", "credibility_factor", 0.6, 0.0, 1.0, "credibility", "Leader credibility factor"),
    ("address_nation", "response_generation", 0.5, 0.0, 1.0, "response", "Public response generation"),
    // delegation
    ("delegation", "delegation_efficiency", 0.7, 0.3, 1.0, "efficiency", "Delegation efficiency"),
    ("delegation", "accountability_level", 0.6, 0.0, 1.0, "accountability", "Accountability enforcement"),
    ("delegation", "coordination_quality", 0.5, 0.0, 1.0, "coordination", "Inter-department coordination"),
    ("delegation", "authority_clarity", 0.8, 0.0, 1.0, "clarity", "Authority delegation clarity"),
    // witter_feed
    ("witter_feed", "content_generation", 1.0, 0.1, 2.0, "generation", "Content generation rate"),
    ("witter_feed", "engagement_quality", 0.6, 0.0, 1.0, "quality", "Engagement quality level"),
    ("witter_feed", "influence_reach", 0.7, 0.0, 1.0, "reach", "Social influence reach"),
    ("witter_feed", "content_diversity", 0.8, 0.0, 1.0, "diversity", "Content diversity level"),
    // whose_app
    ("whose_app", "user_adoption", 0.6, 0.0, 1.0, "adoption", "User adoption rate"),
    ("whose_app", "feature_satisfaction", 0.7, 0.0, 1.0, "satisfaction", "Feature satisfaction level"),
    ("whose_app", "connectivity_quality", 0.8, 0.0, 1.0, "connectivity", "Connection quality"),
    ("whose_app", "privacy_trust", 0.5, 0.0, 1.0, "trust", "Privacy trust level"),
];

/// Descriptors for every built-in knob, in catalog order.
pub fn builtin_descriptors() -> Vec<KnobDescriptor> {
    BUILTIN
        .iter()
        .map(|&(module, knob, default, min, max, unit, description)| {
            KnobDescriptor::new(module, knob, default, min, max, description).with_unit(unit)
        })
        .collect()
}

/// Build the process schema from the built-in catalog (unless disabled) and
/// any extra descriptors from configuration.
pub fn build_schema(include_builtin: bool, extra: Vec<KnobDescriptor>) -> TuneResult<KnobSchema> {
    let builder = KnobSchema::builder();
    let builder = if include_builtin { builder.knobs(builtin_descriptors())? } else { builder };
    Ok(builder.knobs(extra)?.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::registry::KnobKey;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let schema = build_schema(true, Vec::new()).unwrap();
        assert_eq!(schema.len(), 16 * 4 + 1);
        assert_eq!(schema.modules().len(), 17);
    }

    #[test]
    fn test_fiscal_tax_rate_present() {
        let schema = build_schema(true, Vec::new()).unwrap();
        let d = schema.get(&KnobKey::new("fiscal", "taxRate")).unwrap();
        assert_eq!((d.default, d.min, d.max), (0.5, 0.0, 1.0));
    }

    #[test]
    fn test_extra_knob_colliding_with_builtin_rejected() {
        let extra = vec![KnobDescriptor::new("fiscal", "taxRate", 0.1, 0.0, 1.0, "")];
        assert!(build_schema(true, extra).is_err());
    }

    #[test]
    fn test_builtin_disabled_uses_only_extra() {
        let extra = vec![KnobDescriptor::new("custom", "gain", 1.0, 0.0, 2.0, "Gain")];
        let schema = build_schema(false, extra).unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.modules(), vec!["custom"]);
    }
}
