//! Persona vocabulary and accept/skip rules.
//!
//! A row is accepted only when the model's persona string is an exact member
//! of the closed vocabulary. Near misses can be repaired afterwards by the
//! fuzzy pass, which picks the closest vocabulary entry by normalized edit
//! distance when it clears the configured similarity threshold.

use crate::run_config::PersonaConfig;

pub const NO_RESPONSE_REASON: &str = "No LLM response";

#[derive(Debug, Clone)]
pub struct PersonaVocabulary {
    names: Vec<String>,
    fuzzy_correction: bool,
    fuzzy_threshold: f64,
}

impl PersonaVocabulary {
    pub fn from_config(cfg: &PersonaConfig) -> Self {
        Self {
            names: cfg.valid.clone(),
            fuzzy_correction: cfg.fuzzy_correction,
            fuzzy_threshold: cfg.fuzzy_threshold,
        }
    }

    pub fn contains(&self, persona: &str) -> bool {
        self.names.iter().any(|n| n == persona)
    }

    /// Why a row with this persona value must be skipped, or None to accept.
    pub fn skip_reason(&self, persona: Option<&str>) -> Option<String> {
        let persona = persona.unwrap_or("").trim();
        if persona.is_empty() {
            return Some(NO_RESPONSE_REASON.to_string());
        }
        if !self.contains(persona) {
            return Some(format!("Invalid persona: {persona}"));
        }
        None
    }

    /// Closest vocabulary entry at or above the similarity threshold.
    /// Exact matches short-circuit; empty candidates never match.
    pub fn closest_match(&self, candidate: &str) -> Option<&str> {
        if !self.fuzzy_correction {
            return None;
        }
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }
        if let Some(exact) = self.names.iter().find(|n| n.as_str() == candidate) {
            return Some(exact);
        }
        self.names
            .iter()
            .map(|n| (n, strsim::normalized_levenshtein(candidate, n)))
            .filter(|(_, sim)| *sim >= self.fuzzy_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(n, _)| n.as_str())
    }
}
