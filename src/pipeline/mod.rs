//! Classification pipeline.
//!
//! Two interchangeable classification sources (the synchronous chunked
//! streaming enricher and the asynchronous batch job) feed the same
//! finalize stage, which merges LLM output with the input table and decides
//! accept/skip per row.

pub mod batch;
pub mod streaming;

use std::collections::HashMap;

use crate::error::AppResult;
use crate::input::Prospect;
use crate::output::{AcceptedRecord, SkippedRecord};
use crate::parsing::PersonaAssignment;
use crate::personas::{PersonaVocabulary, NO_RESPONSE_REASON};

/// Raw classification output keyed by prospect id. Assignments are not
/// guaranteed to cover every input id, and may carry personas outside the
/// vocabulary; the finalize stage sorts that out.
#[derive(Debug, Default)]
pub struct ClassificationOutput {
    pub assignments: HashMap<String, PersonaAssignment>,
    /// Per-row errors (batch mode): id -> human-readable detail.
    pub errors: HashMap<String, String>,
}

pub trait ClassificationSource {
    fn classify(
        &mut self,
        rows: &[Prospect],
    ) -> impl std::future::Future<Output = AppResult<ClassificationOutput>> + Send;
}

#[derive(Debug, Default)]
pub struct EnrichmentOutcome {
    pub accepted: Vec<AcceptedRecord>,
    pub skipped: Vec<SkippedRecord>,
}

/// Merge classifications with the input rows. Every input id lands in
/// exactly one of accepted/skipped (duplicates keep the first occurrence);
/// the fuzzy pass may move an invalid-persona skip to accepted.
pub fn finalize(
    rows: &[Prospect],
    output: &ClassificationOutput,
    vocab: &PersonaVocabulary,
) -> EnrichmentOutcome {
    let mut outcome = EnrichmentOutcome::default();
    let mut seen = std::collections::HashSet::new();

    for row in rows {
        if !seen.insert(row.id.clone()) {
            continue;
        }
        let assignment = output.assignments.get(&row.id);
        let persona = assignment.map(|a| a.persona.as_str());
        let certainty = assignment.map(|a| a.certainty.clone());

        match vocab.skip_reason(persona) {
            None => outcome.accepted.push(AcceptedRecord {
                prospect_id: row.id.clone(),
                email: row.email.clone(),
                job_title: row.job_title.clone(),
                persona: persona.unwrap_or_default().to_string(),
                certainty: certainty.unwrap_or_default(),
            }),
            Some(reason) => {
                // Near-miss personas can be repaired against the vocabulary.
                if let Some(corrected) = persona.and_then(|p| vocab.closest_match(p)) {
                    tracing::info!(
                        prospect_id = %row.id,
                        from = persona.unwrap_or_default(),
                        to = corrected,
                        "fuzzy-corrected persona"
                    );
                    outcome.accepted.push(AcceptedRecord {
                        prospect_id: row.id.clone(),
                        email: row.email.clone(),
                        job_title: row.job_title.clone(),
                        persona: corrected.to_string(),
                        certainty: certainty.unwrap_or_default(),
                    });
                    continue;
                }

                let reason = if assignment.is_none() {
                    match output.errors.get(&row.id) {
                        Some(detail) => format!("Batch error: {detail}"),
                        None => NO_RESPONSE_REASON.to_string(),
                    }
                } else {
                    reason
                };
                outcome.skipped.push(SkippedRecord {
                    prospect_id: row.id.clone(),
                    email: row.email.clone(),
                    job_title: row.job_title.clone(),
                    persona: persona
                        .filter(|p| !p.trim().is_empty())
                        .map(str::to_string),
                    certainty,
                    skip_reason: reason,
                });
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_config::PersonaConfig;

    fn prospect(id: &str, title: &str) -> Prospect {
        Prospect {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            job_title: title.to_string(),
        }
    }

    fn vocab() -> PersonaVocabulary {
        PersonaVocabulary::from_config(&PersonaConfig::default())
    }

    fn assignment(persona: &str, certainty: &str) -> PersonaAssignment {
        PersonaAssignment {
            persona: persona.to_string(),
            certainty: certainty.to_string(),
        }
    }

    #[test]
    fn test_every_id_lands_exactly_once() {
        let rows = vec![
            prospect("1", "CTO"),
            prospect("2", "Gardener"),
            prospect("3", "CEO"),
            prospect("1", "CTO duplicate"),
        ];
        let mut output = ClassificationOutput::default();
        output
            .assignments
            .insert("1".into(), assignment("Technical Decision Maker", "90"));
        output
            .assignments
            .insert("2".into(), assignment("Completely Made Up", "50"));
        // id 3 got no answer at all.

        let outcome = finalize(&rows, &output, &vocab());

        let mut ids: Vec<String> = outcome
            .accepted
            .iter()
            .map(|r| r.prospect_id.clone())
            .chain(outcome.skipped.iter().map(|r| r.prospect_id.clone()))
            .collect();
        ids.sort();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.skipped.len(), 2);
    }

    #[test]
    fn test_skip_reasons() {
        let rows = vec![prospect("1", "CTO"), prospect("2", "CEO")];
        let mut output = ClassificationOutput::default();
        output
            .assignments
            .insert("1".into(), assignment("Chief Vibe Officer", "10"));

        let outcome = finalize(&rows, &output, &vocab());
        let by_id: HashMap<_, _> = outcome
            .skipped
            .iter()
            .map(|r| (r.prospect_id.clone(), r.skip_reason.clone()))
            .collect();
        assert_eq!(by_id["1"], "Invalid persona: Chief Vibe Officer");
        assert_eq!(by_id["2"], NO_RESPONSE_REASON);
    }

    #[test]
    fn test_batch_error_detail_in_reason() {
        let rows = vec![prospect("7", "CTO")];
        let mut output = ClassificationOutput::default();
        output
            .errors
            .insert("7".into(), "HTTP 500: upstream".to_string());

        let outcome = finalize(&rows, &output, &vocab());
        assert_eq!(outcome.skipped[0].skip_reason, "Batch error: HTTP 500: upstream");
    }

    #[test]
    fn test_fuzzy_pass_moves_near_miss_to_accepted() {
        let rows = vec![prospect("1", "Procurement Lead")];
        let mut output = ClassificationOutput::default();
        output
            .assignments
            .insert("1".into(), assignment("Economic  Buyer", "85"));

        let outcome = finalize(&rows, &output, &vocab());
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.accepted[0].persona, "Economic Buyer");
        assert_eq!(outcome.accepted[0].certainty, "85");
    }
}
