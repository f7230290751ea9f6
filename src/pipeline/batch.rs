//! Batch enrichment source.
//!
//! Builds one chat request per prospect, submits them as a provider-managed
//! batch job, polls to completion, and parses the JSONL output into per-row
//! assignments and errors. Raw job metadata and output are checkpointed
//! best-effort for post-mortems. Also hosts the rerun flow that re-submits
//! still-unclassified rows from a previous skipped CSV.

use std::collections::HashMap;

use anyhow::anyhow;
use indoc::indoc;

use crate::error::AppResult;
use crate::input::Prospect;
use crate::llm::batch::{
    delete_file, download_file_content, get_batch, poll_until_done, submit_batch, BatchJob,
    BatchRequestLine, PollSettings,
};
use crate::llm::ChatMessage;
use crate::output::{OutputWriter, SkippedRecord};
use crate::parsing::{parse_batch_output, parse_persona_json, sanitize_job_title};
use crate::personas::PersonaVocabulary;
use crate::pipeline::{finalize, ClassificationOutput, ClassificationSource, EnrichmentOutcome};

/// Strict per-row output contract appended to the system instructions; the
/// batch pipeline parses each answer as a single JSON object.
const BATCH_OUTPUT_CONTRACT: &str = indoc! {r#"
    CRITICAL OUTPUT FORMAT: Respond with a SINGLE JSON object only.
    Required keys: {"persona": <one of the defined personas>, "certainty": <0-100 integer or %>}.
    Do not include extra keys, code fences, or commentary."#
};

pub fn batch_system_prompt(system_instructions: &str) -> String {
    format!("{}\n\n{BATCH_OUTPUT_CONTRACT}", system_instructions.trim())
}

fn build_request_lines(
    rows: &[Prospect],
    system_prompt: &str,
    model: &str,
    temperature: f64,
) -> Vec<BatchRequestLine> {
    rows.iter()
        .map(|p| {
            let user = format!(
                "Prospect Id: {}\nJob Title: {}\n\nReturn ONLY the JSON.",
                p.id,
                sanitize_job_title(&p.job_title)
            );
            BatchRequestLine::chat(
                p.id.clone(),
                model,
                vec![ChatMessage::system(system_prompt), ChatMessage::user(user)],
                temperature,
            )
        })
        .collect()
}

pub struct BatchSource {
    http: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f64,
    completion_window: String,
    poll: PollSettings,
    system_prompt: String,
    writer: OutputWriter,
    /// Poll this existing job instead of uploading and creating a new one.
    pub resume_batch_id: Option<String>,
}

impl BatchSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        completion_window: impl Into<String>,
        poll: PollSettings,
        system_instructions: &str,
        writer: OutputWriter,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            completion_window: completion_window.into(),
            poll,
            system_prompt: batch_system_prompt(system_instructions),
            writer,
            resume_batch_id: None,
        }
    }

    async fn run_job(&self, rows: &[Prospect]) -> AppResult<BatchJob> {
        let job = match &self.resume_batch_id {
            Some(batch_id) => {
                tracing::info!(batch_id, "resuming batch job");
                get_batch(&self.http, &self.api_key, batch_id).await?
            }
            None => {
                let requests =
                    build_request_lines(rows, &self.system_prompt, &self.model, self.temperature);
                submit_batch(
                    &self.http,
                    &self.api_key,
                    &requests,
                    &self.completion_window,
                )
                .await
                .map_err(anyhow::Error::from)?
            }
        };

        let completed = poll_until_done(&self.http, &self.api_key, &job.id, &self.poll).await?;

        if !completed.status.is_success() {
            if let Ok(meta) = serde_json::to_string_pretty(&completed) {
                self.writer
                    .save_checkpoint_raw(&format!("batch_{}_meta", completed.id), &meta, "json");
            }
            return Err(anyhow!(
                "batch {} not completed: {:?}",
                completed.id,
                completed.status
            )
            .into());
        }

        Ok(completed)
    }
}

impl ClassificationSource for BatchSource {
    async fn classify(&mut self, rows: &[Prospect]) -> AppResult<ClassificationOutput> {
        let job = self.run_job(rows).await?;

        let output_file_id = job
            .output_file_id
            .clone()
            .ok_or_else(|| anyhow!("completed batch {} has no output file", job.id))?;
        let jsonl = download_file_content(&self.http, &self.api_key, &output_file_id).await?;
        self.writer
            .save_checkpoint_raw(&format!("batch_{}_output", job.id), &jsonl, "jsonl");

        let parsed = parse_batch_output(&jsonl);
        let mut output = ClassificationOutput {
            assignments: HashMap::new(),
            errors: parsed.errors,
        };
        for (id, content) in parsed.contents {
            match parse_persona_json(&content) {
                Ok(assignment) => {
                    output.assignments.insert(id, assignment);
                }
                Err(e) => {
                    let snippet: String = content.chars().take(160).collect();
                    output
                        .errors
                        .insert(id, format!("Invalid JSON: {e}: {snippet}"));
                }
            }
        }

        // Provider-side files are no longer needed once results are local.
        let cleanup: Vec<&str> = job
            .input_file_id
            .as_deref()
            .into_iter()
            .chain(std::iter::once(output_file_id.as_str()))
            .collect();
        futures::future::join_all(
            cleanup
                .into_iter()
                .map(|id| delete_file(&self.http, &self.api_key, id)),
        )
        .await;

        tracing::info!(
            batch_id = %job.id,
            answered = output.assignments.len(),
            errored = output.errors.len(),
            "batch output parsed"
        );
        Ok(output)
    }
}

// ============================================================================
// Rerun of previously skipped rows
// ============================================================================

/// Re-submit the rows of a skipped CSV that still lack a persona, then merge
/// the new answers over the old values (a new non-empty answer wins).
pub async fn rerun_skipped<S: ClassificationSource>(
    source: &mut S,
    skipped_rows: Vec<SkippedRecord>,
    vocab: &PersonaVocabulary,
) -> AppResult<Option<EnrichmentOutcome>> {
    let todo: Vec<Prospect> = skipped_rows
        .iter()
        .filter(|r| r.persona.as_deref().unwrap_or("").trim().is_empty())
        .map(|r| Prospect {
            id: r.prospect_id.clone(),
            email: r.email.clone(),
            job_title: r.job_title.clone(),
        })
        .collect();

    if todo.is_empty() {
        tracing::info!("no rows without persona in skipped CSV; nothing to re-run");
        return Ok(None);
    }
    tracing::info!(rows = todo.len(), "re-running skipped rows via batch");

    let mut output = source.classify(&todo).await?;

    // Rows that already carried a (previously invalid) persona keep their
    // old value unless the rerun produced a new one.
    for row in &skipped_rows {
        let old_persona = row.persona.as_deref().unwrap_or("").trim();
        if !old_persona.is_empty() && !output.assignments.contains_key(&row.prospect_id) {
            output.assignments.insert(
                row.prospect_id.clone(),
                crate::parsing::PersonaAssignment {
                    persona: old_persona.to_string(),
                    certainty: row.certainty.clone().unwrap_or_default(),
                },
            );
        }
    }

    let all_rows: Vec<Prospect> = skipped_rows
        .iter()
        .map(|r| Prospect {
            id: r.prospect_id.clone(),
            email: r.email.clone(),
            job_title: r.job_title.clone(),
        })
        .collect();

    Ok(Some(finalize(&all_rows, &output, vocab)))
}
