//! Streaming enrichment: adaptive chunking, pacing, retries, multi-pass.
//!
//! Rows are sent in contiguous chunks over a persistent chat session. The
//! dispatcher paces calls to stay under a token-per-minute budget; the retry
//! layer absorbs transient failures with exponential backoff and halves the
//! chunk size on rate-limit signals (a ratchet: the reduction persists for
//! the rest of the pass, floored at the configured minimum). Up to
//! `max_passes` passes re-run rows that failed or produced no usable answer.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use itertools::Itertools;
use rand::Rng;

use crate::error::AppResult;
use crate::input::Prospect;
use crate::llm::chat::{ChatApi, ChatError, ChatSession};
use crate::parsing::{parse_llm_csv, sanitize_job_title, ParsedLine, PersonaAssignment};
use crate::personas::PersonaVocabulary;
use crate::run_config::StreamLimits;

use super::{ClassificationOutput, ClassificationSource};

fn estimate_tokens(rows: usize, limits: &StreamLimits) -> u64 {
    rows as u64 * limits.token_per_row
}

/// Sleep between chunks: long enough that the estimated token spend fits the
/// per-minute budget, never shorter than the base sleep. Jitter is added by
/// the caller.
pub(crate) fn pace_delay(limits: &StreamLimits, rows: usize) -> Duration {
    let est = estimate_tokens(rows, limits) as f64;
    let budget = limits.tpm_budget.max(1) as f64;
    Duration::from_secs_f64((est / budget * 60.0).max(limits.base_sleep_secs))
}

/// Backoff before retry `attempt` (0-based): exponential with jitter, capped.
pub(crate) fn backoff_delay(limits: &StreamLimits, attempt: u32, jitter: f64) -> f64 {
    let exp = limits.initial_backoff_secs * 2f64.powi(attempt as i32) + jitter;
    exp.min(limits.max_backoff_secs)
}

/// Halve, floored at the minimum chunk size.
pub(crate) fn shrink_chunk(min_chunk: usize, current: usize) -> usize {
    (current / 2).max(min_chunk)
}

/// Cumulative output is deduplicated by prospect id, first answer wins: a
/// later pass never overrides an id that already produced a line.
fn dedup_keep_first(lines: Vec<ParsedLine>) -> Vec<ParsedLine> {
    let mut seen = std::collections::HashSet::new();
    lines
        .into_iter()
        .filter(|l| seen.insert(l.prospect_id.clone()))
        .collect()
}

pub struct StreamingEnricher<C: ChatApi> {
    api: C,
    session: ChatSession,
    limits: StreamLimits,
    vocab: PersonaVocabulary,
}

impl<C: ChatApi + Send> StreamingEnricher<C> {
    pub fn new(
        api: C,
        session: ChatSession,
        limits: StreamLimits,
        vocab: PersonaVocabulary,
    ) -> Self {
        Self {
            api,
            session,
            limits,
            vocab,
        }
    }

    /// One chat call with up to `max_retries` attempts. Returns the reply and
    /// the (possibly reduced) chunk size to use from here on. Waits
    /// `max(server hint, capped exponential backoff)` between attempts.
    async fn call_with_retries(
        &mut self,
        payload: &str,
        chunk_size: usize,
    ) -> Result<(String, usize), ChatError> {
        let mut local_chunk = chunk_size;
        let mut attempt = 0u32;

        loop {
            match self.api.ask(&mut self.session, payload).await {
                Ok(reply) => return Ok((reply, local_chunk)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.limits.max_retries {
                        return Err(e);
                    }

                    let server_wait = e.retry_after_secs().unwrap_or(0.0);
                    let jitter = rand::thread_rng().gen_range(0.0..1.0);
                    let backoff = backoff_delay(&self.limits, attempt - 1, jitter);
                    let wait = server_wait.max(backoff);

                    if e.is_rate_limit() {
                        let shrunk = shrink_chunk(self.limits.min_chunk, local_chunk);
                        if shrunk < local_chunk {
                            tracing::warn!(
                                "rate limited: chunk {local_chunk} -> {shrunk}, retrying in {wait:.1}s"
                            );
                            local_chunk = shrunk;
                        } else {
                            tracing::warn!(
                                "rate limited at chunk floor {local_chunk}, retrying in {wait:.1}s"
                            );
                        }
                    } else {
                        tracing::warn!("chat call failed: {e}; retrying in {wait:.1}s");
                    }

                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }
}

impl<C: ChatApi + Send> ClassificationSource for StreamingEnricher<C> {
    async fn classify(&mut self, rows: &[Prospect]) -> AppResult<ClassificationOutput> {
        let limits = self.limits.clone();
        let mut chunk = limits.initial_chunk.clamp(limits.min_chunk, limits.max_chunk);
        let mut remaining: BTreeSet<String> = rows.iter().map(|p| p.id.clone()).collect();
        let mut raw_replies: Vec<String> = Vec::new();

        for pass in 1..=limits.max_passes {
            if remaining.is_empty() {
                break;
            }
            tracing::info!(
                pass,
                max_passes = limits.max_passes,
                remaining = remaining.len(),
                chunk,
                "starting pass"
            );

            let pass_rows: Vec<&Prospect> =
                rows.iter().filter(|p| remaining.contains(&p.id)).collect();
            let mut failed: BTreeSet<String> = BTreeSet::new();

            let mut i = 0;
            while i < pass_rows.len() {
                let end = (i + chunk).min(pass_rows.len());
                let slice = &pass_rows[i..end];
                let payload = slice
                    .iter()
                    .map(|p| format!("{},{}", p.id, sanitize_job_title(&p.job_title)))
                    .join("\n");

                match self.call_with_retries(&payload, chunk).await {
                    Ok((reply, new_chunk)) => {
                        if !reply.is_empty() {
                            raw_replies.push(reply);
                        }
                        chunk = new_chunk;
                    }
                    Err(e) => {
                        tracing::error!(
                            pass,
                            rows = slice.len(),
                            "chunk permanently failed this pass: {e}"
                        );
                        failed.extend(slice.iter().map(|p| p.id.clone()));
                    }
                }

                let pace = pace_delay(&limits, slice.len());
                let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..0.75));
                tokio::time::sleep(pace + jitter).await;
                i = end;
            }

            // Success is recomputed from the cumulative output of all passes.
            let parsed = dedup_keep_first(parse_llm_csv(&raw_replies.join("\n")));
            let ok_ids: BTreeSet<String> = parsed
                .iter()
                .filter(|l| self.vocab.contains(&l.persona))
                .map(|l| l.prospect_id.clone())
                .collect();

            let before = remaining.len();
            remaining = remaining.difference(&ok_ids).cloned().collect();
            remaining.extend(failed);
            tracing::info!(
                pass,
                processed = before.saturating_sub(remaining.len()),
                remaining = remaining.len(),
                "pass finished"
            );

            if !remaining.is_empty() {
                chunk = shrink_chunk(limits.min_chunk, chunk);
            }
        }

        let parsed = dedup_keep_first(parse_llm_csv(&raw_replies.join("\n")));
        let assignments: HashMap<String, PersonaAssignment> = parsed
            .into_iter()
            .map(|l| {
                (
                    l.prospect_id,
                    PersonaAssignment {
                        persona: l.persona,
                        certainty: l.certainty,
                    },
                )
            })
            .collect();

        Ok(ClassificationOutput {
            assignments,
            errors: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::finalize;
    use crate::run_config::PersonaConfig;
    use std::sync::Mutex;

    fn limits() -> StreamLimits {
        StreamLimits {
            tpm_budget: 1_000_000,
            base_sleep_secs: 0.1,
            max_retries: 3,
            initial_backoff_secs: 0.1,
            max_backoff_secs: 1.0,
            min_chunk: 1,
            max_chunk: 2,
            initial_chunk: 2,
            token_per_row: 1,
            max_passes: 3,
        }
    }

    fn vocab() -> PersonaVocabulary {
        PersonaVocabulary::from_config(&PersonaConfig::default())
    }

    fn prospects(n: usize) -> Vec<Prospect> {
        (1..=n)
            .map(|i| Prospect {
                id: i.to_string(),
                email: format!("p{i}@example.com"),
                job_title: format!("Title {i}"),
            })
            .collect()
    }

    #[test]
    fn test_shrink_chunk_halves_with_floor() {
        assert_eq!(shrink_chunk(10, 80), 40);
        assert_eq!(shrink_chunk(10, 21), 10);
        assert_eq!(shrink_chunk(10, 10), 10);
        assert_eq!(shrink_chunk(1, 2), 1);
        assert_eq!(shrink_chunk(1, 1), 1);
    }

    #[test]
    fn test_pace_delay_floors_at_base_sleep() {
        let limits = StreamLimits::default();
        // 10 rows -> 1200 tokens -> 0.2s of budget, below the 1.5s base.
        assert_eq!(pace_delay(&limits, 10), Duration::from_secs_f64(1.5));
        // 100 rows -> 12000 tokens -> 2.0s of budget.
        assert_eq!(pace_delay(&limits, 100), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn test_backoff_schedule_lower_bound() {
        let limits = StreamLimits::default();
        for k in 0..limits.max_retries {
            let expected = (limits.initial_backoff_secs * 2f64.powi(k as i32))
                .min(limits.max_backoff_secs);
            assert!(backoff_delay(&limits, k, 0.0) >= expected);
            // Jitter never lifts the wait past the cap plus nothing: the cap
            // applies to the jittered value too.
            assert!(backoff_delay(&limits, k, 0.999) <= limits.max_backoff_secs.max(expected + 1.0));
        }
        assert_eq!(backoff_delay(&limits, 10, 0.0), limits.max_backoff_secs);
    }

    /// Answers every id in the payload with a fixed persona, after returning
    /// scripted errors for the first `fail_first` calls. Records the number
    /// of rows in each payload it saw.
    struct FakeChat {
        fail_first: usize,
        error: fn() -> ChatError,
        calls: Mutex<Vec<usize>>,
        omit_id: Option<&'static str>,
    }

    impl FakeChat {
        fn reply_for(&self, payload: &str) -> String {
            payload
                .lines()
                .filter_map(|line| {
                    let (id, title) = line.split_once(',')?;
                    if self.omit_id == Some(id) {
                        return None;
                    }
                    Some(format!("{id},{title},Data User,90"))
                })
                .join("\n")
        }
    }

    impl ChatApi for FakeChat {
        async fn ask(
            &self,
            _session: &mut ChatSession,
            user_message: &str,
        ) -> Result<String, ChatError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(user_message.lines().count());
            if calls.len() <= self.fail_first {
                return Err((self.error)());
            }
            Ok(self.reply_for(user_message))
        }
    }

    fn rate_limit_error() -> ChatError {
        ChatError::Api {
            status: 429,
            message: "rate_limit_exceeded".to_string(),
            retry_after_secs: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_halves_chunk_for_remainder() {
        let fake = FakeChat {
            fail_first: 1,
            error: rate_limit_error,
            calls: Mutex::new(Vec::new()),
            omit_id: None,
        };
        let session = ChatSession::new("test-model", "sys");
        let mut enricher = StreamingEnricher::new(fake, session, limits(), vocab());

        let rows = prospects(3);
        let output = enricher.classify(&rows).await.unwrap();
        let outcome = finalize(&rows, &output, &vocab());

        // First chunk of 2 hits a 429, retries at the same payload, then the
        // halved size (1) applies to the remainder of the run.
        let calls = enricher.api.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![2, 2, 1]);
        assert_eq!(output.assignments.len(), 3);
        assert_eq!(outcome.accepted.len(), 3);
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_chunk_then_later_pass_recovers() {
        // Three calls all fail -> the first chunk's rows fail pass 1, then
        // pass 2 re-runs just those rows and succeeds.
        let fake = FakeChat {
            fail_first: 3,
            error: rate_limit_error,
            calls: Mutex::new(Vec::new()),
            omit_id: None,
        };
        let session = ChatSession::new("test-model", "sys");
        let mut enricher = StreamingEnricher::new(fake, session, limits(), vocab());

        let rows = prospects(3);
        let output = enricher.classify(&rows).await.unwrap();
        let outcome = finalize(&rows, &output, &vocab());

        assert_eq!(output.assignments.len(), 3);
        assert!(outcome.skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_omitted_row_retried_across_passes() {
        // The model never answers id 2; after max_passes it is skipped with
        // "No LLM response" while the others are accepted.
        let fake = FakeChat {
            fail_first: 0,
            error: rate_limit_error,
            calls: Mutex::new(Vec::new()),
            omit_id: Some("2"),
        };
        let session = ChatSession::new("test-model", "sys");
        let mut enricher = StreamingEnricher::new(fake, session, limits(), vocab());

        let rows = prospects(3);
        let output = enricher.classify(&rows).await.unwrap();
        let outcome = finalize(&rows, &output, &vocab());

        assert_eq!(output.assignments.len(), 2);
        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].prospect_id, "2");
        assert_eq!(outcome.skipped[0].skip_reason, "No LLM response");
    }
}
