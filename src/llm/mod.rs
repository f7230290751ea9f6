//! Chat-completion wire types and prompt assembly.

pub mod batch;
pub mod chat;

use indoc::{formatdoc, indoc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::run_config::PersonaConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatApiErrorBody {
    pub error: ChatApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ChatApiErrorDetail {
    pub message: String,
}

/// System instructions shared by both pipelines: role framing plus the
/// persona taxonomy. Used when no frame/definitions files are configured.
pub fn default_system_instructions(vocab: &[String]) -> String {
    let taxonomy = vocab.iter().map(|p| format!("• \"{p}\"")).join("\n");
    formatdoc! {r#"
        You are a sales persona classification engine.
        Your task is to assign each prospect's job title to exactly one persona
        from the predefined taxonomy below.

        Instructions:
        Judge the title's seniority, function, and typical buying role.
        Choose the single best-fitting persona.
        Do not invent new personas.
        If the title clearly does not match any persona, answer "Not a target".

        Taxonomy (authoritative):

        {taxonomy}

        "certainty" is an integer between 0 and 100 representing classification
        confidence. Do not provide explanations."#
    }
}

/// Output contract appended to the system instructions for the streaming
/// pipeline, whose replies are parsed as CSV lines.
pub const STREAMING_OUTPUT_CONTRACT: &str = indoc! {r#"
    CRITICAL OUTPUT FORMAT: The user sends one "prospect id,job title" pair per
    line. Respond with exactly one CSV line per input row:
    prospect id,job title,persona,certainty
    No header, no code fences, no commentary."#
};

/// Load the system instructions, preferring the configured frame and persona
/// definition files and falling back to the generated default.
pub fn load_system_instructions(cfg: &PersonaConfig) -> AppResult<String> {
    if cfg.frame_file.is_none() && cfg.definitions_file.is_none() {
        return Ok(default_system_instructions(&cfg.valid));
    }
    let mut parts = Vec::new();
    for path in [&cfg.frame_file, &cfg.definitions_file].into_iter().flatten() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        parts.push(text);
    }
    Ok(parts.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_instructions_list_all_personas() {
        let cfg = PersonaConfig::default();
        let prompt = default_system_instructions(&cfg.valid);
        for persona in &cfg.valid {
            assert!(prompt.contains(&format!("• \"{persona}\"")), "{persona}");
        }
        assert!(prompt.contains("certainty"));
    }

    #[test]
    fn test_missing_instruction_file_is_config_error() {
        let cfg = PersonaConfig {
            frame_file: Some("/nonexistent/frame_instructions.txt".into()),
            ..PersonaConfig::default()
        };
        assert!(matches!(
            load_system_instructions(&cfg),
            Err(AppError::Config(_))
        ));
    }
}
