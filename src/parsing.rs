//! Parsers for raw LLM output.
//!
//! Streaming replies are CSV-shaped (one `id,job title,persona,certainty`
//! line per row); batch output is JSONL with one embedded chat-completion
//! response per line. Malformed material is logged and dropped or routed to
//! an error map, never fatal; the affected rows surface as skips.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Commas would collide with the reply's CSV shape.
pub fn sanitize_job_title(title: &str) -> String {
    title.replace(',', " ")
}

/// One persona classification for one prospect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaAssignment {
    pub persona: String,
    pub certainty: String,
}

#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub prospect_id: String,
    pub persona: String,
    pub certainty: String,
}

/// Parse the accumulated CSV-shaped assistant output. Expects four fields
/// per line; extra columns are discarded with a warning, lines with fewer
/// fields are dropped with a warning.
pub fn parse_llm_csv(text: &str) -> Vec<ParsedLine> {
    let mut out = Vec::new();
    if text.trim().is_empty() {
        return out;
    }

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    for (i, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("dropping malformed reply line {}: {e}", i + 1);
                continue;
            }
        };
        if record.len() < 4 {
            tracing::warn!(
                "dropping malformed reply line {}: {} field(s), expected 4",
                i + 1,
                record.len()
            );
            continue;
        }
        if record.len() > 4 {
            tracing::warn!("reply line {} has extra columns; using first four", i + 1);
        }
        out.push(ParsedLine {
            prospect_id: record[0].trim().to_string(),
            persona: record[2].trim().to_string(),
            certainty: record[3].trim().to_string(),
        });
    }

    out
}

/// Per-row content and errors from a downloaded batch output file, keyed by
/// the caller-assigned custom id.
#[derive(Debug, Default)]
pub struct BatchOutput {
    pub contents: HashMap<String, String>,
    pub errors: HashMap<String, String>,
}

pub fn parse_batch_output(jsonl: &str) -> BatchOutput {
    let mut out = BatchOutput::default();

    for (i, line) in jsonl.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let obj: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("dropping malformed batch output line {}: {e}", i + 1);
                continue;
            }
        };

        let custom_id = obj
            .get("custom_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let response = obj.get("response").cloned().unwrap_or(Value::Null);
        let status = response
            .get("status_code")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if status == 200 {
            let content = response
                .get("body")
                .and_then(|b| b.get("choices"))
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str);
            match content {
                Some(content) => {
                    out.contents.insert(custom_id, content.to_string());
                }
                None => {
                    out.errors
                        .insert(custom_id, "Malformed success body".to_string());
                }
            }
        } else {
            let message = response
                .get("body")
                .and_then(|b| b.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    response
                        .get("body")
                        .map(|b| b.to_string())
                        .unwrap_or_default()
                });
            out.errors
                .insert(custom_id, format!("HTTP {status}: {message}"));
        }
    }

    out
}

#[derive(Debug, Deserialize)]
struct PersonaJson {
    persona: String,
    #[serde(default)]
    certainty: Option<Value>,
}

/// Parse the single-JSON-object persona answer a batch row returns.
pub fn parse_persona_json(content: &str) -> Result<PersonaAssignment, serde_json::Error> {
    let parsed: PersonaJson = serde_json::from_str(content)?;
    let certainty = match parsed.certainty {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Ok(PersonaAssignment {
        persona: parsed.persona.trim().to_string(),
        certainty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_job_title_strips_commas() {
        assert_eq!(sanitize_job_title("VP, Data"), "VP  Data");
        assert_eq!(sanitize_job_title("CTO"), "CTO");
    }

    #[test]
    fn test_parse_llm_csv_basic() {
        let text = "1,CTO,Technical Decision Maker,90\n2,Engineer,Data User,75\n";
        let rows = parse_llm_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].prospect_id, "1");
        assert_eq!(rows[0].persona, "Technical Decision Maker");
        assert_eq!(rows[1].certainty, "75");
    }

    #[test]
    fn test_parse_llm_csv_extra_columns_use_first_four() {
        let text = "1,CTO,Economic Buyer,90,unexpected,extra\n";
        let rows = parse_llm_csv(text);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].persona, "Economic Buyer");
        assert_eq!(rows[0].certainty, "90");
    }

    #[test]
    fn test_parse_llm_csv_drops_short_lines() {
        let text = "1,CTO,Economic Buyer,90\nsorry I cannot help\n2,CEO,Executive Sponsor,80\n";
        let rows = parse_llm_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].prospect_id, "2");
    }

    #[test]
    fn test_parse_llm_csv_empty() {
        assert!(parse_llm_csv("").is_empty());
        assert!(parse_llm_csv("  \n ").is_empty());
    }

    #[test]
    fn test_parse_batch_output_routes_by_status() {
        let jsonl = concat!(
            r#"{"custom_id":"1","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{\"persona\":\"Data User\",\"certainty\":80}"}}]}}}"#,
            "\n",
            r#"{"custom_id":"2","response":{"status_code":429,"body":{"error":{"message":"rate limited"}}}}"#,
            "\n",
            "not json at all\n",
        );
        let out = parse_batch_output(jsonl);
        assert_eq!(out.contents.len(), 1);
        assert!(out.contents["1"].contains("Data User"));
        assert_eq!(out.errors["2"], "HTTP 429: rate limited");
    }

    #[test]
    fn test_parse_batch_output_malformed_success_body() {
        let jsonl = r#"{"custom_id":"9","response":{"status_code":200,"body":{"choices":[]}}}"#;
        let out = parse_batch_output(jsonl);
        assert!(out.contents.is_empty());
        assert_eq!(out.errors["9"], "Malformed success body");
    }

    #[test]
    fn test_parse_persona_json_variants() {
        let a = parse_persona_json(r#"{"persona":"Economic Buyer","certainty":90}"#).unwrap();
        assert_eq!(a.persona, "Economic Buyer");
        assert_eq!(a.certainty, "90");

        let b = parse_persona_json(r#"{"persona":" Data User ","certainty":"85%"}"#).unwrap();
        assert_eq!(b.persona, "Data User");
        assert_eq!(b.certainty, "85%");

        assert!(parse_persona_json("not json").is_err());
        assert!(parse_persona_json(r#"{"certainty":1}"#).is_err());
    }
}
