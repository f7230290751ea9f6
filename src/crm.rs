//! Thin CRM push.
//!
//! Updates contact persona properties from the accepted output: rows with a
//! prospect id are updated directly, the rest are resolved by email first.
//! Calls are batched (the CRM caps bulk updates at 100 inputs) and 429s are
//! honored via the Retry-After header.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::output::AcceptedRecord;
use crate::run_config::CrmConfig;

const BASE_URL: &str = "https://api.hubapi.com";
const BATCH_SIZE: usize = 100;
const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: f64 = 10.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub success: usize,
    pub failed: usize,
    pub not_found: usize,
}

/// Persona name -> CRM enum value. Exact match first, then
/// case-insensitive; an unmapped name passes through unchanged so the
/// resulting CRM error shows what went wrong.
pub fn map_persona(mapping: &HashMap<String, String>, persona: &str) -> String {
    let persona = persona.trim();
    if let Some(value) = mapping.get(persona) {
        return value.clone();
    }
    mapping
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(persona))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| persona.to_string())
}

pub struct CrmClient {
    http: reqwest::Client,
    read_key: Option<String>,
    write_key: String,
}

impl CrmClient {
    pub fn new(
        http: reqwest::Client,
        read_key: Option<String>,
        write_key: Option<String>,
    ) -> AppResult<Self> {
        let write_key = write_key.ok_or_else(|| {
            AppError::Config("HUBSPOT_WRITE_API_KEY not set; required for CRM import".to_string())
        })?;
        Ok(Self {
            http,
            read_key,
            write_key,
        })
    }

    async fn post_with_retry(&self, url: &str, key: &str, body: &Value) -> AppResult<Value> {
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .http
                .post(url)
                .bearer_auth(key)
                .json(body)
                .send()
                .await
                .map_err(|e| anyhow!("CRM request failed: {e}"))?;

            let status = resp.status();
            if status.as_u16() == 429 && attempt < MAX_ATTEMPTS {
                let wait = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                tracing::warn!("CRM rate limited; retrying in {wait:.0}s");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("CRM error (HTTP {status}): {body}").into());
            }
            return Ok(resp.json::<Value>().await.map_err(|e| anyhow!(e))?);
        }
        unreachable!("retry loop always returns")
    }

    /// Resolve contact ids for the given emails via the batch read endpoint.
    async fn lookup_ids_by_email(&self, emails: &[&str]) -> AppResult<HashMap<String, String>> {
        let read_key = self.read_key.clone().ok_or_else(|| {
            AppError::Config("HUBSPOT_API_KEY not set; required for contact lookup".to_string())
        })?;

        let url = format!("{BASE_URL}/crm/v3/objects/contacts/batch/read");
        let mut found = HashMap::new();
        for chunk in emails.chunks(BATCH_SIZE) {
            let body = json!({
                "idProperty": "email",
                "properties": ["email"],
                "inputs": chunk.iter().map(|e| json!({"id": e})).collect::<Vec<_>>(),
            });
            let resp = self.post_with_retry(&url, &read_key, &body).await?;
            if let Some(results) = resp.get("results").and_then(Value::as_array) {
                for result in results {
                    let id = result.get("id").and_then(Value::as_str);
                    let email = result
                        .get("properties")
                        .and_then(|p| p.get("email"))
                        .and_then(Value::as_str);
                    if let (Some(id), Some(email)) = (id, email) {
                        found.insert(email.to_lowercase(), id.to_string());
                    }
                }
            }
        }
        Ok(found)
    }

    /// Push accepted personas into the CRM, batched.
    pub async fn import_accepted(
        &self,
        records: &[AcceptedRecord],
        cfg: &CrmConfig,
    ) -> AppResult<ImportStats> {
        if records.is_empty() {
            return Ok(ImportStats::default());
        }

        let mut stats = ImportStats::default();
        let mut inputs: Vec<Value> = Vec::new();

        let needs_lookup: Vec<&str> = records
            .iter()
            .filter(|r| r.prospect_id.trim().is_empty())
            .map(|r| r.email.as_str())
            .collect();
        let email_to_id = if needs_lookup.is_empty() {
            HashMap::new()
        } else {
            tracing::info!(count = needs_lookup.len(), "looking up contacts by email");
            self.lookup_ids_by_email(&needs_lookup).await?
        };

        for record in records {
            let id = if record.prospect_id.trim().is_empty() {
                match email_to_id.get(&record.email.to_lowercase()) {
                    Some(id) => id.clone(),
                    None => {
                        tracing::warn!(email = %record.email, "contact not found in CRM");
                        stats.not_found += 1;
                        continue;
                    }
                }
            } else {
                record.prospect_id.clone()
            };

            inputs.push(json!({
                "id": id,
                "properties": {
                    cfg.persona_property(): map_persona(&cfg.persona_mapping, &record.persona),
                    cfg.certainty_property(): record.certainty,
                }
            }));
        }

        let url = format!("{BASE_URL}/crm/v3/objects/contacts/batch/update");
        for chunk in inputs.chunks(BATCH_SIZE) {
            let body = json!({ "inputs": chunk });
            match self.post_with_retry(&url, &self.write_key, &body).await {
                Ok(_) => stats.success += chunk.len(),
                Err(e) => {
                    tracing::error!("CRM batch update failed: {e}");
                    stats.failed += chunk.len();
                }
            }
        }

        tracing::info!(
            success = stats.success,
            failed = stats.failed,
            not_found = stats.not_found,
            "CRM import finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_persona_exact_then_case_insensitive_then_passthrough() {
        let mapping = HashMap::from([
            ("Economic Buyer".to_string(), "persona_2".to_string()),
            ("Data User".to_string(), "persona_4".to_string()),
        ]);
        assert_eq!(map_persona(&mapping, "Economic Buyer"), "persona_2");
        assert_eq!(map_persona(&mapping, "data user"), "persona_4");
        assert_eq!(map_persona(&mapping, "Unmapped Persona"), "Unmapped Persona");
    }

    #[test]
    fn test_map_persona_identity_with_empty_mapping() {
        let mapping = HashMap::new();
        assert_eq!(map_persona(&mapping, " Data User "), "Data User");
    }
}
