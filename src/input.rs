//! Input table loading.
//!
//! Reads the prospect CSV export, tolerating the two id header spellings the
//! CRM produces ("Prospect Id" and "Record ID"), drops rows without a job
//! title, and filters out excluded email addresses. Missing required columns
//! are fatal.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::run_config::InputConfig;

pub const ID_COLUMN: &str = "Prospect Id";
pub const ID_COLUMN_ALIAS: &str = "Record ID";
pub const EMAIL_COLUMN: &str = "Email";
pub const JOB_TITLE_COLUMN: &str = "Job Title";

/// One input row. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prospect {
    pub id: String,
    pub email: String,
    pub job_title: String,
}

pub fn load_prospects(path: &Path, cfg: &InputConfig) -> AppResult<Vec<Prospect>> {
    let file = File::open(path)
        .map_err(|e| AppError::Input(format!("cannot open {}: {e}", path.display())))?;
    let exclude = Regex::new(&cfg.email_exclude_pattern)
        .map_err(|e| AppError::Config(format!("invalid email_exclude_pattern: {e}")))?;
    let prospects = read_prospects(file, &exclude)?;
    tracing::info!(rows = prospects.len(), "loaded input table");
    Ok(prospects)
}

fn read_prospects<R: Read>(reader: R, exclude: &Regex) -> AppResult<Vec<Prospect>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

    let headers = rdr.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h == name);

    let id_idx = find(ID_COLUMN)
        .or_else(|| find(ID_COLUMN_ALIAS))
        .ok_or_else(|| {
            AppError::Input(format!(
                "missing required column \"{ID_COLUMN}\" (or \"{ID_COLUMN_ALIAS}\")"
            ))
        })?;
    let email_idx = find(EMAIL_COLUMN)
        .ok_or_else(|| AppError::Input(format!("missing required column \"{EMAIL_COLUMN}\"")))?;
    let title_idx = find(JOB_TITLE_COLUMN)
        .ok_or_else(|| AppError::Input(format!("missing required column \"{JOB_TITLE_COLUMN}\"")))?;

    let mut prospects = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim().to_string();

        let prospect = Prospect {
            id: field(id_idx),
            email: field(email_idx),
            job_title: field(title_idx),
        };

        if prospect.job_title.is_empty() {
            continue;
        }
        if exclude.is_match(&prospect.email) {
            tracing::debug!(email = %prospect.email, "excluded by email filter");
            continue;
        }
        prospects.push(prospect);
    }

    Ok(prospects)
}
