//! Output files.
//!
//! Two timestamped CSVs per run: accepted rows (with persona + certainty) and
//! skipped rows (with a human-readable skip reason). Checkpoint dumps of raw
//! batch payloads are best-effort; a failed checkpoint write is logged and
//! never fails the run.

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::run_config::OutputConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedRecord {
    #[serde(rename = "Prospect Id")]
    pub prospect_id: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Job Title")]
    pub job_title: String,
    #[serde(rename = "Persona")]
    pub persona: String,
    #[serde(rename = "Persona Certainty")]
    pub certainty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedRecord {
    #[serde(rename = "Prospect Id")]
    pub prospect_id: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Job Title")]
    pub job_title: String,
    #[serde(rename = "Persona")]
    pub persona: Option<String>,
    #[serde(rename = "Persona Certainty")]
    pub certainty: Option<String>,
    #[serde(rename = "Skip Reason")]
    pub skip_reason: String,
}

fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H %M %S").to_string()
}

fn checkpoint_stamp() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
    skipped_dir: PathBuf,
    checkpoints_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(cfg: &OutputConfig) -> Self {
        Self {
            dir: cfg.dir.clone(),
            skipped_dir: cfg.dir.join(&cfg.skipped_subdir),
            checkpoints_dir: cfg.dir.join(&cfg.checkpoints_subdir),
        }
    }

    fn ensure_dirs(&self) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(&self.skipped_dir)?;
        fs::create_dir_all(&self.checkpoints_dir)?;
        Ok(())
    }

    /// Write the accepted and skipped CSVs. `tag` distinguishes rerun output
    /// files from first-run ones (e.g. "Rerun").
    pub fn save_outputs(
        &self,
        accepted: &[AcceptedRecord],
        skipped: &[SkippedRecord],
        tag: Option<&str>,
    ) -> AppResult<(PathBuf, PathBuf)> {
        self.ensure_dirs()?;
        let stamp = now_stamp();
        let tag = tag.map(|t| format!("{t} ")).unwrap_or_default();
        let accepted_path = self.dir.join(format!("Personas {tag}{stamp}.csv"));
        let skipped_path = self
            .skipped_dir
            .join(format!("Skipped prospects {tag}{stamp}.csv"));

        let mut w = csv::Writer::from_path(&accepted_path)?;
        for record in accepted {
            w.serialize(record)?;
        }
        w.flush()?;

        let mut w = csv::Writer::from_path(&skipped_path)?;
        for record in skipped {
            w.serialize(record)?;
        }
        w.flush()?;

        Ok((accepted_path, skipped_path))
    }

    /// Best-effort raw dump for post-mortem debugging. Never fails the run.
    pub fn save_checkpoint_raw(&self, name: &str, content: &str, ext: &str) -> Option<PathBuf> {
        if let Err(e) = self.ensure_dirs() {
            tracing::warn!("checkpoint dirs unavailable: {e}");
            return None;
        }
        let path = self
            .checkpoints_dir
            .join(format!("{name}_{}.{ext}", checkpoint_stamp()));
        match fs::write(&path, content) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("failed to write checkpoint {}: {e}", path.display());
                None
            }
        }
    }
}
