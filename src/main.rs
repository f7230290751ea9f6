mod crm;
mod error;
mod input;
mod llm;
mod output;
mod parsing;
mod personas;
mod pipeline;
mod run_config;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::crm::CrmClient;
use crate::error::AppResult;
use crate::llm::batch::PollSettings;
use crate::llm::chat::{ChatSession, OpenAiChat};
use crate::llm::{load_system_instructions, STREAMING_OUTPUT_CONTRACT};
use crate::output::{OutputWriter, SkippedRecord};
use crate::personas::PersonaVocabulary;
use crate::pipeline::batch::{rerun_skipped, BatchSource};
use crate::pipeline::streaming::StreamingEnricher;
use crate::pipeline::{finalize, ClassificationSource, EnrichmentOutcome};
use crate::run_config::{RunConfig, Secrets};

#[derive(Debug, Parser)]
#[command(
    name = "persona-enrich",
    version,
    about = "Classify prospect job titles into sales personas via an LLM"
)]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Streaming enrichment: adaptive chunks over a persistent chat session.
    Stream {
        /// Prospect CSV with Prospect Id/Record ID, Email, Job Title columns.
        #[arg(long)]
        input: PathBuf,
        /// Push accepted personas into the CRM afterwards.
        #[arg(long)]
        push_crm: bool,
    },
    /// Batch enrichment: upload a requests file and poll the batch job.
    Batch {
        #[arg(long)]
        input: PathBuf,
        /// Poll an existing batch job instead of creating a new one.
        #[arg(long)]
        resume_batch_id: Option<String>,
        #[arg(long)]
        push_crm: bool,
    },
    /// Re-run rows of a previous skipped CSV that still lack a persona.
    RerunSkipped {
        #[arg(long)]
        skipped: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default())
        .init();

    let cli = Cli::parse();
    let cfg = RunConfig::load(cli.config.as_deref())?;
    let secrets = Secrets::from_env()?;
    let http = reqwest::Client::new();

    match cli.command {
        Command::Stream { input, push_crm } => {
            run_stream(&cfg, &secrets, http, &input, push_crm).await?;
        }
        Command::Batch {
            input,
            resume_batch_id,
            push_crm,
        } => {
            run_batch(&cfg, &secrets, http, &input, resume_batch_id, push_crm).await?;
        }
        Command::RerunSkipped { skipped } => {
            run_rerun_skipped(&cfg, &secrets, http, &skipped).await?;
        }
    }

    Ok(())
}

async fn run_stream(
    cfg: &RunConfig,
    secrets: &Secrets,
    http: reqwest::Client,
    input: &Path,
    push_crm: bool,
) -> AppResult<()> {
    let rows = input::load_prospects(input, &cfg.input)?;
    let vocab = PersonaVocabulary::from_config(&cfg.personas);
    let instructions = load_system_instructions(&cfg.personas)?;
    let system = format!("{}\n\n{STREAMING_OUTPUT_CONTRACT}", instructions.trim());

    let session = ChatSession::new(cfg.model.stream_model.clone(), system);
    let api = OpenAiChat::new(http.clone(), secrets.openai_api_key.clone());
    let mut enricher = StreamingEnricher::new(api, session, cfg.limits.clone(), vocab.clone());

    let output = enricher.classify(&rows).await?;
    let outcome = finalize(&rows, &output, &vocab);
    save_and_report(cfg, &outcome, None)?;

    if push_crm {
        push_to_crm(cfg, secrets, http, &outcome).await?;
    }
    Ok(())
}

async fn run_batch(
    cfg: &RunConfig,
    secrets: &Secrets,
    http: reqwest::Client,
    input: &Path,
    resume_batch_id: Option<String>,
    push_crm: bool,
) -> AppResult<()> {
    let rows = input::load_prospects(input, &cfg.input)?;
    if rows.is_empty() {
        tracing::info!("no valid rows to process");
        return Ok(());
    }
    let vocab = PersonaVocabulary::from_config(&cfg.personas);
    let instructions = load_system_instructions(&cfg.personas)?;

    let mut source = BatchSource::new(
        http.clone(),
        secrets.openai_api_key.clone(),
        cfg.model.batch_model.clone(),
        cfg.model.temperature,
        cfg.batch.completion_window.clone(),
        PollSettings::from_config(&cfg.batch),
        &instructions,
        OutputWriter::new(&cfg.output),
    );
    source.resume_batch_id = resume_batch_id;

    let output = source.classify(&rows).await?;
    let outcome = finalize(&rows, &output, &vocab);
    save_and_report(cfg, &outcome, None)?;

    if push_crm {
        push_to_crm(cfg, secrets, http, &outcome).await?;
    }
    Ok(())
}

async fn run_rerun_skipped(
    cfg: &RunConfig,
    secrets: &Secrets,
    http: reqwest::Client,
    skipped: &Path,
) -> AppResult<()> {
    let mut rdr = csv::Reader::from_path(skipped)?;
    let skipped_rows: Vec<SkippedRecord> = rdr.deserialize().collect::<Result<_, _>>()?;

    let vocab = PersonaVocabulary::from_config(&cfg.personas);
    let instructions = load_system_instructions(&cfg.personas)?;
    let mut source = BatchSource::new(
        http,
        secrets.openai_api_key.clone(),
        cfg.model.batch_model.clone(),
        cfg.model.temperature,
        cfg.batch.completion_window.clone(),
        PollSettings::from_config(&cfg.batch),
        &instructions,
        OutputWriter::new(&cfg.output),
    );

    if let Some(outcome) = rerun_skipped(&mut source, skipped_rows, &vocab).await? {
        save_and_report(cfg, &outcome, Some("Rerun"))?;
    }
    Ok(())
}

fn save_and_report(cfg: &RunConfig, outcome: &EnrichmentOutcome, tag: Option<&str>) -> AppResult<()> {
    let writer = OutputWriter::new(&cfg.output);
    let (accepted_path, skipped_path) =
        writer.save_outputs(&outcome.accepted, &outcome.skipped, tag)?;
    tracing::info!(
        accepted = outcome.accepted.len(),
        skipped = outcome.skipped.len(),
        "processing finished"
    );
    println!("\n========= Processing Results =========");
    println!("{} prospects updated", outcome.accepted.len());
    println!("{} prospects skipped", outcome.skipped.len());
    println!("\nAccepted: {}", accepted_path.display());
    println!("Skipped:  {}", skipped_path.display());
    Ok(())
}

async fn push_to_crm(
    cfg: &RunConfig,
    secrets: &Secrets,
    http: reqwest::Client,
    outcome: &EnrichmentOutcome,
) -> AppResult<()> {
    let client = CrmClient::new(
        http,
        secrets.hubspot_read_key.clone(),
        secrets.hubspot_write_key.clone(),
    )?;
    let stats = client.import_accepted(&outcome.accepted, &cfg.crm).await?;
    println!(
        "CRM import: {} updated, {} failed, {} not found",
        stats.success, stats.failed, stats.not_found
    );
    Ok(())
}
