//! Formsync Ingest - survey submission ingestion tool

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use formsync_common::logging::{init_logging, LogConfig, LogLevel};
use formsync_ingest::config::{IngestConfig, RunMode, SinkConfig, SourceConfig};
use formsync_ingest::fetch::{OnaFetcher, RemoteFetcher, SurveyCtoFetcher};
use formsync_ingest::notify::{LogNotifier, Notifier, SlackWebhookNotifier};
use formsync_ingest::sink::{MongoSink, PostgresSink, UpsertSink};
use formsync_ingest::{Pipeline, SchemaRegistry};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Exit code for configuration errors, detected before anything is fetched
const EXIT_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "formsync-ingest")]
#[command(author, version, about = "Survey submission ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion pass over every configured form
    Run {
        /// Logical time of the scheduled run (RFC 3339), defaults to now
        #[arg(long)]
        scheduled_at: Option<DateTime<Utc>>,

        /// Print the run summary as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Form definitions file
        #[arg(long, env = "FORMSYNC_FORMS_FILE")]
        forms: Option<PathBuf>,
    },

    /// Check configuration and form definitions without fetching anything
    Validate {
        /// Form definitions file
        #[arg(long, env = "FORMSYNC_FORMS_FILE")]
        forms: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::default()
        .with_level(log_level)
        .with_file_prefix("formsync-ingest");

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialize logging: {:#}", e);
    }

    let (config, registry, mode) = match load(&cli.command) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {:#}", e);
            process::exit(EXIT_CONFIG);
        },
    };

    match cli.command {
        Command::Validate { .. } => {
            info!(
                pipeline = %config.pipeline_name,
                forms = registry.len(),
                mode = ?mode,
                "Configuration is valid"
            );
            for form in registry.forms() {
                println!("{} -> {}", form.id, form.target_name());
            }
        },
        Command::Run {
            scheduled_at, json, ..
        } => {
            let pipeline = match build_pipeline(&config, registry, mode).await {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    error!(error = %e, "Failed to set up pipeline");
                    eprintln!("Error: {:#}", e);
                    process::exit(1);
                },
            };

            let summary = pipeline.run(scheduled_at.unwrap_or_else(Utc::now)).await;

            if json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(out) => println!("{}", out),
                    Err(e) => error!(error = %e, "Failed to serialize run summary"),
                }
            }

            process::exit(summary.exit_code());
        },
    }
}

fn load(command: &Command) -> Result<(IngestConfig, SchemaRegistry, RunMode)> {
    let forms = match command {
        Command::Run { forms, .. } | Command::Validate { forms } => forms.clone(),
    };

    let mut config = IngestConfig::from_env()?;
    if forms.is_some() {
        config.forms_file = forms;
    }

    let registry = config.load_registry()?;
    let mode = config.run_mode(&registry)?;
    Ok((config, registry, mode))
}

async fn build_pipeline(config: &IngestConfig, registry: SchemaRegistry, mode: RunMode) -> Result<Pipeline> {
    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => Arc::new(SlackWebhookNotifier::new(url.clone()).context("Failed to build Slack client")?),
        None => Arc::new(LogNotifier),
    };

    if mode == RunMode::Mirror {
        let SourceConfig::Ona(ona) = &config.source else {
            anyhow::bail!("mirror mode requires the Ona source");
        };
        let SinkConfig::Mongo {
            uri,
            database,
            batch_size,
        } = &config.sink
        else {
            anyhow::bail!("mirror mode requires the mongo sink");
        };

        let fetcher = OnaFetcher::new(ona.clone()).context("Failed to build Ona client")?;
        let sink = MongoSink::connect(uri, database)
            .await
            .context("Failed to connect to MongoDB")?
            .with_batch_size(*batch_size);
        info!(database = %database, "Mirroring every Ona form");

        return Ok(Pipeline::mirror(&config.pipeline_name, Arc::new(fetcher), Arc::new(sink))
            .with_notifier(notifier));
    }

    let fetcher: Arc<dyn RemoteFetcher> = match &config.source {
        SourceConfig::SurveyCto(scto) => {
            Arc::new(SurveyCtoFetcher::new(scto.clone()).context("Failed to build SurveyCTO client")?)
        },
        SourceConfig::Ona(ona) => Arc::new(OnaFetcher::new(ona.clone()).context("Failed to build Ona client")?),
    };

    let sink: Arc<dyn UpsertSink> = match &config.sink {
        SinkConfig::Postgres {
            url,
            max_connections,
            recreate_tables,
            chunk_size,
        } => Arc::new(
            PostgresSink::connect(url, *max_connections, *recreate_tables)
                .await
                .context("Failed to connect to PostgreSQL")?
                .with_chunk_size(*chunk_size),
        ),
        SinkConfig::Mongo {
            uri,
            database,
            batch_size,
        } => Arc::new(
            MongoSink::connect(uri, database)
                .await
                .context("Failed to connect to MongoDB")?
                .with_batch_size(*batch_size),
        ),
    };

    Ok(Pipeline::new(&config.pipeline_name, Arc::new(registry), fetcher, sink).with_notifier(notifier))
}
