use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use courier::config::{CourierConfig, LogFormat, LoggingConfig};
use courier::dispatch::CallDispatcher;
use courier::jobs::{ExportFormat, ExportRequest, HttpJobApi, JobEvent, JobPoller};
use courier::transport::HttpTransport;
use courier::webhook::WebhookVerifier;
use courier::CourierError;

/// Admission-controlled client for survey response exports.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export a survey's responses to a file
    Export {
        /// Survey identifier, e.g. SV_abc123
        #[arg(long)]
        survey: String,

        /// json, csv, tsv, spss or xml
        #[arg(long, default_value = "csv")]
        format: ExportFormat,

        /// First day (YYYY-MM-DD) or instant (RFC 3339) to include
        #[arg(long)]
        start_date: Option<String>,

        /// Last day (YYYY-MM-DD) or instant (RFC 3339) to include
        #[arg(long)]
        end_date: Option<String>,

        /// Where to write the artifact
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print configured quotas and current permit counts as JSON
    Limits,
    /// Check a webhook body against its signature
    VerifyWebhook {
        /// File holding the raw request body
        #[arg(long)]
        payload: PathBuf,

        /// Value of the signature header
        #[arg(long)]
        signature: String,

        /// Shared secret; defaults to $COURIER_WEBHOOK_SECRET
        #[arg(long)]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CourierConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Courier");

    match cli.command {
        Command::Export {
            survey,
            format,
            start_date,
            end_date,
            output,
        } => {
            let start = start_date.as_deref().map(|d| parse_date(d, false)).transpose()?;
            let end = end_date.as_deref().map(|d| parse_date(d, true)).transpose()?;
            let request = ExportRequest::new(survey).format(format).between(start, end);
            request.validate()?;
            export(&config, &request, output).await
        }
        Command::Limits => {
            let dispatcher = CallDispatcher::from_rules(&config.admission, config.retry.to_policy())?;
            println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
            Ok(())
        }
        Command::VerifyWebhook {
            payload,
            signature,
            secret,
        } => {
            let secret = match secret.or_else(|| std::env::var("COURIER_WEBHOOK_SECRET").ok()) {
                Some(secret) => secret,
                None => bail!("no webhook secret given; pass --secret or set COURIER_WEBHOOK_SECRET"),
            };
            let body = tokio::fs::read(&payload)
                .await
                .with_context(|| format!("Failed to read {}", payload.display()))?;

            if !WebhookVerifier::new(secret).verify(&body, &signature) {
                bail!("signature does not match payload");
            }
            println!("signature valid");
            Ok(())
        }
    }
}

async fn export(config: &CourierConfig, request: &ExportRequest, output: PathBuf) -> anyhow::Result<()> {
    let mut transport = HttpTransport::new(&config.api.base_url, config.api.timeout())?;
    if let Some(token) = &config.api.token {
        transport = transport.with_token(config.api.auth_header.clone(), token.clone());
    }

    let dispatcher = Arc::new(CallDispatcher::from_rules(&config.admission, config.retry.to_policy())?);
    let api = Arc::new(HttpJobApi::new(Arc::new(transport)));
    let mut poller = JobPoller::new(dispatcher.clone(), api, config.polling.to_poller_config());

    let mut events = poller.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Transition { from, to } => info!(from = %from, to = %to, "Export state changed"),
                JobEvent::Progress {
                    attempt,
                    percent_complete,
                    ..
                } => info!(attempt, percent = percent_complete, "Export progress"),
            }
        }
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let artifact = poller.run(request, &cancel).await?;
    info!(job_id = %artifact.job_id, file_id = %artifact.result_handle, "Downloading export");

    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut stream = artifact.stream;
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CourierError::Cancelled.into()),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    let stats = dispatcher.stats();
    info!(
        path = %output.display(),
        bytes = written,
        calls = stats.calls,
        attempts = stats.attempts,
        "Export written"
    );
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Parse `YYYY-MM-DD` or RFC 3339. A bare end date covers the whole day.
fn parse_date(input: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(input.trim()) {
        return Ok(instant.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date {input}; expected YYYY-MM-DD or RFC 3339"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    match time {
        Some(time) => Ok(time.and_utc()),
        None => bail!("invalid date {input}"),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
    }
}
