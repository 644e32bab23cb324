//! Campaign CLI
//!
//! Sends one message per recipient row over a single relay session.
//!
//! ## Usage
//!
//! ```bash
//! export SMTP_PASSWORD="app-password"
//! campaign --config campaign.toml --recipients recipients.csv
//! campaign --config campaign.toml --recipients recipients.csv --dry-run
//! ```

use std::path::PathBuf;
use std::process;

use clap::Parser;
use integrations_smtp_campaign::{
    CampaignConfig, CampaignDispatcher, CampaignResult, CompletionReason, RecipientTable,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "campaign")]
#[command(about = "Rate-limited email campaign dispatcher", long_about = None)]
#[command(version)]
struct Cli {
    /// Campaign configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Recipient table (CSV with a header row)
    #[arg(short, long, value_name = "FILE")]
    recipients: PathBuf,

    /// Where to write failed recipients as JSON
    #[arg(short, long, value_name = "FILE", default_value = "failed_emails.json")]
    failures: PathBuf,

    /// Validate inputs and print the first rendered message without connecting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        tracing::error!(kind = %error.kind(), "{}", error);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> CampaignResult<()> {
    let config = CampaignConfig::from_toml_file(&cli.config)?;
    let recipients = RecipientTable::from_path(&cli.recipients)?;
    recipients.validate()?;
    tracing::info!(
        recipients = recipients.len(),
        placeholders = ?recipients.placeholders(),
        "Loaded recipient table"
    );

    let mut dispatcher = CampaignDispatcher::smtp(config)?;

    if cli.dry_run {
        match recipients.records().first() {
            Some(record) => {
                let message = dispatcher.render(record);
                println!("To: {}\nSubject: {}\n\n{}", message.to, message.subject, message.body);
            }
            None => println!("Recipient table is empty."),
        }
        return Ok(());
    }

    let stop = dispatcher.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current recipient");
            stop.request_stop();
        }
    });

    let result = dispatcher.run(&recipients).await;

    let failures = dispatcher.failures();
    if !failures.is_empty() {
        failures.write_json(&cli.failures)?;
        tracing::info!(path = %cli.failures.display(), "Wrote failure ledger");
    }

    let report = result?;
    println!("{}", report.metrics);
    if let Some(summary) = report.failure_summary() {
        println!("{}", summary);
    }
    if report.completion != CompletionReason::AllProcessed {
        println!("Campaign ended early: {:?}", report.completion);
    }
    Ok(())
}
