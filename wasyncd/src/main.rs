use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wasync_core::{MessageCodec, OAuthClient};
use wasyncd::config::{DaemonConfig, SyncKind};
use wasyncd::credentials::CredentialManager;
use wasyncd::state::SyncStateMachine;
use wasyncd::storage::{CredentialStore, KeyringCredentialStore};
use wasyncd::sync::retry::RetryPolicy;
use wasyncd::sync::{
    Checkpoints, Converter, DirectoryMailbox, JsonRecordFile, MailboxStore, SyncReport, SyncRunner,
};

const DEFAULT_LOG_FILTER: &str = "wasyncd=info,wasync_core=info,warn";

#[derive(Parser, Debug)]
#[command(name = "wasyncd")]
#[command(about = "Back up SMS, MMS and call logs as mail messages")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Encode local records and append them to the mailbox
    Backup {
        #[arg(long)]
        records: PathBuf,
        #[arg(long)]
        mailbox: PathBuf,
    },
    /// Decode mailbox messages and write them to the local records
    Restore {
        #[arg(long)]
        mailbox: PathBuf,
        #[arg(long)]
        records: PathBuf,
    },
    /// Print message headers from the mailbox
    List {
        #[arg(long)]
        mailbox: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Upgrade a stored legacy token to an OAuth2 credential
    MigrateToken,
    /// Remove the stored credential
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Logout => {
            let config = DaemonConfig::from_env()?;
            match credential_manager(&config)? {
                Some(manager) => manager.logout().context("failed to delete credential")?,
                None => credential_store(&config)?
                    .delete_credential()
                    .context("failed to delete credential")?,
            }
            info!(account = %config.user_email, "saved credential removed");
            Ok(())
        }
        Command::MigrateToken => {
            let config = DaemonConfig::from_env()?;
            let manager = credential_manager(&config)?
                .context("WASYNC_OAUTH_CLIENT_ID and WASYNC_OAUTH_CLIENT_SECRET must be set")?;
            let client_id = config.oauth_client_id.clone().unwrap_or_default();
            match manager.migrate_legacy_token(&client_id).await {
                Some(_) => info!("legacy token migrated"),
                None => warn!("no legacy token was migrated"),
            }
            Ok(())
        }
        Command::List {
            mailbox,
            offset,
            limit,
        } => {
            let mailbox = DirectoryMailbox::new(mailbox);
            let messages = mailbox
                .fetch(offset..offset.saturating_add(limit))
                .await
                .context("failed to read mailbox")?;
            for message in messages {
                println!(
                    "{}\t{}",
                    message.message_id().unwrap_or("-"),
                    message.header(wasync_core::headers::SUBJECT).unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Backup { records, mailbox } => {
            run(SyncKind::Backup, &records, mailbox).await
        }
        Command::Restore { mailbox, records } => {
            run(SyncKind::Restore, &records, mailbox).await
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn credential_manager(config: &DaemonConfig) -> anyhow::Result<Option<CredentialManager>> {
    let (Some(client_id), Some(client_secret)) = (
        config.oauth_client_id.clone(),
        config.oauth_client_secret.clone(),
    ) else {
        return Ok(None);
    };
    let client = match config.oauth_base_url.as_deref() {
        Some(url) => OAuthClient::with_base_url(url, client_id, client_secret)
            .context("invalid oauth base url/config")?,
        None => OAuthClient::new(client_id, client_secret).context("invalid oauth config")?,
    };
    let store = credential_store(config)?;
    let policy = RetryPolicy {
        max_retries: u32::try_from(config.max_retries).unwrap_or(0),
        timeout: config.io_timeout,
        ..RetryPolicy::default()
    };
    Ok(Some(CredentialManager::new(
        Arc::new(client),
        Arc::new(store),
        policy,
    )))
}

fn credential_store(config: &DaemonConfig) -> anyhow::Result<KeyringCredentialStore> {
    KeyringCredentialStore::for_account(&config.user_email).context("failed to open keyring")
}

async fn run(kind: SyncKind, records: &Path, mailbox: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::from_env()?;
    let sync_config = config.sync_config(kind)?;
    let machine = Arc::new(SyncStateMachine::new());
    let converter = Converter::new(MessageCodec::new(&config.user_email));
    let mut runner = SyncRunner::new(
        machine.clone(),
        Arc::new(DirectoryMailbox::new(mailbox)),
        converter,
    );
    match credential_manager(&config)? {
        Some(manager) => runner = runner.with_credentials(Arc::new(manager)),
        None => warn!("oauth client not configured, running without credentials"),
    }

    let mut states = machine.subscribe();
    let observer = tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            match (state.progress(), state.error()) {
                (_, Some(failure)) => warn!(phase = %state.phase(), "{}", failure.message),
                (Some(progress), None) => info!(
                    phase = %state.phase(),
                    processed = progress.processed,
                    total = progress.total,
                    "progress"
                ),
                (None, None) => info!(phase = %state.phase(), "state changed"),
            }
        }
    });

    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancel requested, stopping after the current batch");
            cancel.cancel();
        }
    });

    let checkpoint_path = config.checkpoint_path(kind);
    let mut checkpoints = Checkpoints::load(&checkpoint_path)
        .await
        .with_context(|| format!("failed to load checkpoints from {checkpoint_path:?}"))?;
    let records = JsonRecordFile::new(records);
    let result = match kind {
        SyncKind::Backup => runner.backup(&sync_config, &records, &mut checkpoints).await,
        SyncKind::Restore => runner.restore(&sync_config, &records, &mut checkpoints).await,
    };
    checkpoints
        .save(&checkpoint_path)
        .await
        .with_context(|| format!("failed to save checkpoints to {checkpoint_path:?}"))?;
    drop(runner);
    drop(machine);
    let _ = observer.await;

    let report = result.context("sync run failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "{:?} {}: {} of {} processed, {} skipped, {} duplicates, {} unclassified, {} failed",
        report.kind,
        report.phase,
        report.processed,
        report.total,
        report.skipped,
        report.duplicates,
        report.unclassified,
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "  #{} {}: {}",
            failure.position,
            failure.identifier.as_deref().unwrap_or("-"),
            failure.error
        );
    }
}
