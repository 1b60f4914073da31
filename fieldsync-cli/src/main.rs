use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldsync::{
    FieldSyncConfig, ManualConnectivity, MutationQueue, OperationType, PushNotificationPayload, PushOutcome, QueueCounts,
    SyncContext, TriggerOutcome,
};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// fieldsync offline sync operator tool
#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Inspect and drive the offline sync engine of a device database")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "fieldsync.yaml", env = "FIELDSYNC_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull and reconcile one entity, or every registered entity
    Sync {
        /// Entity name; all entities when omitted
        entity: Option<String>,

        /// Refresh a single record of the entity
        #[arg(long, requires = "entity")]
        id: Option<String>,
    },

    /// Push queued mutations now
    Push {
        /// Return FAILED mutations to the queue first
        #[arg(long)]
        retry_failed: bool,

        /// Delete COMPLETED mutations afterwards
        #[arg(long)]
        purge: bool,
    },

    /// Show mutation queue counts
    Status,

    /// Record a local mutation
    Enqueue {
        entity: String,
        entity_id: String,

        /// create, update or delete
        #[arg(short, long, default_value = "update")]
        operation: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Push immediately instead of leaving the mutation queued
        #[arg(long)]
        push: bool,
    },

    /// Feed a push-notification payload (JSON, or `-` for stdin)
    Trigger { payload: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushSummary {
    outcome: String,
    pushed: usize,
    failed: usize,
    queue: QueueCounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args.config)?;
    let context = SyncContext::open(config, Arc::new(ManualConnectivity::online()))
        .await
        .context("Failed to open sync context")?;

    let result = run(&context, args.command).await;
    context.shutdown();
    result
}

async fn run(context: &SyncContext, command: Command) -> Result<()> {
    match command {
        Command::Sync { entity: Some(entity), id: Some(id) } => {
            let outcome = context.engine().sync_single(&entity, &id).await?;
            print_json(&outcome)?;
        }
        Command::Sync { entity: Some(entity), id: None } => {
            let report = context.sync_entity(&entity).await?;
            print_json(&report)?;
        }
        Command::Sync { entity: None, .. } => {
            let report = context.sync_all().await;
            print_json(&report)?;
            if !report.is_success() {
                bail!("{} entities failed to sync", report.failures.len());
            }
        }
        Command::Push { retry_failed, purge } => {
            if retry_failed {
                let reset = context.queue().reset_failed().await?;
                info!(reset, "Returned failed mutations to the queue");
            }

            let outcome = context.push_now().await;
            if purge {
                let purged = context.queue().purge_completed().await?;
                info!(purged, "Purged completed mutations");
            }

            let summary = push_summary(&outcome, context.queue_counts().await?);
            print_json(&summary)?;
            if let PushOutcome::Failed(reason) = outcome {
                bail!("push failed: {}", reason);
            }
        }
        Command::Status => {
            print_json(&context.queue_counts().await?)?;
        }
        Command::Enqueue {
            entity,
            entity_id,
            operation,
            payload,
            push,
        } => {
            let operation = OperationType::parse(&operation)?;
            let payload = parse_payload(&payload)?;
            let id = context.record_mutation(&entity, &entity_id, operation, payload).await?;
            println!("{}", id);

            if push {
                let outcome = context.push_now().await;
                print_json(&push_summary(&outcome, context.queue_counts().await?))?;
            }
        }
        Command::Trigger { payload } => {
            let raw = if payload == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                payload
            };
            let payload: PushNotificationPayload =
                serde_json::from_str(&raw).context("Invalid push-notification payload")?;

            info!(action = ?payload.action(), key = %payload.dedup_key(), "Dispatching trigger");
            match context.triggers().dispatch(&payload).await {
                TriggerOutcome::Executed => println!("executed"),
                TriggerOutcome::Blocked { remaining } => {
                    println!("blocked ({} ms remaining)", remaining.as_millis());
                }
                TriggerOutcome::Failed(reason) => bail!("triggered sync failed: {}", reason),
            }
        }
    }
    Ok(())
}

fn push_summary(outcome: &PushOutcome, queue: QueueCounts) -> PushSummary {
    let (label, pushed, failed) = match outcome {
        PushOutcome::Pushed(report) => ("pushed", report.pushed, report.failed),
        PushOutcome::SkippedOffline => ("skipped_offline", 0, 0),
        PushOutcome::Deferred => ("deferred", 0, 0),
        PushOutcome::Failed(_) => ("failed", 0, 0),
    };
    PushSummary {
        outcome: label.to_string(),
        pushed,
        failed,
        queue,
    }
}

fn load_config(path: &Path) -> Result<FieldSyncConfig> {
    let config = if path.exists() {
        FieldSyncConfig::from_file(path)?
    } else {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
        FieldSyncConfig::default()
    };
    Ok(config.with_env_overrides()?)
}

fn parse_payload(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Payload is not valid JSON")?;
    if !value.is_object() {
        bail!("Payload must be a JSON object");
    }
    Ok(value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fieldsync={},fieldsync_cli={},sqlx=warn", level, level).into());

    // stdout carries command output, logs go to stderr
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue_defaults() {
        let args = Args::try_parse_from(["fieldsync", "enqueue", "clients", "c1"]).unwrap();
        match args.command {
            Command::Enqueue {
                operation, payload, push, ..
            } => {
                assert_eq!(operation, "update");
                assert_eq!(payload, "{}");
                assert!(!push);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("fieldsync.yaml"));
    }

    #[test]
    fn test_sync_id_requires_entity() {
        assert!(Args::try_parse_from(["fieldsync", "sync", "--id", "c1"]).is_err());
        assert!(Args::try_parse_from(["fieldsync", "sync", "clients", "--id", "c1"]).is_ok());
    }

    #[test]
    fn test_parse_payload_requires_object() {
        assert!(parse_payload(r#"{"name":"Acme"}"#).is_ok());
        assert!(parse_payload("[1,2]").is_err());
        assert!(parse_payload("not json").is_err());
    }

    #[test]
    fn test_push_summary_labels() {
        let summary = push_summary(&PushOutcome::SkippedOffline, QueueCounts::default());
        assert_eq!(summary.outcome, "skipped_offline");
        assert_eq!(summary.pushed, 0);
    }
}
