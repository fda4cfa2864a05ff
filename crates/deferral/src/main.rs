//! Dry run of deferred delivery for a form export.
//!
//! Reads `{"form": ..., "entries": [...]}` from the file given as the first
//! argument, filters every entry's submission notifications, drains the
//! resulting batches with callbacks that only log, and prints a JSON summary.

use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use docqueue_core::{DocumentId, Entry, EntryId, Form, FormId, NotificationId};
use docqueue_deferral::{Deferral, DeferredDelivery, InMemoryNotificationSource};
use docqueue_infra::QueueConfig;
use docqueue_infra::queue::{InMemoryDurableStore, QueueRuntime, QueueWorker, TaskHandler, WorkerStats};

#[derive(Debug, Deserialize)]
struct Export {
    form: Form,
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
struct Summary {
    deferrals: Vec<Deferral>,
    worker: WorkerStats,
}

/// Logs each callback instead of rendering or sending anything.
struct LoggingHandler;

impl TaskHandler for LoggingHandler {
    fn produce_document(
        &self,
        form_id: FormId,
        document_id: &DocumentId,
        entry_id: EntryId,
    ) -> anyhow::Result<()> {
        tracing::info!(%form_id, %document_id, %entry_id, "would produce document");
        Ok(())
    }

    fn send_notification(
        &self,
        form_id: FormId,
        entry_id: EntryId,
        notification_id: &NotificationId,
    ) -> anyhow::Result<()> {
        tracing::info!(%form_id, %entry_id, %notification_id, "would send notification");
        Ok(())
    }

    fn cleanup(&self, form_id: FormId, entry_id: EntryId) -> anyhow::Result<()> {
        tracing::info!(%form_id, %entry_id, "would remove produced documents");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let config = QueueConfig::from_env().context("invalid DOCQUEUE_* configuration")?;
    docqueue_observability::init_with(config.log_format);

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: docqueue-dry-run <export.json>");
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let export: Export = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let store = InMemoryDurableStore::arc();
    let mut delivery = DeferredDelivery::new(InMemoryNotificationSource::new(), store.clone(), &config);

    let deferrals: Vec<Deferral> = export
        .entries
        .iter()
        .map(|entry| delivery.defer_submission(&export.form, entry))
        .collect();

    let runtime = QueueRuntime::new(LoggingHandler).with_policy(config.retry_policy());
    let worker = QueueWorker::new(store, runtime);
    let stats = worker.run_once().context("failed to drain dispatched batches")?;

    let summary = Summary {
        deferrals,
        worker: stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
