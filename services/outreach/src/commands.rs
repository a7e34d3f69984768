use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Subcommand, ValueEnum};
use outreach::{AppConfig, ChannelHandle, DownloadFinalizer, ExportFilters, ImportUpload, JobsApi, ProgressChannel};
use progress::{JobId, ProgressEvent};
use tracing::warn;

#[derive(Subcommand)]
pub enum Commands {
    /// Upload a roster spreadsheet and follow the import
    Import {
        file: PathBuf,
        #[arg(long)]
        no_watch: bool,
    },
    /// Start an export, follow it and download the file
    Export {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        has_email: Option<bool>,
        #[arg(long)]
        no_watch: bool,
        #[arg(long)]
        no_download: bool,
    },
    /// Print the server-side job row
    Status {
        #[arg(value_enum)]
        kind: KindArg,
        job_id: String,
    },
    /// Ask the server to stop an import
    Cancel { job_id: String },
    /// Download a finished export
    Download { job_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum KindArg {
    Import,
    Export,
}

pub async fn run(
    command: Commands,
    cfg: &AppConfig,
    api: Arc<dyn JobsApi>,
    channel: &ProgressChannel,
) -> Result<()> {
    let finalizer = DownloadFinalizer::new(api.clone(), cfg.download_dir.clone());

    match command {
        Commands::Import { file, no_watch } => {
            // connect while the upload is in flight
            let handle = channel.init(cfg.token.clone());
            let upload = ImportUpload::from_path(&file).await?;
            let job_id = api.submit_import(upload).await?;
            println!("import job: {job_id}");
            if no_watch {
                return Ok(());
            }

            match follow(&handle, &job_id).await {
                Some(ProgressEvent::Import(p)) => {
                    if let Some(err) = p.error {
                        bail!("import failed: {err}");
                    }
                    println!(
                        "import finished: {} processed, {} imported, {} failed, {} duplicates",
                        p.processed.unwrap_or(0),
                        p.success.unwrap_or(0),
                        p.failed.unwrap_or(0),
                        p.duplicates_count.unwrap_or(0),
                    );
                }
                Some(other) => warn!(kind = %other.kind(), "unexpected event kind for import job"),
                None => println!("stopped watching; the job continues on the server"),
            }
        }
        Commands::Export { status, search, has_email, no_watch, no_download } => {
            let handle = channel.init(cfg.token.clone());
            let filters = build_filters(status, search, has_email);
            let job_id = api.submit_export(filters).await?;
            println!("export job: {job_id}");
            if no_watch {
                return Ok(());
            }

            match follow(&handle, &job_id).await {
                Some(ProgressEvent::Export(p)) => {
                    if let Some(err) = p.error {
                        bail!("export failed: {err}");
                    }
                    println!("export finished: {} rows", p.processed.or(p.total).unwrap_or(0));
                    if !no_download && (p.is_download_ready() || p.is_done()) {
                        let saved = finalizer.download(&job_id).await?;
                        println!("saved {} ({} bytes)", saved.path.display(), saved.size);
                    }
                }
                Some(other) => warn!(kind = %other.kind(), "unexpected event kind for export job"),
                None => println!("stopped watching; the job continues on the server"),
            }
        }
        Commands::Status { kind, job_id } => {
            let job_id = JobId::new(job_id);
            let row = match kind {
                KindArg::Import => serde_json::to_value(api.import_job(&job_id).await?)?,
                KindArg::Export => serde_json::to_value(api.export_job(&job_id).await?)?,
            };
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Commands::Cancel { job_id } => {
            let job_id = JobId::new(job_id);
            // best effort: the job may already be finished
            match api.cancel_import(&job_id).await {
                Ok(ack) => println!(
                    "cancel requested: {}",
                    ack.message.or(ack.status).unwrap_or_else(|| "ok".to_string())
                ),
                Err(e) => warn!(job_id = %job_id, error = %e, "cancel request failed"),
            }
            let row = api.import_job(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Commands::Download { job_id } => {
            let saved = finalizer.download(&JobId::new(job_id)).await?;
            println!("saved {} ({} bytes)", saved.path.display(), saved.size);
        }
    }

    Ok(())
}

fn build_filters(
    status: Option<String>,
    search: Option<String>,
    has_email: Option<bool>,
) -> Option<ExportFilters> {
    let mut filters = ExportFilters::new();
    if let Some(s) = status {
        filters = filters.status(s);
    }
    if let Some(q) = search {
        filters = filters.search(q);
    }
    if let Some(h) = has_email {
        filters = filters.has_email(h);
    }
    (!filters.is_empty()).then_some(filters)
}

/// Prints progress until the job is terminal or the user hits Ctrl-C.
async fn follow(handle: &ChannelHandle, job_id: &JobId) -> Option<ProgressEvent> {
    tokio::select! {
        ev = handle.wait_for_terminal(job_id, |ev| println!("{}", describe(ev))) => ev,
        _ = tokio::signal::ctrl_c() => None,
    }
}

fn describe(ev: &ProgressEvent) -> String {
    match ev {
        ProgressEvent::Import(p) => match &p.error {
            Some(err) => format!("[{}] error: {err}", p.job_id),
            None => format!(
                "[{}] processed {} (ok {}, failed {}, duplicates {}){}",
                p.job_id,
                p.processed.unwrap_or(0),
                p.success.unwrap_or(0),
                p.failed.unwrap_or(0),
                p.duplicates_count.unwrap_or(0),
                if p.is_done() { " done" } else { "" },
            ),
        },
        ProgressEvent::Export(p) => match &p.error {
            Some(err) => format!("[{}] error: {err}", p.job_id),
            None => {
                let pct = p
                    .percent_complete()
                    .map(|v| format!(" {v:.0}%"))
                    .unwrap_or_default();
                let total = p.total.map(|t| format!("/{t}")).unwrap_or_default();
                format!(
                    "[{}] exported {}{total}{pct}{}",
                    p.job_id,
                    p.processed.unwrap_or(0),
                    if p.is_download_ready() { " ready" } else { "" },
                )
            }
        },
    }
}
