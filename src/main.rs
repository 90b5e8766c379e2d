use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use futures::StreamExt;
use mask_pipeline::{FileRegistry, FileStatus, HttpRemoteClient, PipelineConfig, RemoteStageClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "mask-pipeline",
    about = "Drive files through the remote GDPR masking pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files and run them through process, mask and archive
    Run { paths: Vec<PathBuf> },
    /// Upload a file without starting the pipeline
    Upload { path: PathBuf },
    /// List files and their pipeline status
    List,
    /// Download a file's masked artifact
    Download {
        filename: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Delete one file
    Delete { filename: String },
    /// Delete every file
    DeleteAll,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mask_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    info!(
        base_url = %config.base_url,
        owner = %config.owner,
        poll_interval_ms = config.poll_interval_ms,
        "starting"
    );

    let client = Arc::new(HttpRemoteClient::new(&config));
    let registry = FileRegistry::new(client.clone(), config);

    match cli.command {
        Command::Run { paths } => {
            if paths.is_empty() {
                bail!("no files given");
            }
            let mut ids = Vec::new();
            for path in &paths {
                let record = registry
                    .upload(path)
                    .await
                    .with_context(|| format!("uploading {}", path.display()))?;
                println!("uploaded {} ({} bytes)", record.filename, record.file_size);
                registry.start_processing(record.id).await?;
                watch_record(&registry, record.id);
                ids.push(record.id);
            }
            let mut failures = 0usize;
            for id in ids {
                let record = registry.wait_terminal(id).await?;
                if record.status == FileStatus::Failed {
                    failures += 1;
                    eprintln!(
                        "{}: failed ({})",
                        record.filename,
                        record.error_message.as_deref().unwrap_or("unknown error")
                    );
                } else {
                    println!("{}: done", record.filename);
                }
            }
            registry.shutdown().await;
            if failures > 0 {
                bail!("{failures} file(s) failed");
            }
        }
        Command::Upload { path } => {
            let record = registry.upload(&path).await?;
            println!(
                "uploaded {} ({} bytes) as {}",
                record.filename, record.file_size, record.id
            );
        }
        Command::List => {
            registry.sync_remote().await?;
            for record in registry.list().await {
                println!(
                    "{:<40} {:>12}  {}",
                    record.filename,
                    record.file_size,
                    record.status
                );
            }
        }
        Command::Download { filename, output } => {
            // The registry gates downloads on local pipeline state; a plain
            // fetch of a server-side artifact goes straight to the client.
            let mut stream = client.download(&filename).await?;
            let mut out = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                out.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            out.flush().await?;
            println!("wrote {written} bytes to {}", output.display());
        }
        Command::Delete { filename } => {
            registry.sync_remote().await?;
            match registry.find_by_filename(&filename).await {
                Some(record) => registry.delete(record.id).await?,
                None => bail!("no file named {filename}"),
            }
            println!("deleted {filename}");
        }
        Command::DeleteAll => {
            registry.sync_remote().await?;
            registry.delete_all().await;
            println!("deleted all files");
        }
    }

    Ok(())
}

/// Prints status changes for one record until it settles.
fn watch_record(registry: &Arc<FileRegistry>, id: uuid::Uuid) {
    let registry = registry.clone();
    tokio::spawn(async move {
        let mut rx = registry.subscribe();
        let mut last = String::new();
        loop {
            let Some(record) = registry.get(id).await else {
                break;
            };
            let line = format!(
                "{}: {} {}%",
                record.filename, record.status, record.progress.completed_units
            );
            if line != last {
                println!("{line}");
                last = line;
            }
            if record.status.is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}
