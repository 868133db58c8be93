use std::{net::SocketAddr, path::PathBuf, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use thiserror::Error as ThisError;
use tokio::{fs::File, io, net::TcpListener, signal, task::JoinSet, time};
use tokio_fairshare::{Controller, TransferId, TransferStatus};
use tracing::{Instrument, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// Total bandwidth shared by all transfers, in bytes per second
    #[arg(short = 'b', long, value_name = "bytes/s")]
    budget: u64,

    /// Directory the input files are copied into
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Optional address for the status API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: Option<SocketAddr>,

    /// Interval between progress log lines, 0 disables them
    #[arg(long, value_name = "ms", default_value_t = 1000)]
    progress_interval_ms: u64,

    /// Read buffer per transfer
    #[arg(long, value_name = "bytes", default_value_t = 8 * 1024)]
    buffer_size_bytes: usize,

    /// Files to copy
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.budget == 0 {
            anyhow::bail!("--budget must be a positive number of bytes per second");
        }

        if self.buffer_size_bytes == 0 {
            anyhow::bail!("--buffer-size-bytes must be positive");
        }

        if self.inputs.is_empty() {
            anyhow::bail!("at least one input file is required");
        }

        Ok(())
    }
}

#[derive(Clone)]
struct ApiState {
    controller: Controller,
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("transfer not found")]
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_transfers(State(state): State<ApiState>) -> Json<Vec<TransferStatus>> {
    Json(state.controller.transfers())
}

async fn get_transfer(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TransferStatus>, ApiError> {
    state
        .controller
        .transfer(&TransferId::from(id.as_str()))
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn serve_api(addr: SocketAddr, controller: Controller) -> io::Result<()> {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/transfers", get(list_transfers))
        .route("/transfers/{id}", get(get_transfer))
        .with_state(ApiState { controller });

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status API listening");
    axum::serve(listener, app).await
}

async fn copy_file(
    controller: Controller,
    input: PathBuf,
    output_dir: PathBuf,
    buffer_size: usize,
) -> anyhow::Result<u64> {
    let name = input
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", input.display()))?;
    let target = output_dir.join(name);

    let source = File::open(&input).await?;
    let size = source.metadata().await?.len();
    let mut sink = File::create(&target).await?;

    if size == 0 {
        // Nothing to pace, and the controller rejects empty transfers.
        return Ok(0);
    }

    let mut reader = controller.acquire_reader_with_capacity(source, size, buffer_size)?;
    let span = tracing::info_span!("transfer", id = %reader.id(), path = %input.display(), size);
    async move {
        let copied = io::copy(&mut reader, &mut sink).await?;
        reader.close()?;

        if copied != size {
            warn!(copied, "file size changed while copying");
        }
        info!(copied, "done");
        anyhow::Ok(copied)
    }
    .instrument(span)
    .await
}

fn log_progress(controller: &Controller) {
    for t in controller.transfers() {
        info!(
            id = %t.id,
            read = t.bytes_read,
            size = t.declared_size,
            limit = t.limit,
            "progress"
        );
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();
    config.validate()?;

    tokio::fs::create_dir_all(&config.output).await?;
    let controller = Controller::new(config.budget)?;

    if let Some(addr) = config.api {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_api(addr, controller).await {
                error!(error = %err, "status API failed");
            }
        });
    }

    let mut transfers = JoinSet::new();
    for input in &config.inputs {
        transfers.spawn(copy_file(
            controller.clone(),
            input.clone(),
            config.output.clone(),
            config.buffer_size_bytes,
        ));
    }
    info!(budget = config.budget, files = config.inputs.len(), "copying");

    let interval = match config.progress_interval_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let mut ticker = time::interval(interval.unwrap_or(Duration::from_secs(3600)));
    ticker.tick().await;

    let (mut copied, mut failed) = (0u64, 0usize);
    loop {
        tokio::select! {
            res = transfers.join_next() => match res {
                Some(Ok(Ok(n))) => copied += n,
                Some(Ok(Err(err))) => {
                    failed += 1;
                    error!(error = %err, "transfer failed");
                }
                Some(Err(err)) => {
                    failed += 1;
                    error!(error = %err, "transfer task panicked");
                }
                None => break,
            },
            _ = ticker.tick(), if interval.is_some() => log_progress(&controller),
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, aborting {} transfers", transfers.len());
                transfers.shutdown().await;
                break;
            }
        }
    }

    info!(copied, failed, "finished");
    if failed > 0 {
        anyhow::bail!("{failed} transfer(s) failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("fairshare").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = parse(&["--budget", "1024", "-o", "out", "a.bin", "b.bin"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.progress_interval_ms, 1000);
        assert_eq!(config.buffer_size_bytes, 8192);
        assert_eq!(config.inputs.len(), 2);
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let config = parse(&["--budget", "0", "-o", "out", "a.bin"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let config = parse(&["-b", "10", "-o", "out", "--buffer-size-bytes", "0", "a.bin"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn inputs_are_required() {
        let res = Config::try_parse_from(["fairshare", "--budget", "10", "-o", "out"]);
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn empty_file_is_copied_without_registering() {
        let dir = std::env::temp_dir().join(format!("fairshare-test-{}", std::process::id()));
        let out = dir.join("out");
        tokio::fs::create_dir_all(&out).await.unwrap();
        let input = dir.join("empty.bin");
        tokio::fs::write(&input, b"").await.unwrap();

        let controller = Controller::new(100).unwrap();
        let copied = copy_file(controller.clone(), input, out.clone(), 64)
            .await
            .unwrap();

        assert_eq!(copied, 0);
        assert!(controller.is_empty());
        assert!(out.join("empty.bin").exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn file_is_copied_through_controller() {
        let dir = std::env::temp_dir().join(format!("fairshare-copy-{}", std::process::id()));
        let out = dir.join("out");
        tokio::fs::create_dir_all(&out).await.unwrap();
        let input = dir.join("data.bin");
        tokio::fs::write(&input, vec![5u8; 300]).await.unwrap();

        let controller = Controller::new(1_000_000).unwrap();
        let copied = copy_file(controller.clone(), input, out.clone(), 64)
            .await
            .unwrap();

        assert_eq!(copied, 300);
        assert!(controller.is_empty());
        assert_eq!(tokio::fs::read(out.join("data.bin")).await.unwrap().len(), 300);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
