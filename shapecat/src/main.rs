use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use shapeio::{
    Bandwidth, RateLimiter, ShapeConfig, ShapeError, ShapedReader, ShapedWriter,
    config::DEFAULT_CHUNK_SIZE, utils::rate_meter::RateMeter,
};
use thiserror::Error as ThisError;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    signal,
    time::Instant,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// File to read from, `-` for stdin
    #[arg(short = 'i', long, default_value = "-")]
    input: PathBuf,

    /// File to write to, `-` for stdout
    #[arg(short = 'o', long, default_value = "-")]
    output: PathBuf,

    /// Bandwidth ceiling, e.g. 65536, 500KB/s or 10MiB/s; 0 or "unlimited" disables it
    #[arg(short = 'r', long, value_name = "bytes/s", default_value = "unlimited")]
    rate: Bandwidth,

    /// Which side of the copy is shaped
    #[arg(long, value_enum, default_value_t = Side::Write)]
    shape: Side,

    /// How much idle time may be banked as burst, in milliseconds
    #[arg(long, value_name = "ms", default_value_t = 1000)]
    burst_window_ms: u64,

    /// Largest number of bytes moved per admission
    #[arg(long, value_name = "bytes", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Address to listen for API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Side {
    Read,
    Write,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.burst_window_ms == 0 {
            anyhow::bail!("--burst-window-ms must be greater than 0");
        }

        if self.chunk_size == 0 {
            anyhow::bail!("--chunk-size must be greater than 0");
        }

        Ok(())
    }

    fn shape_config(&self) -> ShapeConfig {
        ShapeConfig {
            rate: self.rate,
            burst_window_ms: self.burst_window_ms,
            chunk_size: self.chunk_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct RateStatus {
    rate: Bandwidth,
    human: String,
    capacity: f64,
    available: f64,
}

#[derive(Clone)]
struct ApiState {
    limiter: RateLimiter,
}

impl ApiState {
    fn status(&self) -> RateStatus {
        let rate = Bandwidth::new(self.limiter.rate());
        RateStatus {
            rate,
            human: rate.to_string(),
            capacity: self.limiter.capacity(),
            available: self.limiter.available(),
        }
    }

    fn set_rate(&self, rate: Bandwidth) {
        self.limiter.set_rate(rate.bytes_per_sec());
        info!(%rate, "rate changed");
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateReq {
    pub rate: Bandwidth,
}

async fn get_rate(State(state): State<ApiState>) -> Json<RateStatus> {
    Json(state.status())
}

async fn set_rate(
    State(state): State<ApiState>,
    req: Result<Json<RateReq>, JsonRejection>,
) -> Result<Json<RateStatus>, ApiError> {
    let Json(req) = req?;
    state.set_rate(req.rate);
    Ok(Json(state.status()))
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/rate", get(get_rate).patch(set_rate))
        .with_state(state)
}

type Input = Box<dyn AsyncRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

async fn open_input(path: &Path) -> io::Result<Input> {
    if path.as_os_str() == "-" {
        Ok(Box::new(tokio::io::stdin()))
    } else {
        Ok(Box::new(File::open(path).await?))
    }
}

async fn open_output(path: &Path) -> io::Result<Output> {
    if path.as_os_str() == "-" {
        Ok(Box::new(tokio::io::stdout()))
    } else {
        Ok(Box::new(File::create(path).await?))
    }
}

/// Copy `src` into `dst` until EOF, an error, or Ctrl-C, then report what went through.
async fn transfer<R, W>(mut src: R, mut dst: RateMeter<W>) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();

    let res = tokio::select! {
        res = async {
            let n = tokio::io::copy(&mut src, &mut dst).await?;
            dst.flush().await?;
            Ok::<_, io::Error>(n)
        } => res,
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl-C, aborting copy");
            Err(io::Error::from(ShapeError::Cancelled))
        }
    };

    let achieved = Bandwidth::new(dst.rate_bps().unwrap_or_default());
    match res {
        Ok(n) => {
            info!(bytes = n, elapsed = ?started.elapsed(), rate = %achieved, "copy finished");
            Ok(n)
        }
        Err(err) => {
            error!(
                error = %err,
                bytes = dst.total(),
                elapsed = ?started.elapsed(),
                rate = %achieved,
                "copy failed"
            );
            Err(err.into())
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // stdout may carry the payload
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cfg = Config::parse();
    cfg.validate()?;

    let shape = cfg.shape_config();
    let limiter = shape.limiter();

    if let Some(api_addr) = cfg.api {
        let listener = TcpListener::bind(api_addr).await?;
        let app = router(ApiState {
            limiter: limiter.clone(),
        });
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "api server error");
            }
        });
        info!(api = %api_addr, "API listening");
    }

    let input = open_input(&cfg.input).await?;
    let output = open_output(&cfg.output).await?;
    info!(
        input = %cfg.input.display(),
        output = %cfg.output.display(),
        rate = %cfg.rate,
        shape = ?cfg.shape,
        "copying"
    );

    match cfg.shape {
        Side::Read => {
            let src =
                ShapedReader::with_limiter(input, limiter).with_chunk_size(shape.chunk_size());
            transfer(src, RateMeter::new(output)).await?;
        }
        Side::Write => {
            let dst =
                ShapedWriter::with_limiter(output, limiter).with_chunk_size(shape.chunk_size());
            transfer(input, RateMeter::new(dst)).await?;
        }
    }

    Ok(())
}
