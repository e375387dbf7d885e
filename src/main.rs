use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chunkflow::config::{load_config, AppConfig};
use chunkflow::error::GatewayError;
use chunkflow::observability::init_tracing;
use chunkflow::protocol::StreamConverter;
use chunkflow::session::{
    await_started, checker_from_config, drive, CallerStream, SessionCallback, SessionOptions,
    SessionOutcome,
};
use chunkflow::simulation::SimulationPool;
use chunkflow::stream::sse_frame_stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK_BYTES: usize = 8 * 1024;

const USAGE: &str = "usage: chunkflow [--config <path>] [<transcript>]

Reads an upstream SSE transcript (file or stdin), normalizes it and writes
the caller-facing SSE stream to stdout.";

struct CliArgs {
    config_path: Option<String>,
    transcript: Option<String>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        config_path: None,
        transcript: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or("--config requires a path")?;
                parsed.config_path = Some(path);
            }
            "-h" | "--help" => return Err(String::new()),
            _ if arg.starts_with('-') && arg != "-" => {
                return Err(format!("unknown option: {arg}"));
            }
            _ => {
                if parsed.transcript.replace(arg).is_some() {
                    return Err("only one transcript may be given".to_string());
                }
            }
        }
    }
    Ok(parsed)
}

fn load_app_config(path: Option<&str>) -> AppConfig {
    let path = path.unwrap_or_else(|| {
        if std::path::Path::new("config.yaml").exists() {
            "config.yaml"
        } else {
            "config.example.yaml"
        }
    });
    load_config(path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from {path}: {e}");
        std::process::exit(1);
    })
}

fn main() {
    let args = parse_args().unwrap_or_else(|msg| {
        if !msg.is_empty() {
            eprintln!("{msg}");
        }
        eprintln!("{USAGE}");
        std::process::exit(2);
    });
    let config = load_app_config(args.config_path.as_deref());
    init_tracing(&config.logging.level, config.logging.json);

    let runtime = build_runtime().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    });

    let outcome = runtime.block_on(run(config, args.transcript));
    if !outcome.is_success() {
        std::process::exit(1);
    }
}

/// Stdin and file reads run on the blocking pool, so only the timer driver
/// is needed.
fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
}

async fn run(config: AppConfig, transcript: Option<String>) -> SessionOutcome {
    let (caller, mut events) = CallerStream::channel();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            if let Err(err) = stdout.write_all(event.to_sse().as_bytes()).await {
                tracing::error!(error = %err, "failed to write to stdout");
                return;
            }
        }
        let _ = stdout.flush().await;
    });

    let outcome = run_session(&config, transcript, caller).await;
    if let Err(err) = writer.await {
        tracing::error!(error = %err, "stdout writer task failed");
    }
    outcome
}

async fn run_session(
    config: &AppConfig,
    transcript: Option<String>,
    caller: CallerStream,
) -> SessionOutcome {
    let options = match SessionOptions::from_config(config) {
        Ok(options) => options,
        Err(err) => return SessionCallback::new(SessionOptions::default(), caller).fail(err),
    };
    let mut session =
        SessionCallback::new(options, caller).with_checker(checker_from_config(config));
    if config.simulation.enabled {
        match SimulationPool::current(config.simulation.max_concurrent_parsers) {
            Ok(pool) => session = session.with_simulation_pool(&pool),
            Err(err) => return session.fail(err),
        }
    }

    let reader = match open_transcript(transcript.as_deref()).await {
        Ok(reader) => reader,
        Err(err) => return session.fail(err),
    };

    let (started_tx, started_rx) = oneshot::channel();
    let (bytes_tx, bytes_rx) = mpsc::channel(16);
    tokio::spawn(pump_reader(reader, started_tx, bytes_tx));

    let timeout = Duration::from_millis(config.handshake.timeout_ms);
    if let Err(err) = await_started(started_rx, timeout).await {
        return session.fail(err);
    }

    let body = futures_util::stream::unfold(bytes_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let mut converter = StreamConverter::for_provider(config.stream.provider);
    drive(sse_frame_stream(body), &mut converter, &mut session).await
}

async fn open_transcript(
    path: Option<&str>,
) -> Result<Box<dyn AsyncRead + Unpin + Send>, GatewayError> {
    match path {
        None | Some("-") => Ok(Box::new(tokio::io::stdin())),
        Some(path) => tokio::fs::File::open(path)
            .await
            .map(|file| Box::new(file) as Box<dyn AsyncRead + Unpin + Send>)
            .map_err(|e| GatewayError::Transport(format!("cannot open {path}: {e}"))),
    }
}

/// Forward the transcript in fixed-size reads, signalling `started` once the
/// first bytes arrive.
async fn pump_reader(
    mut reader: Box<dyn AsyncRead + Unpin + Send>,
    started: oneshot::Sender<()>,
    out: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut started = Some(started);
    loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(signal) = started.take() {
                    let _ = signal.send(());
                }
                if out.send(Ok(buf.freeze())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = out.send(Err(err)).await;
                return;
            }
        }
    }
    // Empty input still starts; the driver then reports the missing end marker.
    if let Some(signal) = started.take() {
        let _ = signal.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_drives_timers_and_file_reads() {
        let runtime = build_runtime().expect("runtime");
        let text = runtime.block_on(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            tokio::fs::read_to_string("config.example.yaml").await
        });
        assert!(text.expect("example config").contains("simulation"));
    }
}
