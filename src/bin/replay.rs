//! Replay runtime
//!
//! Opens every model in the models directory over an in-process transport
//! and replays recorded traffic into it. Input is JSON lines of the form
//! `{"topic": "home/kitchen/set", "payload": [...]}`; every prediction the
//! models publish is echoed to stdout as `{"topic": ..., "payload": ...}`.
//!
//! Usage:
//!   replay < traffic.jsonl
//!
//! Environment variables:
//!   LABELFLOW_MODELS_DIR - directory of model files (default: models)
//!   LABELFLOW_CHANNEL_BUFFER - inbound channel size (default: 1000)
//!   LABELFLOW_INPUT - JSON-lines file to read instead of stdin
//!   RUST_LOG - log filter (default: info)

use dotenv::dotenv;
use labelflow::classifier::default_factory;
use labelflow::{MemoryTransport, ModelManager, RuntimeConfig};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct ReplayLine {
    topic: String,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct PublishedLine<'a> {
    topic: &'a str,
    payload: Value,
}

impl ReplayLine {
    /// String payloads are forwarded verbatim, anything else as its JSON text.
    fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn echo_publish(topic: &str, payload: &str) {
    let payload = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    match serde_json::to_string(&PublishedLine { topic, payload }) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to encode publish on {}: {}", topic, e),
    }
}

async fn read_lines<R>(source: R, tx: mpsc::Sender<ReplayLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();
    let mut line_no = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayLine>(&line) {
            Ok(parsed) => {
                if tx.send(parsed).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Skipping line {}: {}", line_no, e),
        }
    }
    debug!("Input exhausted after {} lines", line_no);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = RuntimeConfig::from_env()?;
    info!("Replay runtime starting");
    info!("   ├─ Models: {}", config.models_dir.display());
    info!("   ├─ Channel buffer: {}", config.channel_buffer);
    info!(
        "   └─ Input: {}",
        config
            .input
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdin".to_string())
    );

    let transport = Arc::new(MemoryTransport::with_sink(Arc::new(echo_publish)));
    let manager = ModelManager::open(&config.models_dir, transport.clone(), default_factory())?;
    info!("Loaded {} models: {:?}", manager.list_models().len(), manager.list_models());

    let (tx, mut rx) = mpsc::channel::<ReplayLine>(config.channel_buffer);
    match &config.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            tokio::spawn(read_lines(file, tx));
        }
        None => {
            tokio::spawn(read_lines(tokio::io::stdin(), tx));
        }
    }

    let mut delivered = 0usize;
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(line) = next else {
                    info!("End of input");
                    break;
                };
                let payload = line.payload_text();
                let transport = Arc::clone(&transport);
                let topic = line.topic;
                // Message handling retrains and writes SQLite synchronously.
                match tokio::task::spawn_blocking(move || transport.deliver(&topic, &payload)).await {
                    Ok(0) => {}
                    Ok(_) => delivered += 1,
                    Err(e) => error!("Delivery task failed: {}", e),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received CTRL+C, shutting down..."),
                    Err(e) => error!("Failed to listen for CTRL+C: {}", e),
                }
                break;
            }
        }
    }

    manager.shutdown();
    info!("Replay stopped after {} delivered messages", delivered);
    Ok(())
}
