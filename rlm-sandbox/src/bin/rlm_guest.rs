//! Bundled guest program for the spawn transport.
//!
//! Speaks the frame protocol over stdio: one JSON host frame per stdin
//! line in, one JSON guest frame per stdout line out. Logs go to
//! stderr; stdout carries nothing but frames.

use futures::StreamExt;
use rlm_sandbox::guest::run_guest;
use rlm_sandbox::protocol::{GuestFrame, HostFrame};
use rlm_sandbox::EchoInterpreter;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (host_tx, host_rx) = mpsc::channel::<HostFrame>(256);
    let (guest_tx, mut guest_rx) = mpsc::channel::<GuestFrame>(256);

    tokio::spawn(async move {
        let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(item) = lines.next().await {
            let line = match item {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "failed to read host frame");
                    break;
                }
            };
            match serde_json::from_str::<HostFrame>(&line) {
                Ok(frame) => {
                    if host_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // A host we cannot understand is a host we cannot
                    // trust; stop rather than guess.
                    error!(%err, "malformed host frame");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = guest_rx.recv().await {
            let mut line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "failed to encode guest frame");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    run_guest(
        Arc::new(EchoInterpreter::new()),
        host_rx,
        guest_tx,
        CancellationToken::new(),
    )
    .await;
    let _ = writer.await;
}
