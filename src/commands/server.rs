// SPDX-License-Identifier: Apache-2.0

//! JSON-lines dispatcher
//!
//! Each request line runs on its own task; at most `max_in_flight` run at
//! once. Responses are written by a single task, in completion order.

use std::future::{self, Future};
use std::io;
use std::sync::Arc;

use gate_core::DatabaseDriver;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{handle_line, undecodable_line, ResponseFrame};
use crate::executor::GuardedExecutor;

/// Serves requests until the reader reaches end of input
///
/// In-flight requests are allowed to finish before this returns.
pub async fn serve<D, R, W>(
    executor: Arc<GuardedExecutor<D>>,
    reader: R,
    writer: W,
    max_in_flight: usize,
) -> io::Result<()>
where
    D: DatabaseDriver,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_until(executor, reader, writer, max_in_flight, future::pending()).await
}

/// Like [`serve`], but also stops reading once `shutdown` completes
///
/// Requests already dispatched still run to completion and are answered,
/// whichever way input ends.
pub async fn serve_until<D, R, W, S>(
    executor: Arc<GuardedExecutor<D>>,
    reader: R,
    writer: W,
    max_in_flight: usize,
    shutdown: S,
) -> io::Result<()>
where
    D: DatabaseDriver,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let max_in_flight = max_in_flight.max(1);
    let (tx, rx) = mpsc::channel::<String>(max_in_flight);
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let mut tasks = JoinSet::new();
    let mut segments = reader.split(b'\n');
    let mut received = 0u64;
    tokio::pin!(shutdown);

    let read_result = loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            segment = segments.next_segment() => Some(segment),
        };
        let mut segment = match next {
            Some(Ok(Some(segment))) => segment,
            Some(Ok(None)) => break Ok(()),
            Some(Err(e)) => break Err(e),
            None => {
                info!("Shutdown requested, no further requests accepted");
                break Ok(());
            }
        };
        if segment.last() == Some(&b'\r') {
            segment.pop();
        }

        let line = match String::from_utf8(segment) {
            Ok(line) => line,
            Err(e) => {
                received += 1;
                warn!("Request line is not valid UTF-8");
                send_response(&tx, &undecodable_line(e.utf8_error())).await;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        received += 1;

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => break Err(io::Error::other(e)),
        };
        let executor = Arc::clone(&executor);
        let tx = tx.clone();

        tasks.spawn(async move {
            let response = handle_line(&executor, &line).await;
            drop(permit);
            send_response(&tx, &response).await;
        });

        while let Some(joined) = tasks.try_join_next() {
            log_join(joined);
        }
    };

    if let Err(e) = &read_result {
        error!(in_flight = tasks.len(), "Reading requests failed: {}", e);
    }
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    drop(tx);

    writer_task.await.map_err(io::Error::other)??;
    info!(requests = received, "Input closed, dispatcher stopped");
    read_result
}

async fn send_response(tx: &mpsc::Sender<String>, response: &ResponseFrame) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if tx.send(json).await.is_err() {
                error!("Response writer stopped; dropping response");
            }
        }
        Err(e) => error!("Failed to encode response: {}", e),
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Request task failed: {}", e);
    }
}
