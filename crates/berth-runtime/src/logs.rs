//! Job output collection.
//!
//! Runtimes push [`OutputChunk`]s into a bounded channel; a background task
//! drains it into an ordered list of [`LogEntry`]s. When the buffer is full
//! the producer waits, so no line is ever dropped. Lines keep their order
//! within a stream; how stdout and stderr interleave depends on the runtime.

use std::time::Duration;

use berth_common::types::OutputStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runtime::{OutputChunk, OutputSender};

/// One collected line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the collected sequence, starting at 0.
    pub seq: u64,
    /// Container that produced the line.
    pub source: String,
    /// Stream the line came from.
    pub stream: OutputStream,
    /// The line itself.
    pub line: String,
    /// When the collector received the line.
    pub at: DateTime<Utc>,
}

/// Background task that owns the receiving end of the output channel.
#[derive(Debug)]
pub struct LogCollector {
    sender: Option<OutputSender>,
    handle: JoinHandle<Vec<LogEntry>>,
    stop: CancellationToken,
    drain_timeout: Duration,
}

impl LogCollector {
    /// Spawns the collector on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(capacity: usize, echo: bool, drain_timeout: Duration) -> Self {
        let (sender, rx) = mpsc::channel(capacity);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(collect(rx, stop.clone(), echo));
        Self {
            sender: Some(sender),
            handle,
            stop,
            drain_timeout,
        }
    }

    /// Returns a sender for a runtime to push output into.
    ///
    /// Returns a closed sender once [`finish`](Self::finish) has begun.
    #[must_use]
    pub fn sender(&self) -> OutputSender {
        self.sender.clone().unwrap_or_else(|| mpsc::channel(1).0)
    }

    /// Waits for all producers to hang up, then returns the collected lines.
    ///
    /// Producers still holding a sender after the drain timeout are cut
    /// off; whatever they already buffered is kept.
    pub async fn finish(mut self) -> Vec<LogEntry> {
        drop(self.sender.take());
        if let Ok(joined) = tokio::time::timeout(self.drain_timeout, &mut self.handle).await {
            return unwrap_join(joined);
        }
        tracing::warn!(
            timeout = ?self.drain_timeout,
            "output producers still open after drain timeout, closing channel"
        );
        self.stop.cancel();
        unwrap_join(self.handle.await)
    }
}

fn unwrap_join(joined: Result<Vec<LogEntry>, tokio::task::JoinError>) -> Vec<LogEntry> {
    joined.unwrap_or_else(|e| {
        tracing::error!(error = %e, "log collector task failed");
        Vec::new()
    })
}

async fn collect(
    mut rx: mpsc::Receiver<OutputChunk>,
    stop: CancellationToken,
    echo: bool,
) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                rx.close();
                while let Ok(chunk) = rx.try_recv() {
                    push(&mut entries, chunk, echo);
                }
                break;
            }
            chunk = rx.recv() => match chunk {
                Some(chunk) => push(&mut entries, chunk, echo),
                None => break,
            },
        }
    }
    tracing::debug!(lines = entries.len(), "log collection finished");
    entries
}

fn push(entries: &mut Vec<LogEntry>, chunk: OutputChunk, echo: bool) {
    if echo {
        tracing::info!(
            target: "berth::job",
            source = %chunk.source,
            stream = %chunk.stream,
            "{}",
            chunk.data
        );
    }
    entries.push(LogEntry {
        seq: entries.len() as u64,
        source: chunk.source,
        stream: chunk.stream,
        line: chunk.data,
        at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_lines_in_send_order() {
        let collector = LogCollector::spawn(4, false, Duration::from_secs(1));
        let tx = collector.sender();
        for i in 0..10 {
            tx.send(OutputChunk::new("job", OutputStream::Stdout, format!("line {i}")))
                .await
                .unwrap();
        }
        drop(tx);
        let entries = collector.finish().await;
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[3].line, "line 3");
        assert_eq!(entries[9].seq, 9);
    }

    #[tokio::test]
    async fn single_slot_buffer_applies_backpressure_without_loss() {
        let collector = LogCollector::spawn(1, false, Duration::from_secs(1));
        let tx = collector.sender();
        let producer = tokio::spawn(async move {
            for i in 0..500 {
                tx.send(OutputChunk::new("job", OutputStream::Stderr, i.to_string()))
                    .await
                    .unwrap();
            }
        });
        producer.await.unwrap();
        let entries = collector.finish().await;
        assert_eq!(entries.len(), 500);
        assert!(entries.iter().enumerate().all(|(i, e)| e.line == i.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_producer_is_cut_off_after_drain_timeout() {
        let collector = LogCollector::spawn(8, false, Duration::from_millis(50));
        let tx = collector.sender();
        tx.send(OutputChunk::new("job", OutputStream::Stdout, "kept"))
            .await
            .unwrap();
        let entries = collector.finish().await;
        assert_eq!(entries.len(), 1);
        assert!(tx.is_closed());
    }
}
