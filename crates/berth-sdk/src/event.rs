//! Lifecycle event streaming.
//!
//! Provides an async listener for following a run programmatically.

use berth_runtime::event::RunEvent;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Follows the lifecycle events of an orchestrator.
///
/// Events missed because the listener fell behind are skipped.
#[derive(Debug)]
pub struct EventListener {
    receiver: Receiver<RunEvent>,
}

impl EventListener {
    /// Wraps a subscription obtained from the orchestrator.
    #[must_use]
    pub const fn new(receiver: Receiver<RunEvent>) -> Self {
        Self { receiver }
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the orchestrator is gone.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event listener lagged, events skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<RunEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event listener lagged, events skipped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Waits until the run finishes, returning every event seen on the way.
    pub async fn until_finished(&mut self) -> Vec<RunEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.next().await {
            let done = matches!(event, RunEvent::RunFinished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn lagging_listener_skips_to_newest_events() {
        let (tx, rx) = broadcast::channel(2);
        let mut listener = EventListener::new(rx);
        for i in 0..4 {
            let _ = tx.send(RunEvent::JobExited {
                name: "job".into(),
                exit_code: i,
            });
        }
        assert_eq!(
            listener.next().await,
            Some(RunEvent::JobExited {
                name: "job".into(),
                exit_code: 2
            })
        );
        drop(tx);
        assert!(listener.try_next().is_some());
        assert_eq!(listener.next().await, None);
    }
}
