//! Cancellable timer abstractions
//!
//! Round deadlines, reopen backoffs and persistence retries are driven by
//! timers that deliver a message into a task's channel when they fire.
//! Cancellation aborts the timer task, so a quorum reached before the
//! deadline simply never sees the timeout message.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One-shot cancellable deadline timer.
///
/// Fires a single message into the given channel after the deadline unless
/// cancelled first. Dropping the timer does not cancel it; call
/// [`DeadlineTimer::cancel`] explicitly.
#[derive(Debug)]
pub struct DeadlineTimer {
    handle: JoinHandle<()>,
}

impl DeadlineTimer {
    /// Starts a timer that sends `msg` on `tx` after `deadline`.
    pub fn start<T: Send + 'static>(deadline: Duration, tx: mpsc::Sender<T>, msg: T) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            // Receiver gone means the owning task is shutting down.
            let _ = tx.send(msg).await;
        });
        Self { handle }
    }

    /// Cancels the timer; the message will not be delivered.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true if the timer has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
