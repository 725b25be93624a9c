use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::Error;

/// The deadline and cancellation signal that bound an operation and all of its retries.
///
/// Contexts are cheap to clone. Deriving a context never loosens its parent: a child's deadline
/// is the earliest of both, and cancelling the parent cancels every child.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    signals: Vec<watch::Receiver<bool>>,
}

/// Cancels the [`Context`] it was created with, as well as any context derived from it.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers are owned by the contexts, failing to send means nobody is listening.
        let _ = self.0.send(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A timeout too large to be represented as a deadline leaves the parent's deadline as it is.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            signals: self.signals.clone(),
        }
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(receiver);
        (
            Self {
                deadline: self.deadline,
                signals,
            },
            CancelHandle(Arc::new(sender)),
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|signal| *signal.borrow())
    }

    /// The error to report if this context is done. Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            Some(Error::Canceled)
        } else if matches!(self.remaining(), Some(remaining) if remaining.is_zero()) {
            Some(Error::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drives `fut` until it completes or this context is done, whichever comes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Canceled),
            _ = self.expired() => Err(Error::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }

    /// Sleeps for `delay` unless the context ends first.
    ///
    /// Fails immediately with [`Error::DeadlineExceeded`] when the deadline falls before the end
    /// of the delay.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Error> {
        self.check()?;
        if matches!(self.remaining(), Some(remaining) if remaining < delay) {
            return Err(Error::DeadlineExceeded);
        }
        self.run(tokio::time::sleep(delay)).await
    }

    async fn cancelled(&self) {
        if self.signals.is_empty() {
            return futures::future::pending().await;
        }
        let waits = self
            .signals
            .iter()
            .cloned()
            .map(|signal| Box::pin(wait_for_cancel(signal)));
        select_all(waits).await;
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures::future::pending().await,
        }
    }
}

async fn wait_for_cancel(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow() {
            return;
        }
        if signal.changed().await.is_err() {
            // The handle is gone without cancelling: this signal can never fire.
            return futures::future::pending().await;
        }
    }
}
