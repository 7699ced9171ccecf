//! Time-bounded calls to external sources on worker threads.
//!
//! A source call runs on its own named thread and reports through a
//! channel. The caller waits at most the source's timeout; a worker that
//! overruns is abandoned and its late result is dropped with the receiver.
//! Workers only touch request-local data and `Arc`-shared read-only handles.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::candidate::Source;
use crate::error::{ServiceError, ServiceResult};

/// A source call in flight.
pub struct Pending<T> {
    source: Source,
    started: Instant,
    timeout: Duration,
    rx: Result<mpsc::Receiver<ServiceResult<T>>, ServiceError>,
}

/// Start `call` on a worker thread, bounded by `timeout`.
pub fn spawn<T, F>(source: Source, timeout: Duration, call: F) -> Pending<T>
where
    T: Send + 'static,
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("medcode-{source}"))
        .spawn(move || {
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(call());
        });

    Pending {
        source,
        started: Instant::now(),
        timeout,
        rx: spawned
            .map(|_| rx)
            .map_err(|e| ServiceError::unavailable(source.as_str(), format!("failed to spawn worker: {e}"))),
    }
}

impl<T> Pending<T> {
    pub fn source(&self) -> Source {
        self.source
    }

    /// Block until the result arrives or the source's deadline passes.
    ///
    /// Returns the outcome and the time the source took (or was allowed).
    pub fn wait(self) -> (ServiceResult<T>, Duration) {
        let rx = match self.rx {
            Ok(rx) => rx,
            Err(e) => return (Err(e), self.started.elapsed()),
        };
        let remaining = self.timeout.saturating_sub(self.started.elapsed());
        let outcome = match rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ServiceError::Timeout {
                service: self.source.as_str().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ServiceError::unavailable(
                self.source.as_str(),
                "worker exited without a result",
            )),
        };
        (outcome, self.started.elapsed())
    }
}
