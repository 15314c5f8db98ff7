//! Handler execution, optionally bounded by a deadline.
//!
//! A Rust thread cannot be pre-empted, so a bounded handler runs on its own
//! thread while the worker waits on a channel. On expiry the worker moves on
//! and the handler thread is left to finish (or hang) on its own; it never
//! touches the queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tracing::warn;

use crate::catalog::Handler;
use crate::dispatch::DispatchError;

/// Deadline for a job with the given TTR (seconds).
pub fn deadline_for(ttr_secs: u64, ratio: f64) -> Duration {
    Duration::from_secs_f64(ttr_secs as f64 * ratio)
}

/// Run `handler` with `payload`, inline when `deadline` is `None`.
///
/// Panics are reported as handler errors.
pub fn run_handler(
    handler: &Handler,
    payload: Value,
    deadline: Option<Duration>,
    label: &str,
) -> Result<(), DispatchError> {
    match deadline {
        None => run_inline(handler, &payload),
        Some(limit) => run_bounded(handler, payload, limit, label),
    }
}

fn run_inline(handler: &Handler, payload: &Value) -> Result<(), DispatchError> {
    call_catching_panics(handler, payload).map_err(DispatchError::Handler)
}

fn call_catching_panics(handler: &Handler, payload: &Value) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn run_bounded(
    handler: &Handler,
    payload: Value,
    limit: Duration,
    label: &str,
) -> Result<(), DispatchError> {
    let (tx, rx) = mpsc::sync_channel(1);
    let handler = Handler::clone(handler);

    thread::Builder::new()
        .name(label.to_string())
        .spawn(move || {
            let _ = tx.send(call_catching_panics(&handler, &payload));
        })
        .map_err(|e| DispatchError::Handler(anyhow!("failed to spawn handler thread: {e}")))?;

    match rx.recv_timeout(limit) {
        Ok(result) => result.map_err(DispatchError::Handler),
        Err(RecvTimeoutError::Timeout) => {
            warn!(handler = label, limit_ms = limit.as_millis() as u64, "handler deadline exceeded");
            Err(DispatchError::Timeout(limit))
        }
        // Panics are caught before the send; this means the thread died some other way.
        Err(RecvTimeoutError::Disconnected) => {
            Err(DispatchError::Handler(anyhow!("handler thread exited without a result")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    fn handler<F>(f: F) -> Handler
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn deadline_is_a_fraction_of_ttr() {
        assert_eq!(deadline_for(120, 0.8), Duration::from_secs(96));
        assert_eq!(deadline_for(1, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn inline_success_and_failure() {
        let ok = handler(|v| {
            assert_eq!(v["n"], 1);
            Ok(())
        });
        assert!(run_handler(&ok, json!({"n": 1}), None, "job-1").is_ok());

        let failing = handler(|_| Err(anyhow!("smtp down")));
        let err = run_handler(&failing, json!(null), None, "job-2").unwrap_err();
        assert!(matches!(err, DispatchError::Handler(e) if e.to_string() == "smtp down"));
    }

    #[test]
    fn inline_panic_becomes_handler_error() {
        let boom = handler(|_| panic!("kaboom"));
        let err = run_handler(&boom, json!(null), None, "job-3").unwrap_err();
        assert!(matches!(err, DispatchError::Handler(e) if e.to_string().contains("kaboom")));
    }

    #[test]
    fn bounded_handler_within_deadline() {
        let ok = handler(|_| Ok(()));
        assert!(run_handler(&ok, json!(null), Some(Duration::from_secs(5)), "job-4").is_ok());

        let failing = handler(|_| Err(anyhow!("nope")));
        assert!(matches!(
            run_handler(&failing, json!(null), Some(Duration::from_secs(5)), "job-5"),
            Err(DispatchError::Handler(_))
        ));
    }

    #[test]
    fn slow_handler_times_out() {
        let slow = handler(|_| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let err = run_handler(&slow, json!(null), Some(Duration::from_millis(20)), "job-6")
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[test]
    fn bounded_panic_is_not_a_timeout() {
        let boom = handler(|_| panic!("kaboom"));
        let err = run_handler(&boom, json!(null), Some(Duration::from_secs(5)), "job-7")
            .unwrap_err();
        assert!(matches!(err, DispatchError::Handler(e) if e.to_string().contains("kaboom")));
    }
}
