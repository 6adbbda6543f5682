//! Every blocking tape operation is bounded by a 30s watchdog (§4.1). The
//! ioctl/read/write runs on a dedicated thread; the caller waits with a
//! timeout and, on expiry, abandons the thread (an ioctl in flight cannot
//! be safely interrupted) and returns `OperationTimeout`. The next
//! operation against that device must reopen its file descriptor.

use std::sync::mpsc;
use std::time::Duration;

use tbarr_types::TapeBackArrError;

pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

/// Runs `f` on a detached thread, returning `OperationTimeout` if it does
/// not complete within `timeout`.
pub fn with_watchdog<T, F>(timeout: Duration, f: F) -> Result<T, TapeBackArrError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TapeBackArrError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        // send() failing just means the caller already timed out and
        // stopped listening; there is nothing further to do.
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(TapeBackArrError::OperationTimeout),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(TapeBackArrError::InternalError("watchdog thread panicked".into()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fast_operation_succeeds() {
        let result = with_watchdog(Duration::from_secs(1), || Ok::<_, TapeBackArrError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn slow_operation_times_out() {
        let result = with_watchdog(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(200));
            Ok::<_, TapeBackArrError>(())
        });
        assert!(matches!(result, Err(TapeBackArrError::OperationTimeout)));
    }
}
