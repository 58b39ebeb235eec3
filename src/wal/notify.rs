//! A size-1, non-blocking wake channel: readers only need "something changed,
//! re-poll", never a count. At most one pending wake per reader; `close` always
//! wakes a waiter out of its timeout.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

pub struct Notifier {
    tx: SyncSender<()>,
}

pub struct Waiter {
    rx: Receiver<()>,
}

/// The reader's 500ms internal poll timeout (see spec §5 "Timeouts").
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub fn channel() -> (Notifier, Waiter) {
    let (tx, rx) = sync_channel(1);
    (Notifier { tx }, Waiter { rx })
}

impl Notifier {
    /// Non-blocking; a pending unconsumed wake means the reader hasn't polled yet,
    /// so dropping this send is correct (it would already wake up).
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

impl Waiter {
    /// Waits for a wake or the internal poll timeout, whichever comes first.
    /// Returns `true` if woken explicitly, `false` on timeout.
    pub fn wait(&self) -> bool {
        match self.rx.recv_timeout(POLL_TIMEOUT) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn notify_wakes_waiter_immediately() {
        let (notifier, waiter) = channel();
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        notifier.notify();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn extra_notifies_do_not_queue() {
        let (notifier, waiter) = channel();
        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(waiter.wait());
        let started = Instant::now();
        assert!(!waiter.wait());
        assert!(started.elapsed() >= POLL_TIMEOUT);
    }
}
