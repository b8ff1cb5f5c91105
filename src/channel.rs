//! Single slot handoff between a libcurl data callback and one async waiter.
//!
//! libcurl calls its read/write callbacks synchronously from inside
//! `curl_multi_socket_action`. When nobody is waiting for the data the
//! callback has to answer "pause" so the transfer stops in that direction
//! until the next waiter arrives and the direction is unpaused again.

/// How a closed waiter is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The transfer finished, the waiter sees end of stream.
    EndOfStream,
    /// The transfer was aborted or torn down underneath the waiter.
    Cancelled,
}

/// What a data callback should report back to libcurl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    /// The waiter consumed this many bytes.
    Consumed(usize),
    /// The waiter asked for the transfer to be aborted.
    Abort,
    /// Nobody is waiting, pause this direction.
    Pause,
}

/// A pending async operation parked in a [`PauseChannel`].
pub(crate) trait Waiter {
    /// Resolve the waiter without handing it any data.
    fn close(self, signal: Signal);

    /// True once the caller dropped the future that owns this waiter.
    fn is_abandoned(&self) -> bool;
}

/// A waiter that can be handed a buffer of type `B`.
pub(crate) trait Accept<B>: Waiter {
    fn accept(self, buf: B) -> Submitted;
}

pub(crate) struct PauseChannel<W> {
    waiter: Option<W>,
}

impl<W: Waiter> PauseChannel<W> {
    pub fn new() -> Self {
        Self { waiter: None }
    }

    /// Whether a live waiter is parked. Abandoned waiters do not count.
    pub fn is_pending(&self) -> bool {
        self.waiter.as_ref().is_some_and(|w| !w.is_abandoned())
    }

    /// Park a waiter. Hands it back if another live waiter is already parked.
    pub fn register(&mut self, waiter: W) -> Result<(), W> {
        if self.is_pending() {
            return Err(waiter);
        }
        self.waiter = Some(waiter);
        Ok(())
    }

    /// Offer a buffer from the engine callback to the parked waiter.
    pub fn submit<B>(&mut self, buf: B) -> Submitted
    where
        W: Accept<B>,
    {
        match self.waiter.take() {
            Some(waiter) if !waiter.is_abandoned() => waiter.accept(buf),
            _ => Submitted::Pause,
        }
    }

    /// Resolve and clear the parked waiter, if any.
    pub fn close(&mut self, signal: Signal) {
        if let Some(waiter) = self.waiter.take() {
            waiter.close(signal);
        }
    }

    pub fn waiter(&self) -> Option<&W> {
        self.waiter.as_ref()
    }
}

impl<W: Waiter> Default for PauseChannel<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct Recorder {
        max: usize,
        seen: Rc<RefCell<Vec<u8>>>,
        closed: Rc<Cell<Option<Signal>>>,
        abandoned: bool,
    }

    impl Waiter for Recorder {
        fn close(self, signal: Signal) {
            self.closed.set(Some(signal));
        }

        fn is_abandoned(&self) -> bool {
            self.abandoned
        }
    }

    impl Accept<&[u8]> for Recorder {
        fn accept(self, buf: &[u8]) -> Submitted {
            let n = buf.len().min(self.max);
            self.seen.borrow_mut().extend_from_slice(&buf[..n]);
            Submitted::Consumed(n)
        }
    }

    fn recorder(max: usize) -> (Recorder, Rc<RefCell<Vec<u8>>>, Rc<Cell<Option<Signal>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let closed = Rc::new(Cell::new(None));
        let recorder = Recorder {
            max,
            seen: seen.clone(),
            closed: closed.clone(),
            abandoned: false,
        };
        (recorder, seen, closed)
    }

    #[test]
    fn test_submit_without_waiter_pauses() {
        let mut channel: PauseChannel<Recorder> = PauseChannel::new();
        assert_eq!(channel.submit(&b"data"[..]), Submitted::Pause);
    }

    #[test]
    fn test_submit_hands_buffer_once() {
        let mut channel = PauseChannel::new();
        let (waiter, seen, _) = recorder(3);
        assert!(channel.register(waiter).is_ok());
        assert_eq!(channel.submit(&b"hello"[..]), Submitted::Consumed(3));
        assert_eq!(&seen.borrow()[..], b"hel");
        // the slot is cleared after one delivery
        assert!(!channel.is_pending());
        assert_eq!(channel.submit(&b"lo"[..]), Submitted::Pause);
    }

    #[test]
    fn test_second_register_rejected() {
        let mut channel = PauseChannel::new();
        let (first, _, _) = recorder(1);
        let (second, _, _) = recorder(1);
        assert!(channel.register(first).is_ok());
        assert!(channel.register(second).is_err());
        assert!(channel.is_pending());
    }

    #[test]
    fn test_abandoned_waiter_replaced_and_skipped() {
        let mut channel = PauseChannel::new();
        let (mut stale, stale_seen, _) = recorder(8);
        stale.abandoned = true;
        assert!(channel.register(stale).is_ok());
        assert!(!channel.is_pending());
        assert_eq!(channel.submit(&b"x"[..]), Submitted::Pause);
        assert!(stale_seen.borrow().is_empty());

        let (fresh, seen, _) = recorder(8);
        assert!(channel.register(fresh).is_ok());
        assert_eq!(channel.submit(&b"xy"[..]), Submitted::Consumed(2));
        assert_eq!(&seen.borrow()[..], b"xy");
    }

    #[test]
    fn test_close_resolves_with_signal() {
        let mut channel = PauseChannel::new();
        let (waiter, _, closed) = recorder(1);
        assert!(channel.register(waiter).is_ok());
        channel.close(Signal::Cancelled);
        assert_eq!(closed.get(), Some(Signal::Cancelled));
        assert!(channel.waiter().is_none());

        // closing an empty channel is a no-op
        channel.close(Signal::EndOfStream);
        assert_eq!(closed.get(), Some(Signal::Cancelled));
    }
}
