//! Management of flow-control windows.
//!
//! Every circuit has a pair of windows (one per direction) limiting how
//! many DATA cells may be in flight, and every stream has its own pair
//! nested inside the circuit's.  A SENDME message replenishes the
//! matching window by a fixed increment; running a window below zero, or
//! receiving a SENDME that would push it above its maximum, is a
//! protocol violation.

use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::{Error, Result};
use velum_cell::relaycell::RelayCmd;

/// Largest allowable value for a send window: limits what a malicious
/// peer can make us buffer.
const MAX_WINDOW: u16 = 1000;

/// Tuning parameters for a kind of window.
pub(crate) trait WindowParams {
    /// The initial value for this kind of window.
    fn start() -> u16;
    /// The amount by which one SENDME increments this kind of window.
    fn increment() -> u16;
}

/// Parameters for a circuit-level window.
#[derive(Clone, Debug)]
pub(crate) struct CircParams;
impl WindowParams for CircParams {
    fn start() -> u16 {
        1000
    }
    fn increment() -> u16 {
        100
    }
}

/// Parameters for a stream-level window.
#[derive(Clone, Debug)]
pub(crate) struct StreamParams;
impl WindowParams for StreamParams {
    fn start() -> u16 {
        500
    }
    fn increment() -> u16 {
        50
    }
}

/// A window to track how many cells we can send.
///
/// For windows with authenticated SENDMEs, `T` is a tag type recorded
/// when a SENDME becomes expected, and checked when one arrives;
/// unauthenticated windows use `T = ()`.
#[derive(Clone, Debug)]
pub(crate) struct SendWindow<P, T>
where
    P: WindowParams,
    T: PartialEq + Eq + Clone,
{
    /// Current value for this window: how many cells we may still send.
    window: u16,
    /// Tags of the cells that SENDMEs are expected to acknowledge, in
    /// the order we expect them.
    tags: VecDeque<T>,
    /// Marker for the window parameters.
    _dummy: PhantomData<P>,
}

/// A circuit-level send window, with authenticated SENDME tags.
pub(crate) type CircSendWindow = SendWindow<CircParams, [u8; 20]>;
/// A stream-level send window.
pub(crate) type StreamSendWindow = SendWindow<StreamParams, ()>;

impl<P, T> SendWindow<P, T>
where
    P: WindowParams,
    T: PartialEq + Eq + Clone,
{
    /// Construct a new SendWindow starting at `window`.
    pub(crate) fn new(window: u16) -> Self {
        let n_tags = (window as usize) / (P::increment() as usize) + 1;
        SendWindow {
            window,
            tags: VecDeque::with_capacity(n_tags),
            _dummy: PhantomData,
        }
    }

    /// Return the current value of this window: the number of cells we
    /// may still send.
    pub(crate) fn window(&self) -> u16 {
        self.window
    }

    /// Return true if at least one cell may be sent.
    pub(crate) fn can_send(&self) -> bool {
        self.window > 0
    }

    /// Remove one cell from this window, recording `tag` if this is a
    /// position where a SENDME will be expected.
    ///
    /// The caller must check [`can_send`](Self::can_send) first; taking
    /// from an empty window is an internal error, since it would mean we
    /// violated flow control ourselves.
    pub(crate) fn take(&mut self, tag: &T) -> Result<u16> {
        let new_window = self
            .window
            .checked_sub(1)
            .ok_or_else(|| crate::internal!("Called take() on an empty send window"))?;
        self.window = new_window;
        if new_window % P::increment() == 0 {
            self.tags.push_back(tag.clone());
        }
        Ok(new_window)
    }

    /// Handle an incoming SENDME, incrementing the window.
    ///
    /// If `tag` is provided, it must match the tag we recorded for the
    /// cell being acknowledged.  A SENDME we weren't expecting, or one
    /// that would push the window over its maximum, is a protocol
    /// violation.
    pub(crate) fn put(&mut self, tag: Option<&T>) -> Result<u16> {
        let expected = self
            .tags
            .pop_front()
            .ok_or_else(|| Error::CircProto("Unexpected SENDME".into()))?;
        if let Some(tag) = tag {
            if *tag != expected {
                return Err(Error::CircProto("Wrong tag on SENDME".into()));
            }
        }
        let new_window = self
            .window
            .checked_add(P::increment())
            .filter(|w| *w <= MAX_WINDOW)
            .ok_or_else(|| Error::CircProto("Overflow on SENDME".into()))?;
        self.window = new_window;
        Ok(new_window)
    }
}

/// A window to track how many cells we are willing to receive.
#[derive(Clone, Debug)]
pub(crate) struct RecvWindow<P: WindowParams> {
    /// Current value for this window: how many cells we are willing to
    /// receive before the next SENDME from us.
    window: u16,
    /// Marker for the window parameters.
    _dummy: PhantomData<P>,
}

/// A circuit-level receive window.
pub(crate) type CircRecvWindow = RecvWindow<CircParams>;
/// A stream-level receive window.
pub(crate) type StreamRecvWindow = RecvWindow<StreamParams>;

impl<P: WindowParams> RecvWindow<P> {
    /// Construct a new RecvWindow starting at `window`.
    pub(crate) fn new(window: u16) -> Self {
        RecvWindow {
            window,
            _dummy: PhantomData,
        }
    }

    /// Construct a new RecvWindow at the starting value for its kind.
    pub(crate) fn new_at_start() -> Self {
        Self::new(P::start())
    }

    /// Count a received cell against this window.
    ///
    /// Return true if we should send a SENDME to replenish it; an
    /// underflow means the peer ignored our flow control, which is a
    /// protocol violation.
    pub(crate) fn take(&mut self) -> Result<bool> {
        let new_window = self.window.checked_sub(1).ok_or_else(|| {
            Error::CircProto("Received a data cell in violation of a window".into())
        })?;
        self.window = new_window;
        Ok(new_window % P::increment() == 0)
    }

    /// Count `n` received cells against this window, without triggering
    /// SENDMEs.  Used when adopting a stream whose cells were dropped.
    pub(crate) fn decrement_n(&mut self, n: u16) -> Result<()> {
        self.window = self.window.checked_sub(n).ok_or_else(|| {
            Error::CircProto("Received too many cells on a closed stream".into())
        })?;
        Ok(())
    }

    /// Note that we have sent a SENDME, replenishing the window.
    pub(crate) fn put(&mut self) {
        self.window = self.window.saturating_add(P::increment());
    }
}

/// Return true if this message type counts towards flow-control windows.
pub(crate) fn cmd_counts_towards_windows(cmd: RelayCmd) -> bool {
    cmd == RelayCmd::DATA
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn send_window_basics() {
        let mut w: StreamSendWindow = SendWindow::new(500);
        assert_eq!(w.window(), 500);
        assert!(w.can_send());
        for _ in 0..500 {
            w.take(&()).unwrap();
        }
        assert_eq!(w.window(), 0);
        assert!(!w.can_send());
        assert!(w.take(&()).is_err());

        // Ten sendmes were recorded on the way down (450, 400, ... 0).
        for i in 1..=10_u16 {
            assert_eq!(w.put(None).unwrap(), i * 50);
        }
        // An eleventh is unexpected.
        assert!(matches!(w.put(None), Err(Error::CircProto(_))));
    }

    #[test]
    fn send_window_tags() {
        let mut w: CircSendWindow = SendWindow::new(1000);
        let tag1 = [b'x'; 20];
        let tag2 = [b'y'; 20];
        for _ in 0..100 {
            w.take(&tag1).unwrap();
        }
        for _ in 0..100 {
            w.take(&tag2).unwrap();
        }
        // Acknowledge with the right tag, then with a wrong one.
        assert!(w.put(Some(&tag1)).is_ok());
        assert!(matches!(w.put(Some(&tag1)), Err(Error::CircProto(_))));
    }

    #[test]
    fn send_window_overflow() {
        // Only one SENDME became expected on the way from 450 down to
        // 399; a second one is a violation.
        let mut w: StreamSendWindow = SendWindow::new(450);
        for _ in 0..51 {
            w.take(&()).unwrap();
        }
        assert!(w.put(None).is_ok()); // 399 -> 449
        assert!(matches!(w.put(None), Err(Error::CircProto(_))));
    }

    #[test]
    fn recv_window_basics() {
        let mut w: StreamRecvWindow = RecvWindow::new_at_start();
        for i in 1..=49 {
            assert!(!w.take().unwrap(), "spurious sendme at {}", i);
        }
        assert!(w.take().unwrap()); // 450: time to acknowledge.
        w.put();
        assert_eq!(w.window, 500);
    }

    #[test]
    fn recv_window_underflow() {
        let mut w: StreamRecvWindow = RecvWindow::new(1);
        assert!(w.take().is_ok());
        assert!(w.take().is_err());
    }

    #[test]
    fn counts_towards_windows() {
        assert!(cmd_counts_towards_windows(RelayCmd::DATA));
        assert!(!cmd_counts_towards_windows(RelayCmd::SENDME));
        assert!(!cmd_counts_towards_windows(RelayCmd::END));
        assert!(!cmd_counts_towards_windows(RelayCmd::CONNECTED));
    }
}
