//! Type and code for handling a "half-closed" stream.
//!
//! A half-closed stream is one that we've sent an END on, but where we
//! might still receive some cells.

use crate::circuit::sendme::{cmd_counts_towards_windows, StreamRecvWindow, StreamSendWindow};
use crate::stream::cmdcheck::{DataCmdChecker, StreamStatus};
use crate::{Error, Result};
use velum_cell::relaycell::RelayCmd;

/// Type to track state of half-closed streams.
///
/// We need to track these streams instead of forgetting about them
/// entirely, since otherwise a hostile exit could mark a dropped stream
/// with traffic patterns of its choosing.
#[derive(Debug)]
pub(crate) struct HalfStream {
    /// Send window for this stream.  Used to detect whether we get too
    /// many SENDME cells.
    sendw: StreamSendWindow,
    /// Receive window for this stream.  Used to detect whether we get
    /// too many data cells.
    recvw: StreamRecvWindow,
    /// Object to tell us which messages to accept on this stream.
    cmd_checker: DataCmdChecker,
}

impl HalfStream {
    /// Create a new half-closed stream.
    pub(crate) fn new(
        sendw: StreamSendWindow,
        recvw: StreamRecvWindow,
        cmd_checker: DataCmdChecker,
    ) -> Self {
        HalfStream {
            sendw,
            recvw,
            cmd_checker,
        }
    }

    /// Process an incoming message and adjust this HalfStream
    /// accordingly.  Give an error if the protocol has been violated.
    pub(crate) fn handle_msg(&mut self, cmd: RelayCmd) -> Result<StreamStatus> {
        // We handle SENDME separately, and don't give it to the checker.
        if cmd == RelayCmd::SENDME {
            self.sendw.put(None)?;
            return Ok(StreamStatus::Open);
        }
        if cmd_counts_towards_windows(cmd) {
            self.recvw.take().map_err(|_| {
                Error::CircProto("Received a data cell in violation of a window".into())
            })?;
        }
        self.cmd_checker.check_msg(cmd)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::circuit::sendme::{RecvWindow, SendWindow};

    fn hs_new() -> HalfStream {
        HalfStream::new(
            SendWindow::new(20),
            RecvWindow::new(20),
            DataCmdChecker::new_any(),
        )
    }

    #[test]
    fn halfstream_sendme() {
        // Stream-level SENDMEs are not authenticated, so the only way to
        // notice an unexpected one is when it overruns the window.
        let mut sendw: StreamSendWindow = SendWindow::new(450);
        for _ in 0..51 {
            sendw.take(&()).unwrap();
        }
        let mut hs = HalfStream::new(
            sendw,
            RecvWindow::new(20),
            DataCmdChecker::new_any(),
        );
        assert!(hs.handle_msg(RelayCmd::SENDME).is_ok());
        let e = hs.handle_msg(RelayCmd::SENDME).unwrap_err();
        assert_eq!(
            format!("{}", e),
            "Circuit protocol violation: Unexpected SENDME"
        );
    }

    #[test]
    fn halfstream_data() {
        let mut hs = hs_new();
        // We didn't get a CONNECTED before closing, so accept one now.
        hs.handle_msg(RelayCmd::CONNECTED).unwrap();

        // 20 data cells are okay.
        for _ in 0_u8..20 {
            assert!(hs.handle_msg(RelayCmd::DATA).is_ok());
        }
        // But one more is a protocol violation.
        let e = hs.handle_msg(RelayCmd::DATA).unwrap_err();
        assert_eq!(
            format!("{}", e),
            "Circuit protocol violation: Received a data cell in violation of a window"
        );
    }

    #[test]
    fn halfstream_connected() {
        let mut hs = hs_new();
        // We were expecting a CONNECTED, so we'll accept one and no more.
        assert!(hs.handle_msg(RelayCmd::CONNECTED).is_ok());
        assert!(hs.handle_msg(RelayCmd::CONNECTED).is_err());
    }

    #[test]
    fn halfstream_other() {
        let mut hs = hs_new();
        let e = hs.handle_msg(RelayCmd::EXTENDED2).unwrap_err();
        assert_eq!(
            format!("{}", e),
            "Stream protocol violation: Unexpected EXTENDED2 on a data stream!"
        );
    }
}
