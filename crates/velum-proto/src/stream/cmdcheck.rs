//! Checking whether a given relay message is acceptable on a given
//! stream, at a given point in the stream's lifetime.

use crate::{Error, Result};
use velum_cell::relaycell::RelayCmd;

/// The status of a stream, as determined by the messages seen on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StreamStatus {
    /// The stream is open and usable.
    Open,
    /// The stream has been closed by the remote side.
    Closed,
}

/// A checker for the messages that may arrive on a data stream.
///
/// SENDME messages are handled by the flow-control machinery before the
/// checker sees them; everything else on a data stream must be a single
/// CONNECTED (if we were waiting for one), DATA, or END.
#[derive(Debug)]
pub(crate) struct DataCmdChecker {
    /// True if we are expecting a CONNECTED message on this stream.
    expecting_connected: bool,
}

impl Default for DataCmdChecker {
    fn default() -> Self {
        DataCmdChecker {
            expecting_connected: true,
        }
    }
}

impl DataCmdChecker {
    /// Return a new boxed DataCmdChecker in a state suitable for a newly
    /// constructed connection.
    pub(crate) fn new_any() -> Self {
        Self::default()
    }

    /// Check whether `cmd` is an acceptable next message on this stream,
    /// and advance the stream's state accordingly.
    pub(crate) fn check_msg(&mut self, cmd: RelayCmd) -> Result<StreamStatus> {
        use StreamStatus::*;
        match cmd {
            RelayCmd::CONNECTED => {
                if !self.expecting_connected {
                    Err(Error::StreamProto(
                        "Received CONNECTED twice on a stream.".into(),
                    ))
                } else {
                    self.expecting_connected = false;
                    Ok(Open)
                }
            }
            RelayCmd::DATA => {
                if !self.expecting_connected {
                    Ok(Open)
                } else {
                    Err(Error::StreamProto(
                        "Received DATA before CONNECTED on a stream".into(),
                    ))
                }
            }
            RelayCmd::END => Ok(Closed),
            _ => Err(Error::StreamProto(format!(
                "Unexpected {} on a data stream!",
                cmd
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn data_stream_lifetime() {
        let mut c = DataCmdChecker::new_any();
        assert!(c.check_msg(RelayCmd::DATA).is_err());
        assert_eq!(c.check_msg(RelayCmd::CONNECTED).unwrap(), StreamStatus::Open);
        assert_eq!(c.check_msg(RelayCmd::DATA).unwrap(), StreamStatus::Open);
        assert!(c.check_msg(RelayCmd::CONNECTED).is_err());
        assert_eq!(c.check_msg(RelayCmd::END).unwrap(), StreamStatus::Closed);
        assert!(c.check_msg(RelayCmd::EXTENDED2).is_err());
    }
}
