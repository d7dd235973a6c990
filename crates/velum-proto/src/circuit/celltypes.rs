//! Wrapper types for subsets of ChanMsg types.
//!
//! These wrappers define types that are valid in response to particular
//! requests, or when received in particular circumstances.  They're used
//! so that Rust's typesafety can help enforce protocol properties.

use crate::{Error, Result};
use std::fmt::{self, Display};
use velum_cell::chancell::msg::{self as chanmsg, AnyChanMsg};
use velum_cell::chancell::ChanMsg;

/// A subset of ChanMsg that can arrive in response to a CREATE* cell
/// that we send.
#[derive(Debug)]
#[allow(clippy::exhaustive_enums)]
pub(crate) enum CreateResponse {
    /// Destroy cell: the CREATE failed.
    Destroy(chanmsg::Destroy),
    /// CreatedFast: good response to a CREATE_FAST cell.
    CreatedFast(chanmsg::CreatedFast),
    /// Created2: good response to a CREATE2 cell.
    Created2(chanmsg::Created2),
}

impl TryFrom<AnyChanMsg> for CreateResponse {
    type Error = Error;

    fn try_from(m: AnyChanMsg) -> Result<CreateResponse> {
        match m {
            AnyChanMsg::Destroy(m) => Ok(CreateResponse::Destroy(m)),
            AnyChanMsg::CreatedFast(m) => Ok(CreateResponse::CreatedFast(m)),
            AnyChanMsg::Created2(m) => Ok(CreateResponse::Created2(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} in response to circuit creation",
                m.cmd()
            ))),
        }
    }
}

impl Display for CreateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CreateResponse as CR;
        match self {
            CR::Destroy(destroy) => write!(f, "DESTROY({})", destroy.reason()),
            CR::CreatedFast(_) => Display::fmt("CREATED_FAST", f),
            CR::Created2(_) => Display::fmt("CREATED2", f),
        }
    }
}

/// A subset of ChanMsg that can correctly arrive on a live client
/// circuit (one where a CREATED* has been received).
#[derive(Debug)]
#[allow(clippy::exhaustive_enums)]
pub(crate) enum ClientCircChanMsg {
    /// A relay cell telling us some kind of remote command from some
    /// party on the circuit.
    Relay(chanmsg::Relay),
    /// A cell telling us to destroy the circuit.
    Destroy(chanmsg::Destroy),
}

impl TryFrom<AnyChanMsg> for ClientCircChanMsg {
    type Error = Error;

    fn try_from(m: AnyChanMsg) -> Result<ClientCircChanMsg> {
        match m {
            AnyChanMsg::Relay(m) => Ok(ClientCircChanMsg::Relay(m)),
            AnyChanMsg::Destroy(m) => Ok(ClientCircChanMsg::Destroy(m)),
            _ => Err(Error::ChanProto(format!(
                "Got a {} on an open client circuit",
                m.cmd()
            ))),
        }
    }
}
