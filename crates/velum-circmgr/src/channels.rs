//! The circuit manager's view of the connection cache.
//!
//! Making and authenticating the TLS-like connections to relays is
//! somebody else's job; all we need is "give me a channel to this
//! relay", where the cache may hand back a connection it already has.

use crate::directory::Relay;
use crate::Result;

use async_trait::async_trait;
use velum_proto::channel::Channel;

/// A provider of channels to relays.
///
/// Implementations are expected to cache: asking for a channel to a
/// relay we already have a connection to should reuse it.  The returned
/// channel's reactor must already be running.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Return an open channel to `relay`, launching a connection if we
    /// don't already have one.
    async fn get_or_launch(&self, relay: &Relay) -> Result<Channel>;
}
