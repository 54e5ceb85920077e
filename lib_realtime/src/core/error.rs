use thiserror::Error;

use crate::core::channel::ChannelName;

/// Errors reported by a realtime transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("failed to connect to the realtime endpoint: {0}")]
    Connect(String),

    #[error("transport rejected the channel: {0}")]
    Rejected(String),

    #[error("transport has been closed")]
    Closed,
}

/// Errors observable by callers of the realtime layer.
///
/// Transport failures on an established channel never surface here; they are
/// retried in the background and only show up as the `Failed` phase once the
/// retry budget is spent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("connection pool exhausted ({max} connections in use), cannot open channel {channel}")]
    PoolExhausted { channel: ChannelName, max: usize },

    #[error("channel {0} failed and gave up reconnecting")]
    ChannelFailed(ChannelName),

    #[error("no subscription exists for channel {0}")]
    UnknownChannel(ChannelName),

    #[error("realtime service failed to initialize: {0}")]
    InitializationFailure(String),

    #[error("realtime service has been shut down")]
    ShutDown,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
