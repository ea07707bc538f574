//! Channel bridge
//!
//! Serves broker topics to browsers over the Action Cable protocol on a
//! websocket. Each websocket is a [`CableConnection`]; each subscribe
//! command creates a [`Channel`] through the [`ChannelRegistry`].

pub mod channel;
pub mod connection;
pub mod protocol;

pub use channel::{
    csrf_checker, video_stream_channel_factory, CableSubscription, Channel, ChannelFactory,
    ChannelRegistry, IdentifierChecker, StreamTask, TokenChecker, VideoStreamChannel,
    VIDEO_STREAMS_CHANNEL,
};
pub use connection::CableConnection;
pub use protocol::{Command, CommandKind, Identifier, MessageType, ServerMessage};
