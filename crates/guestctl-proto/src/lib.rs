//! Host channel protocol for the guest control agent.
//!
//! The host is reached through a [`HostChannel`]. The core never sees the
//! wire encoding; the binary uses [`StreamChannel`] (JSON lines over vsock,
//! a unix socket or TCP) and tests use [`LoopbackHost`].

mod channel;
pub mod context;
mod error;
pub mod loopback;
pub mod msg;
mod params;
mod stream;
pub mod wire;

pub use channel::{Connector, Fetched, HostChannel, HostCtx, Peeked};
pub use error::{rc_of, ErrorCode, Result};
pub use loopback::{HostEvent, LoopbackChannel, LoopbackHost};
pub use msg::{HostMsgKind, InputStatus, ProcStatus, SessionNotifyType};
pub use params::{
    base64_bytes, FileOpenParams, FileReply, GuestReply, HostMessage, ProcStartupInfo,
    SessionStartupInfo,
};
pub use stream::{ChannelAddress, StreamChannel, StreamConnector};

/// Protocol version spoken by this guest.
pub const PROTOCOL_VERSION: u32 = 2;

/// Environment variable passing the channel address to spawned sessions.
pub const CHANNEL_ENV: &str = "GUESTCTL_CHANNEL";
