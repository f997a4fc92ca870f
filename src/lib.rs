#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod chain;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod heap;
pub(crate) mod incoming;
pub mod io;
pub(crate) mod keep_alive;
pub mod layer;
pub mod legacy;
pub mod logic;
pub mod mqtt;
pub mod packet;
pub(crate) mod packet_id_pool;
pub mod parser;
pub mod protocol;
pub mod time;
pub mod topic;
pub mod transport;

pub use chain::{Chain, LayerKind, LEGACY_SCHEME, MQTT_SCHEME};
pub use config::{Config, Endpoint};
pub use context::{Context, Protocol};
pub use dispatcher::{Dispatcher, Scheduler};
pub use heap::{Handle, Heap};
pub use layer::{Data, Event, Layer, LayerResult, LayerState};
pub use legacy::{Datapoint, Datastream, Query, Response, Value};
pub use logic::{Handler, SessionState, Task};
pub use packet::{Message, PacketId, QoS};
pub use transport::Channel;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    InvalidFlags,
    MalformedRemainingLength,
    InvalidPacketType,
    MalformedPacket,
    InvalidConnectReturnCode,
    InvalidQoS,
    InvalidUtf8,
    UnexpectedEof,
    TransportError,
    RemoteClosed,
    UnsupportedIncomingPacket,
    BufferTooSmall,
    TimeError,
    TimedOut,
    ProtocolViolation,
    ConnectionRefused(packet::connect::ConnectReturnCode),
    NoPacketIdAvailable,
    CapacityExceeded,
    QueueFull,
    SubscriptionTableFull,
    InvalidHandle,
    InvalidTopic,
    NoSuchLayer,
    UnexpectedData,
    ChainClosed,
    NotConnected,
    MalformedResponse,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidFlags => write!(f, "invalid fixed header flags"),
            Self::MalformedRemainingLength => write!(f, "malformed remaining length"),
            Self::InvalidPacketType => write!(f, "invalid packet type"),
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::InvalidConnectReturnCode => write!(f, "invalid connect return code"),
            Self::InvalidQoS => write!(f, "invalid QoS level"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::TransportError => write!(f, "transport error"),
            Self::RemoteClosed => write!(f, "connection closed by remote"),
            Self::UnsupportedIncomingPacket => write!(f, "unsupported incoming packet"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::TimeError => write!(f, "clock error"),
            Self::TimedOut => write!(f, "timed out"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::ConnectionRefused(code) => write!(f, "connection refused: {:?}", code),
            Self::NoPacketIdAvailable => write!(f, "no packet identifier available"),
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::QueueFull => write!(f, "queue full"),
            Self::SubscriptionTableFull => write!(f, "subscription table full"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::InvalidTopic => write!(f, "invalid topic"),
            Self::NoSuchLayer => write!(f, "no such layer"),
            Self::UnexpectedData => write!(f, "unexpected data for layer"),
            Self::ChainClosed => write!(f, "chain closed"),
            Self::NotConnected => write!(f, "not connected"),
            Self::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

impl core::error::Error for Error {}
