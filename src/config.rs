use heapless::{String, Vec};

use crate::packet::{
    QoS,
    connect::{ProtocolVersion, Will},
};

pub const MAX_TOPIC_LEN: usize = 128;
pub const MAX_PAYLOAD_LEN: usize = 512;
pub const MAX_CLIENT_ID_LEN: usize = 64;
pub const MAX_CREDENTIAL_LEN: usize = 64;
pub const MAX_WILL_PAYLOAD_LEN: usize = 128;
pub const MAX_FILTERS: usize = 4;
/// Largest serialized packet or transport chunk passed between stages.
pub const MAX_FRAME_LEN: usize = 1024;

pub const MAX_LAYERS: usize = 4;
pub const QUEUE_DEPTH: usize = 8;
pub const EVENT_DEPTH: usize = 8;
pub const TASK_DEPTH: usize = 4;
pub const INBOX_DEPTH: usize = 4;
pub const MAX_SUBSCRIPTIONS: usize = 8;
pub const INCOMING_QOS2: usize = 4;
pub const DEFAULT_TIMERS: usize = 16;

pub const MAX_HOST_LEN: usize = 64;
pub const MAX_API_KEY_LEN: usize = 64;
pub const MAX_FIELD_LEN: usize = 32;
pub const MAX_DATASTREAMS: usize = 4;

#[derive(Clone, Debug)]
pub struct Config {
    pub client_id: String<MAX_CLIENT_ID_LEN>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    /// Seconds, `0` disables keep-alive.
    pub keep_alive: u16,
    pub username: Option<String<MAX_CREDENTIAL_LEN>>,
    pub password: Option<Vec<u8, MAX_CREDENTIAL_LEN>>,
    pub will: Option<Will>,
    pub connack_timeout_ms: u32,
    pub ack_timeout_ms: u32,
    pub max_retries: u8,
    pub api_key: String<MAX_API_KEY_LEN>,
    pub network_timeout_ms: u32,
}

impl Config {
    pub fn new(client_id: &str) -> Result<Self, crate::Error> {
        Ok(Self {
            client_id: String::try_from(client_id).map_err(|_| crate::Error::BufferTooSmall)?,
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            connack_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            max_retries: 3,
            api_key: String::new(),
            network_timeout_ms: 30_000,
        })
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &[u8]) -> Result<Self, crate::Error> {
        self.username = Some(String::try_from(username).map_err(|_| crate::Error::BufferTooSmall)?);
        self.password = Some(Vec::from_slice(password).map_err(|_| crate::Error::BufferTooSmall)?);
        Ok(self)
    }

    pub fn with_will(
        mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Self, crate::Error> {
        self.will = Some(Will {
            qos,
            retain,
            topic: String::try_from(topic).map_err(|_| crate::Error::BufferTooSmall)?,
            payload: Vec::from_slice(payload).map_err(|_| crate::Error::BufferTooSmall)?,
        });
        Ok(self)
    }

    pub fn with_timeouts(mut self, connack_ms: u32, ack_ms: u32, max_retries: u8) -> Self {
        self.connack_timeout_ms = connack_ms;
        self.ack_timeout_ms = ack_ms;
        self.max_retries = max_retries;
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Result<Self, crate::Error> {
        self.api_key = String::try_from(api_key).map_err(|_| crate::Error::BufferTooSmall)?;
        Ok(self)
    }

    pub fn with_network_timeout(mut self, ms: u32) -> Self {
        self.network_timeout_ms = ms;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub host: String<MAX_HOST_LEN>,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Result<Self, crate::Error> {
        Ok(Self {
            host: String::try_from(host).map_err(|_| crate::Error::BufferTooSmall)?,
            port,
        })
    }
}
