//! Trunk configuration
//!
//! Plain serde structures with per-field defaults and a `validate()` pass,
//! immutable once the trunk is built. All durations are integer
//! milliseconds in the serialized form and converted to [`Duration`] at the
//! point of use.

use crate::code::Code;
use crate::request::Attribute;
use crate::retry::RetryConfig;
use crate::wire;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transport operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// We originate packets and manage our own retransmissions
    Client,
    /// We forward packets on behalf of a downstream client; the downstream
    /// drives retransmission via DUP signals
    Proxy,
    /// Fire-and-forget duplication; the socket goes write-only and every
    /// accepted write completes immediately
    Replicate,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Proxy
    }
}

/// Underlying socket flavour, which selects the retry policy for
/// originated packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Datagram,
    Stream,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Datagram
    }
}

/// Message-Authenticator verification policy for replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequireMessageAuthenticator {
    Yes,
    No,
    /// Start permissive; upgrade to `Yes` for the lifetime of the trunk
    /// after the first reply proves the peer signs its packets
    Auto,
}

impl Default for RequireMessageAuthenticator {
    fn default() -> Self {
        RequireMessageAuthenticator::Auto
    }
}

/// One retransmission schedule: (initial_rt, max_rt, mrc, mrd)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Initial retransmit interval in milliseconds
    #[serde(default = "default_initial_rt_ms")]
    pub initial_rt_ms: u64,
    /// Cap on the doubled interval in milliseconds
    #[serde(default = "default_max_rt_ms")]
    pub max_rt_ms: u64,
    /// Maximum retransmit count (0 = unlimited)
    #[serde(default = "default_mrc")]
    pub mrc: u32,
    /// Maximum retransmit duration in milliseconds (0 = unlimited)
    #[serde(default = "default_mrd_ms")]
    pub mrd_ms: u64,
}

fn default_initial_rt_ms() -> u64 {
    2_000
}

fn default_max_rt_ms() -> u64 {
    16_000
}

fn default_mrc() -> u32 {
    5
}

fn default_mrd_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_rt_ms: default_initial_rt_ms(),
            max_rt_ms: default_max_rt_ms(),
            mrc: default_mrc(),
            mrd_ms: default_mrd_ms(),
        }
    }
}

impl RetrySettings {
    /// Single final timeout, no active retransmission. Used for proxied
    /// packets, stream transports and replication.
    pub fn single_timeout(timeout_ms: u64) -> Self {
        RetrySettings {
            initial_rt_ms: timeout_ms,
            max_rt_ms: timeout_ms,
            mrc: 1,
            mrd_ms: timeout_ms,
        }
    }

    pub fn to_retry_config(self) -> RetryConfig {
        RetryConfig {
            initial_rt: Duration::from_millis(self.initial_rt_ms),
            max_rt: Duration::from_millis(self.max_rt_ms),
            mrc: self.mrc,
            mrd: Duration::from_millis(self.mrd_ms),
        }
    }

    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        if self.initial_rt_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{what}: initial_rt_ms cannot be 0"
            )));
        }
        if self.max_rt_ms < self.initial_rt_ms {
            return Err(ConfigError::Invalid(format!(
                "{what}: max_rt_ms ({}) is below initial_rt_ms ({})",
                self.max_rt_ms, self.initial_rt_ms
            )));
        }
        if self.mrc == 0 && self.mrd_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{what}: mrc and mrd_ms cannot both be unlimited"
            )));
        }
        Ok(())
    }
}

/// Per-code retransmission schedules for originated datagram traffic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryTables {
    #[serde(default)]
    pub access_request: RetrySettings,
    #[serde(default)]
    pub accounting_request: RetrySettings,
    #[serde(default)]
    pub disconnect_request: RetrySettings,
    #[serde(default)]
    pub coa_request: RetrySettings,
}

impl RetryTables {
    /// Schedule for an outgoing packet code, if the code has its own table
    pub fn for_code(&self, code: u8) -> Option<&RetrySettings> {
        match Code::from_u8(code) {
            Some(Code::AccessRequest) => Some(&self.access_request),
            Some(Code::AccountingRequest) => Some(&self.accounting_request),
            Some(Code::DisconnectRequest) => Some(&self.disconnect_request),
            Some(Code::CoaRequest) => Some(&self.coa_request),
            _ => None,
        }
    }
}

/// Liveness probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheckSettings {
    /// Packet code used for probes
    #[serde(default = "default_status_code")]
    pub code: u8,

    /// Attribute template for the probe packet. Proxy-State,
    /// Message-Authenticator and (outside Access-Request probes)
    /// User-Password entries are ignored.
    #[serde(default)]
    pub attributes: Vec<Attribute>,

    /// Probe retransmission schedule, independent of user traffic
    #[serde(default = "default_status_retry")]
    pub retry: RetrySettings,
}

fn default_status_code() -> u8 {
    Code::StatusServer.as_u8()
}

fn default_status_retry() -> RetrySettings {
    RetrySettings {
        initial_rt_ms: 2_000,
        max_rt_ms: 8_000,
        mrc: 6,
        mrd_ms: 60_000,
    }
}

impl Default for StatusCheckSettings {
    fn default() -> Self {
        StatusCheckSettings {
            code: default_status_code(),
            attributes: Vec::new(),
            retry: default_status_retry(),
        }
    }
}

/// Trunk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkConfig {
    /// Operating mode
    #[serde(default)]
    pub mode: Mode,

    /// Socket flavour
    #[serde(default)]
    pub transport: Transport,

    /// Number of connections in the pool
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Maximum outstanding requests across the trunk
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,

    /// Initial receive buffer size per connection; Protocol-Error
    /// negotiation may grow it up to the protocol maximum
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// How long a sent packet may go unanswered before the connection is
    /// suspected dead
    #[serde(default = "default_response_window_ms")]
    pub response_window_ms: u64,

    /// How long a zombie connection keeps its requests before they are
    /// requeued and the connection is torn down
    #[serde(default = "default_zombie_period_ms")]
    pub zombie_period_ms: u64,

    /// Delay before reconnecting a dead connection when status checks are
    /// disabled
    #[serde(default = "default_revive_interval_ms")]
    pub revive_interval_ms: u64,

    /// Contiguous good probe replies required to bring a connection back
    /// after a trunk-level failure
    #[serde(default = "default_num_answers_to_alive")]
    pub num_answers_to_alive: u32,

    /// Reply verification policy
    #[serde(default)]
    pub require_message_authenticator: RequireMessageAuthenticator,

    /// Outgoing packet codes the embedder may submit
    #[serde(default = "default_allowed")]
    pub allowed: Vec<u8>,

    /// Per-code schedules for originated datagram traffic
    #[serde(default)]
    pub retry: RetryTables,

    /// Schedule for proxied packets, stream transports and replication:
    /// a single final timeout
    #[serde(default = "default_timeout_retry")]
    pub timeout_retry: RetrySettings,

    /// Liveness probing; `None` falls back to zombie/revive timers
    #[serde(default)]
    pub status_check: Option<StatusCheckSettings>,
}

fn default_connections() -> usize {
    2
}

fn default_max_outstanding() -> usize {
    1000
}

fn default_max_packet_size() -> usize {
    4096
}

fn default_response_window_ms() -> u64 {
    20_000
}

fn default_zombie_period_ms() -> u64 {
    40_000
}

fn default_revive_interval_ms() -> u64 {
    60_000
}

fn default_num_answers_to_alive() -> u32 {
    3
}

fn default_allowed() -> Vec<u8> {
    vec![
        Code::AccessRequest.as_u8(),
        Code::AccountingRequest.as_u8(),
        Code::DisconnectRequest.as_u8(),
        Code::CoaRequest.as_u8(),
    ]
}

fn default_timeout_retry() -> RetrySettings {
    RetrySettings::single_timeout(30_000)
}

impl Default for TrunkConfig {
    fn default() -> Self {
        TrunkConfig {
            mode: Mode::default(),
            transport: Transport::default(),
            connections: default_connections(),
            max_outstanding: default_max_outstanding(),
            max_packet_size: default_max_packet_size(),
            response_window_ms: default_response_window_ms(),
            zombie_period_ms: default_zombie_period_ms(),
            revive_interval_ms: default_revive_interval_ms(),
            num_answers_to_alive: default_num_answers_to_alive(),
            require_message_authenticator: RequireMessageAuthenticator::default(),
            allowed: default_allowed(),
            retry: RetryTables::default(),
            timeout_retry: default_timeout_retry(),
            status_check: None,
        }
    }
}

impl TrunkConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: TrunkConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::Invalid(
                "connections cannot be 0".to_string(),
            ));
        }

        if self.max_outstanding == 0 {
            return Err(ConfigError::Invalid(
                "max_outstanding cannot be 0".to_string(),
            ));
        }

        if self.max_packet_size < wire::HEADER_LENGTH
            || self.max_packet_size > wire::MAX_PACKET_SIZE
        {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size {} is outside [{}, {}]",
                self.max_packet_size,
                wire::HEADER_LENGTH,
                wire::MAX_PACKET_SIZE
            )));
        }

        if self.response_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "response_window_ms cannot be 0".to_string(),
            ));
        }

        if self.num_answers_to_alive == 0 {
            return Err(ConfigError::Invalid(
                "num_answers_to_alive cannot be 0".to_string(),
            ));
        }

        if self.allowed.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed cannot be empty".to_string(),
            ));
        }

        if self.allowed.contains(&Code::StatusServer.as_u8()) {
            return Err(ConfigError::Invalid(
                "Status-Server is reserved for status checks and cannot be allowed".to_string(),
            ));
        }

        self.retry.access_request.validate("retry.access_request")?;
        self.retry
            .accounting_request
            .validate("retry.accounting_request")?;
        self.retry
            .disconnect_request
            .validate("retry.disconnect_request")?;
        self.retry.coa_request.validate("retry.coa_request")?;
        self.timeout_retry.validate("timeout_retry")?;

        if let Some(status) = &self.status_check {
            if status.code == 0 {
                return Err(ConfigError::Invalid(
                    "status_check.code cannot be 0".to_string(),
                ));
            }
            status.retry.validate("status_check.retry")?;
        }

        Ok(())
    }

    /// Whether `code` is permitted as a user-submitted packet
    pub fn allows(&self, code: u8) -> bool {
        self.allowed.contains(&code)
    }

    /// Retransmission schedule for an originated packet of `code`, falling
    /// back to the single-timeout schedule for codes without a table
    pub fn retry_for(&self, code: u8) -> RetrySettings {
        self.retry
            .for_code(code)
            .copied()
            .unwrap_or(self.timeout_retry)
    }

    pub fn response_window(&self) -> Duration {
        Duration::from_millis(self.response_window_ms)
    }

    pub fn zombie_period(&self) -> Duration {
        Duration::from_millis(self.zombie_period_ms)
    }

    pub fn revive_interval(&self) -> Duration {
        Duration::from_millis(self.revive_interval_ms)
    }
}
