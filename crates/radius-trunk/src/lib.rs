//! Outbound RADIUS client transport
//!
//! A connection-pooled, retry-aware dispatcher that multiplexes
//! request/response exchanges over one or more connections to a single
//! remote RADIUS server.
//!
//! # Features
//!
//! - Per-connection liveness state machine (connecting → status-checking →
//!   active → zombie → revive)
//! - 8-bit RADIUS ID tracking with at-most-one in-flight request per ID
//! - Priority scheduling across a trunk of connections, with backlog and
//!   requeue-on-failure
//! - Timer-driven retransmission with MRC/MRD bounds and ±10% jitter
//! - Status-Server liveness probing with Protocol-Error negotiation
//! - Client, proxy (DUP-driven) and replicate operating modes
//!
//! Wire encoding and signing stay behind the [`PacketCodec`] trait, and
//! sockets behind [`LinkIo`]/[`LinkFactory`]; the embedding server provides
//! both.
//!
//! # Example
//!
//! ```rust,ignore
//! use radius_trunk::{ClientRequest, TrunkConfig, UdpLinkFactory, Worker};
//!
//! # async fn demo(codec: Box<dyn radius_trunk::PacketCodec>) {
//! let config = TrunkConfig::default();
//! config.validate().unwrap();
//!
//! let factory = UdpLinkFactory::new("192.0.2.1:1812".parse().unwrap());
//! let (worker, handle) = Worker::new(config, codec, Box::new(factory));
//! tokio::spawn(worker.run());
//!
//! let rcode = handle
//!     .submit(ClientRequest {
//!         code: 1, // Access-Request
//!         priority: 100,
//!         recv_time: std::time::Instant::now(),
//!         attributes: vec![],
//!         parent_code: None,
//!     })
//!     .await;
//! # let _ = rcode;
//! # }
//! ```

pub mod code;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod link;
pub mod request;
pub mod retry;
pub mod status;
pub mod track;
pub mod trunk;
pub mod wire;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use code::{Code, ResultCode, reply_to_result};
pub use codec::{DecodeFail, DecodedReply, EncodeError, PacketCodec};
pub use config::{
    ConfigError, Mode, RequireMessageAuthenticator, RetrySettings, RetryTables,
    StatusCheckSettings, Transport, TrunkConfig,
};
pub use connection::{ConnState, ConnStats};
pub use dispatch::{Dispatcher, Signal, Submission};
pub use link::{LinkFactory, LinkIo, UdpLink, UdpLinkFactory};
pub use request::{Attribute, ClientRequest};
pub use retry::{RetryConfig, RetryDecision, RetryState};
pub use track::{IdSlot, IdTracker};
pub use trunk::{EnqueueOutcome, EntryId, Trunk};
pub use worker::{Worker, WorkerHandle};
