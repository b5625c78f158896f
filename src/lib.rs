//! SOME/IP-SD (Service Discovery) protocol engine built on std::net.
//!
//! This crate implements the SOME/IP-SD state machines that drive dynamic
//! service discovery and event subscription in automotive networks: the
//! wire codec for SD entries/options, the per-service Offer/Find/Subscribe
//! state machines, the inbound dispatcher, the outbound packer, and the
//! [`SdEngine`](sd::SdEngine) that owns all of it for one participant.
//!
//! # Features
//!
//! - Byte-exact SD entry and option codec (service entries, eventgroup
//!   entries, IPv4/IPv6 endpoint options)
//! - Four-phase Offer/Find state machines with randomized initial delay and
//!   exponential-backoff repetition
//! - Fixed-capacity subscriber tables with reboot detection
//! - A pluggable socket adapter (`SoAd`) so the engine never touches a
//!   socket directly
//!
//! # Example
//!
//! ```no_run
//! use someip_sd::{SomeIpMessage, ServiceId, MethodId, ClientId, SessionId};
//!
//! // SdMessage wraps its payload in an ordinary SOME/IP message for
//! // transmission; the header fields below are shared by every message
//! // this crate sends or parses.
//! let request = SomeIpMessage::request(ServiceId(0x1234), MethodId(0x0001))
//!     .client_id(ClientId(0x0100))
//!     .payload(b"hello".as_slice())
//!     .build();
//!
//! assert_eq!(request.header.service_id, ServiceId(0x1234));
//! ```
//!
//! # Protocol Overview
//!
//! SOME/IP messages consist of a 16-byte header followed by an optional payload:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |    Service ID   |   Method ID     |  (4 bytes)
//! +--------+--------+--------+--------+
//! |           Length                  |  (4 bytes)
//! +--------+--------+--------+--------+
//! |    Client ID    |   Session ID    |  (4 bytes)
//! +--------+--------+--------+--------+
//! |Proto|Iface|MsgType|RetCode|        (4 bytes)
//! +--------+--------+--------+--------+
//! |           Payload ...             |  (variable)
//! +--------+--------+--------+--------+
//! ```
//!
//! SD itself rides inside this envelope as a Notification to Service ID
//! `0xFFFF`, Method ID `0x8100` — see [`sd`] for the payload layout.

pub mod error;
pub mod header;
pub mod message;
pub mod sd;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{Result, SomeIpError};
pub use header::{ClientId, MethodId, ServiceId, SessionId, SomeIpHeader, HEADER_SIZE};
pub use message::{MessageBuilder, SomeIpMessage};
pub use types::{MessageType, ReturnCode, PROTOCOL_VERSION};
