//! SOME/IP Service Discovery (SD).
//!
//! SOME/IP-SD uses special SOME/IP messages (Service ID 0xFFFF, Method ID
//! 0x8100) to discover services and manage event subscriptions, typically
//! over UDP multicast (224.224.224.245:30490). This module implements the
//! wire codec, the per-service Offer/Find/Subscribe state machines, and the
//! [`SdEngine`] that ties them together behind three entry points: `init`
//! (via [`SdEngine::new`] plus [`SdEngine::set_link_up`]),
//! [`SdEngine::rx_indication`], and [`SdEngine::main_function`].
//!
//! # Example
//!
//! ```no_run
//! use someip_sd::sd::{EngineConfig, SdEngine};
//! use someip_sd::sd::config::{ServerServiceConfig, ServerTimerConfig};
//! use someip_sd::sd::socket::UdpSoAd;
//! use someip_sd::sd::option::Endpoint;
//! use someip_sd::sd::types::InstanceId;
//! use someip_sd::ServiceId;
//!
//! let soad = UdpSoAd::bind(
//!     "0.0.0.0:30490".parse().unwrap(),
//!     "224.224.224.245:30490".parse().unwrap(),
//!     "127.0.0.1".parse().unwrap(),
//! ).unwrap();
//!
//! let config = EngineConfig {
//!     servers: vec![ServerServiceConfig {
//!         service_id: ServiceId(0x1234),
//!         instance_id: InstanceId(0x0001),
//!         major_version: 1,
//!         minor_version: 0,
//!         protocol: someip_sd::sd::types::TransportProtocol::Udp,
//!         timers: ServerTimerConfig::default(),
//!         event_handlers: Vec::new(),
//!         auto_available: false,
//!     }],
//!     clients: Vec::new(),
//!     tick_ms: 10,
//!     max_payload: 1400,
//!     local_endpoint: Endpoint::udp("127.0.0.1:30501".parse().unwrap()),
//! };
//!
//! let mut engine = SdEngine::new(config, Box::new(soad));
//! engine.set_link_up(true);
//! engine.server_service_request_offer(0);
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod entry;
pub mod flags;
pub mod message;
pub mod option;
pub mod packer;
pub mod server;
pub mod socket;
pub mod subscription;
pub mod types;

pub use client::{ClientService, ConsumedEventGroup};
pub use config::{
    ClientServiceConfig, ClientTimerConfig, ConsumedEventGroupConfig, EventHandlerConfig,
    ServerServiceConfig, ServerTimerConfig,
};
pub use dispatcher::{Dispatcher, ImmediateReply, RebootTracker};
pub use engine::{EngineConfig, SdEngine};
pub use entry::{EventgroupEntry, SdEntry, ServiceEntry};
pub use flags::{FlagLock, Flags, NoopLock};
pub use message::{SdFlags, SdMessage};
pub use option::{ConfigurationOption, Endpoint, IPv4EndpointOption, IPv6EndpointOption, SdOption};
pub use packer::{OutboundDatagram, Packer, SessionContext};
pub use server::{Phase, ServerService};
pub use socket::{SoAd, SoConId, UdpSoAd};
pub use subscription::{SubscriberSlot, SubscriptionTable};
pub use types::{
    EntryType, EventgroupId, InstanceId, OptionType, TransportProtocol, ANY_MAJOR_VERSION,
    ANY_MINOR_VERSION, SD_DEFAULT_PORT, SD_DEFAULT_TTL, SD_ENTRY_SIZE, SD_METHOD_ID,
    SD_MULTICAST_ADDR, SD_SERVICE_ID,
};
