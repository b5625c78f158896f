//! Client-side (service lookup and event subscription) state machine.
//!
//! [`ClientService`] mirrors [`super::server::ServerService`]'s four phases
//! but on the Find side: it emits FindService entries during `InitialWait`/
//! `Repetition`, then sits in `Main` once the service has been located
//! (discovery continues in the background via TTL countdown in case the
//! provider disappears). Each [`ConsumedEventGroup`] tracks one eventgroup
//! subscription independently once the parent service is found.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, trace};

use crate::header::ServiceId;

use super::config::{ClientServiceConfig, ClientTimerConfig, ConsumedEventGroupConfig};
use super::flags::{self, Flags};
use super::server::Phase;
use super::types::{EventgroupId, InstanceId, SD_DEFAULT_TTL};

/// One eventgroup this client wants to consume, once its parent service is
/// found.
#[derive(Debug)]
pub struct ConsumedEventGroup {
    /// Static configuration.
    pub config: ConsumedEventGroupConfig,
    /// Pending-transition flags (`PENDING_SUBSCRIBE`/`PENDING_STOP_SUBSCRIBE`).
    pub flags: Flags,
    /// True once a SubscribeAck has been received for this eventgroup.
    pub subscribed: bool,
    /// Remaining TTL in ticks on the current subscription. Ignored while
    /// `subscribed` is false.
    pub ttl_ticks: u32,
}

impl ConsumedEventGroup {
    /// Build a new, unsubscribed consumed event group.
    pub fn new(config: ConsumedEventGroupConfig) -> Self {
        Self {
            config,
            flags: Flags::new(),
            subscribed: false,
            ttl_ticks: 0,
        }
    }

    /// Eventgroup id this tracks.
    pub fn eventgroup_id(&self) -> EventgroupId {
        self.config.eventgroup_id
    }

    /// Request a subscribe once the parent service is found.
    pub fn request_subscribe(&mut self) {
        self.flags
            .set_clear(flags::eventgroup::PENDING_SUBSCRIBE, flags::eventgroup::PENDING_STOP_SUBSCRIBE);
    }

    /// Request an unsubscribe.
    pub fn request_stop_subscribe(&mut self) {
        if self.subscribed || self.flags.contains(flags::eventgroup::PENDING_SUBSCRIBE) {
            self.flags
                .set_clear(flags::eventgroup::PENDING_STOP_SUBSCRIBE, flags::eventgroup::PENDING_SUBSCRIBE);
        }
    }

    /// Record a SubscribeAck.
    pub fn on_ack(&mut self, ttl_ticks: u32) {
        self.subscribed = true;
        self.ttl_ticks = ttl_ticks;
        self.flags.clear(flags::eventgroup::PENDING_SUBSCRIBE);
    }

    /// Record a SubscribeNack, or the parent service disappearing.
    pub fn on_nack_or_lost(&mut self) {
        self.subscribed = false;
        self.ttl_ticks = 0;
        self.flags.clear_request();
    }

    /// Advance the subscription TTL by one tick, dropping it on expiry.
    pub fn tick(&mut self) {
        if !self.subscribed || self.ttl_ticks == u32::MAX {
            return;
        }
        self.ttl_ticks -= 1;
        if self.ttl_ticks == 0 {
            self.subscribed = false;
        }
    }
}

/// One service instance this client is looking for.
#[derive(Debug)]
pub struct ClientService {
    /// Static configuration (ids, versions, timers, consumed event groups).
    pub config: ClientServiceConfig,
    /// Current phase.
    pub phase: Phase,
    /// Pending-transition and link flags.
    pub flags: Flags,
    /// Ticks remaining before the next phase transition or retransmission.
    pub delay_ticks: u32,
    /// Number of repeated finds already sent in the `Repetition` phase.
    pub repetition_count: u32,
    /// `Some` once a provider has been found, holding the remaining TTL in
    /// ticks (never decremented if the offer's TTL was the "forever" sentinel).
    pub provider_ttl_ticks: Option<u32>,
    /// The provider's unicast endpoint, learned from the Offer's IPv4/IPv6
    /// endpoint option. Used as the Subscribe destination.
    pub provider_addr: Option<SocketAddr>,
    /// Eventgroups this service's subscriptions are tracked through.
    pub event_groups: Vec<ConsumedEventGroup>,
}

impl ClientService {
    /// Build a new, initially-down client service context from its config.
    /// If `config.auto_require` is set, a request to find is raised
    /// immediately, mirroring [`super::server::ServerService::new`]'s
    /// `auto_available` handling.
    pub fn new(config: ClientServiceConfig) -> Self {
        let event_groups = config
            .consumed_event_groups
            .iter()
            .map(|eg| ConsumedEventGroup::new(*eg))
            .collect();
        let auto_require = config.auto_require;

        let mut cl = Self {
            config,
            phase: Phase::Down,
            flags: Flags::new(),
            delay_ticks: 0,
            repetition_count: 0,
            provider_ttl_ticks: None,
            provider_addr: None,
            event_groups,
        };
        if auto_require {
            cl.request_find();
        }
        cl
    }

    /// Service id being searched for.
    pub fn service_id(&self) -> ServiceId {
        self.config.service_id
    }

    /// Instance id being searched for (may be the wildcard).
    pub fn instance_id(&self) -> InstanceId {
        self.config.instance_id
    }

    fn timers(&self) -> &ClientTimerConfig {
        &self.config.timers
    }

    /// Request the client start looking for the service.
    pub fn request_find(&mut self) {
        if matches!(self.phase, Phase::Down) {
            self.flags
                .set_clear(flags::client::PENDING_FIND, flags::client::PENDING_STOP_FIND);
        }
    }

    /// Request the client stop looking (and drop any subscriptions).
    pub fn request_stop_find(&mut self) {
        if !matches!(self.phase, Phase::Down) {
            self.flags
                .set_clear(flags::client::PENDING_STOP_FIND, flags::client::PENDING_FIND);
        }
    }

    /// Mark the link this client runs on as up or down.
    pub fn set_link_up(&mut self, up: bool) {
        if up {
            self.flags.set(flags::LINK_UP);
        } else {
            self.flags.clear(flags::LINK_UP);
            self.phase = Phase::Down;
            self.flags.set(flags::client::PENDING_STOP_FIND);
            self.on_service_lost();
        }
    }

    /// Record that an Offer matching this service arrived, short-circuiting
    /// discovery straight to `Main` and requesting subscribes for every
    /// eventgroup configured with `auto_require` — the rest wait for an
    /// explicit `ConsumedEventGroupSetState(REQUESTED)` call.
    pub fn on_offer_received(&mut self, ttl_seconds: u32, tick_ms: u32, provider_addr: SocketAddr) {
        self.phase = Phase::Main;
        self.flags.clear(flags::client::PENDING_FIND);
        self.provider_ttl_ticks = Some(ttl_to_ticks(ttl_seconds, tick_ms));
        self.provider_addr = Some(provider_addr);
        for eg in &mut self.event_groups {
            if eg.config.auto_require {
                eg.request_subscribe();
            }
        }
    }

    /// Record that the provider has stopped offering, gone silent past its
    /// TTL, or been invalidated by a reboot. Drops every subscription.
    pub fn on_service_lost(&mut self) {
        self.provider_ttl_ticks = None;
        self.provider_addr = None;
        for eg in &mut self.event_groups {
            eg.on_nack_or_lost();
        }
        if self.flags.contains(flags::client::PENDING_STOP_FIND) {
            return;
        }
        if !matches!(self.phase, Phase::Down) {
            self.phase = Phase::Down;
            self.flags.set(flags::client::PENDING_FIND);
        }
    }

    /// Advance the state machine by one tick. Returns `true` if a Find or
    /// StopFind entry should be emitted by the packer this tick.
    pub fn tick<R: Rng>(&mut self, rng: &mut R) -> bool {
        let link_up = self.flags.contains(flags::LINK_UP);

        if let Some(ttl) = self.provider_ttl_ticks.as_mut() {
            if *ttl != u32::MAX {
                *ttl -= 1;
                if *ttl == 0 {
                    self.on_service_lost();
                }
            }
        }
        for eg in &mut self.event_groups {
            eg.tick();
        }

        if self.flags.contains(flags::client::PENDING_STOP_FIND) {
            self.flags.clear_request();
            self.flags.clear(flags::client::PENDING_STOP_FIND);
            let was_up = !matches!(self.phase, Phase::Down);
            self.phase = Phase::Down;
            self.on_service_lost();
            return was_up;
        }

        match self.phase {
            Phase::Down => {
                if link_up && self.flags.contains(flags::client::PENDING_FIND) {
                    self.flags.clear(flags::client::PENDING_FIND);
                    let timers = self.timers();
                    self.delay_ticks = rng
                        .gen_range(timers.initial_delay_min_ticks..=timers.initial_delay_max_ticks);
                    self.repetition_count = 0;
                    self.phase = Phase::InitialWait;
                    trace!(service = %self.service_id(), delay = self.delay_ticks, "client entering InitialWait");
                }
                false
            }
            Phase::InitialWait => {
                if self.delay_ticks > 0 {
                    self.delay_ticks -= 1;
                    return false;
                }
                self.phase = Phase::Repetition;
                self.delay_ticks = self.timers().repetition_base_delay_ticks;
                debug!(service = %self.service_id(), "client sending initial find");
                true
            }
            Phase::Repetition => {
                if self.delay_ticks > 0 {
                    self.delay_ticks -= 1;
                    return false;
                }
                self.repetition_count += 1;
                if self.repetition_count >= self.timers().repetition_max {
                    self.phase = Phase::Main;
                    false
                } else {
                    self.delay_ticks =
                        self.timers().repetition_base_delay_ticks * (1 << self.repetition_count);
                    true
                }
            }
            Phase::Main => false,
        }
    }
}

/// Convert a TTL in seconds (as carried on the wire) to ticks of
/// `tick_ms`-length `MainFunction` calls. [`SD_DEFAULT_TTL`] maps to
/// `u32::MAX`, the "never expires" sentinel used throughout the engine.
pub fn ttl_to_ticks(ttl_seconds: u32, tick_ms: u32) -> u32 {
    if ttl_seconds == SD_DEFAULT_TTL {
        u32::MAX
    } else {
        (ttl_seconds as u64 * 1000 / tick_ms as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::types::EventgroupId;
    use rand::rngs::mock::StepRng;

    fn client() -> ClientService {
        ClientService::new(ClientServiceConfig {
            service_id: ServiceId(0x1234),
            instance_id: InstanceId::ANY,
            major_version: 0xFF,
            minor_version: 0xFFFFFFFF,
            protocol: super::super::types::TransportProtocol::Udp,
            timers: ClientTimerConfig {
                initial_delay_min_ticks: 0,
                initial_delay_max_ticks: 0,
                repetition_base_delay_ticks: 1,
                repetition_max: 2,
            },
            consumed_event_groups: vec![ConsumedEventGroupConfig {
                eventgroup_id: EventgroupId(1),
                subscribe_ttl_seconds: 3,
                auto_require: true,
            }],
            auto_require: false,
        })
    }

    #[test]
    fn test_ttl_to_ticks_sentinel() {
        assert_eq!(ttl_to_ticks(SD_DEFAULT_TTL, 10), u32::MAX);
        assert_eq!(ttl_to_ticks(1, 10), 100);
    }

    #[test]
    fn test_find_to_main_transition() {
        let mut cl = client();
        let mut rng = StepRng::new(0, 1);
        cl.set_link_up(true);
        cl.request_find();

        assert!(!cl.tick(&mut rng));
        assert!(cl.tick(&mut rng));
        assert!(cl.tick(&mut rng));
        assert!(matches!(cl.phase, Phase::Main));
    }

    #[test]
    fn test_ttl_expiry_returns_to_down_then_initial_wait() {
        let mut cl = client();
        let mut rng = StepRng::new(0, 1);
        cl.set_link_up(true);
        let addr: SocketAddr = "10.0.0.5:30490".parse().unwrap();
        cl.on_offer_received(1, 1000, addr); // ttl_to_ticks(1, 1000) == 1
        assert!(matches!(cl.phase, Phase::Main));

        cl.tick(&mut rng); // ttl_ticks 1 -> 0, on_service_lost fires mid-tick
        assert!(cl.provider_addr.is_none());
        assert!(matches!(cl.phase, Phase::InitialWait));
    }

    #[test]
    fn test_offer_received_requests_subscribe() {
        let mut cl = client();
        let addr: SocketAddr = "10.0.0.5:30490".parse().unwrap();
        cl.on_offer_received(3, 10, addr);
        assert!(matches!(cl.phase, Phase::Main));
        assert_eq!(cl.provider_addr, Some(addr));
        assert!(cl.event_groups[0].flags.contains(flags::eventgroup::PENDING_SUBSCRIBE));
    }

    #[test]
    fn test_service_lost_drops_subscriptions() {
        let mut cl = client();
        let addr: SocketAddr = "10.0.0.5:30490".parse().unwrap();
        cl.on_offer_received(3, 10, addr);
        cl.event_groups[0].on_ack(u32::MAX);
        assert!(cl.event_groups[0].subscribed);

        cl.on_service_lost();
        assert!(!cl.event_groups[0].subscribed);
    }

    #[test]
    fn test_auto_require_false_waits_for_explicit_request() {
        let config = ClientServiceConfig {
            service_id: ServiceId(0x1234),
            instance_id: InstanceId::ANY,
            major_version: 0xFF,
            minor_version: 0xFFFFFFFF,
            protocol: super::super::types::TransportProtocol::Udp,
            timers: ClientTimerConfig {
                initial_delay_min_ticks: 0,
                initial_delay_max_ticks: 0,
                repetition_base_delay_ticks: 1,
                repetition_max: 2,
            },
            consumed_event_groups: vec![ConsumedEventGroupConfig {
                eventgroup_id: EventgroupId(1),
                subscribe_ttl_seconds: 3,
                auto_require: false,
            }],
            auto_require: false,
        };
        let mut cl = ClientService::new(config);
        let addr: SocketAddr = "10.0.0.5:30490".parse().unwrap();

        cl.on_offer_received(3, 10, addr);
        assert!(!cl.event_groups[0].flags.contains(flags::eventgroup::PENDING_SUBSCRIBE));

        cl.event_groups[0].request_subscribe();
        assert!(cl.event_groups[0].flags.contains(flags::eventgroup::PENDING_SUBSCRIBE));
    }

    #[test]
    fn test_client_auto_require_finds_without_explicit_request() {
        let config = ClientServiceConfig {
            service_id: ServiceId(0x1234),
            instance_id: InstanceId::ANY,
            major_version: 0xFF,
            minor_version: 0xFFFFFFFF,
            protocol: super::super::types::TransportProtocol::Udp,
            timers: ClientTimerConfig {
                initial_delay_min_ticks: 0,
                initial_delay_max_ticks: 0,
                repetition_base_delay_ticks: 1,
                repetition_max: 1,
            },
            consumed_event_groups: Vec::new(),
            auto_require: true,
        };
        let mut cl = ClientService::new(config);
        let mut rng = StepRng::new(0, 1);
        cl.set_link_up(true);

        assert!(!cl.tick(&mut rng)); // Down -> InitialWait, no explicit request_find() call
        assert!(cl.tick(&mut rng));
    }
}
