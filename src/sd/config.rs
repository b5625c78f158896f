//! Static configuration for the SD timers, services, and event handlers.
//!
//! Every timing value is expressed in ticks of the engine's `MainFunction`
//! call period, matching how the underlying state machines count down. The
//! `Default` impls below pick the commonly-used AUTOSAR example values (an
//! initial wait window of 0-500ms and three repetitions starting at 50ms,
//! assuming a 10ms tick) rather than leaving the caller to guess.

/// Timer parameters for a server service's Offer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimerConfig {
    /// Lower bound (inclusive) of the randomized `INITIAL_WAIT` delay, in ticks.
    pub initial_delay_min_ticks: u32,
    /// Upper bound (inclusive) of the randomized `INITIAL_WAIT` delay, in ticks.
    pub initial_delay_max_ticks: u32,
    /// Base delay before the first `REPETITION` retransmission, in ticks.
    pub repetition_base_delay_ticks: u32,
    /// Number of repeated offers sent during the `REPETITION` phase.
    pub repetition_max: u32,
    /// Cyclic offer delay once in `MAIN` phase, in ticks. `0` disables
    /// cyclic offers (offers are sent only on state changes and on Find).
    pub cyclic_offer_delay_ticks: u32,
    /// TTL advertised with each Offer, in seconds. `0xFFFFFF` never expires.
    pub offer_ttl_seconds: u32,
}

impl Default for ServerTimerConfig {
    fn default() -> Self {
        Self {
            initial_delay_min_ticks: 0,
            initial_delay_max_ticks: 50,
            repetition_base_delay_ticks: 5,
            repetition_max: 3,
            cyclic_offer_delay_ticks: 0,
            offer_ttl_seconds: 3,
        }
    }
}

/// Timer parameters for a client service's Find state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimerConfig {
    /// Lower bound (inclusive) of the randomized `INITIAL_WAIT` delay, in ticks.
    pub initial_delay_min_ticks: u32,
    /// Upper bound (inclusive) of the randomized `INITIAL_WAIT` delay, in ticks.
    pub initial_delay_max_ticks: u32,
    /// Base delay before the first `REPETITION` retransmission, in ticks.
    pub repetition_base_delay_ticks: u32,
    /// Number of repeated finds sent during the `REPETITION` phase.
    pub repetition_max: u32,
}

impl Default for ClientTimerConfig {
    fn default() -> Self {
        Self {
            initial_delay_min_ticks: 0,
            initial_delay_max_ticks: 50,
            repetition_base_delay_ticks: 5,
            repetition_max: 3,
        }
    }
}

/// Static configuration for one event handler (the provider side of an
/// eventgroup): how many subscriber slots it offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandlerConfig {
    /// Eventgroup this handler serves.
    pub eventgroup_id: super::types::EventgroupId,
    /// Fixed number of subscriber slots. A Subscribe beyond this capacity
    /// is rejected with [`crate::error::SomeIpError::NoFreeSlot`].
    pub max_subscribers: usize,
}

/// Static configuration for a service the engine offers.
#[derive(Debug, Clone)]
pub struct ServerServiceConfig {
    /// Service identifier.
    pub service_id: crate::header::ServiceId,
    /// Instance identifier (must not be the wildcard).
    pub instance_id: super::types::InstanceId,
    /// Major interface version advertised in Offer entries.
    pub major_version: u8,
    /// Minor interface version advertised in Offer entries.
    pub minor_version: u32,
    /// Transport this service is reachable over. A Subscribe naming a
    /// different protocol is rejected with `ProtocolMismatch`.
    pub protocol: super::types::TransportProtocol,
    /// Timer parameters for this service's state machine.
    pub timers: ServerTimerConfig,
    /// Event handlers (and their subscriber tables) this service exposes.
    pub event_handlers: Vec<EventHandlerConfig>,
    /// Start offering as soon as the link comes up, without waiting for an
    /// explicit `ServerServiceSetState(AVAILABLE)` call.
    pub auto_available: bool,
}

/// Static configuration for a consumed event group (the subscribe side of
/// an eventgroup on the client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedEventGroupConfig {
    /// Eventgroup this consumer subscribes to.
    pub eventgroup_id: super::types::EventgroupId,
    /// TTL requested in Subscribe entries, in seconds.
    pub subscribe_ttl_seconds: u32,
    /// Subscribe as soon as the parent service is found, without waiting for
    /// an explicit `ConsumedEventGroupSetState(REQUESTED)` call.
    pub auto_require: bool,
}

/// Static configuration for a service the engine looks for.
#[derive(Debug, Clone)]
pub struct ClientServiceConfig {
    /// Service identifier to find.
    pub service_id: crate::header::ServiceId,
    /// Instance identifier to find (may be the wildcard).
    pub instance_id: super::types::InstanceId,
    /// Major interface version required (`0xFF` accepts any).
    pub major_version: u8,
    /// Minor interface version required (`0xFFFFFFFF` accepts any).
    pub minor_version: u32,
    /// Transport the offered endpoint must use. An Offer naming a different
    /// protocol is ignored.
    pub protocol: super::types::TransportProtocol,
    /// Timer parameters for this service's state machine.
    pub timers: ClientTimerConfig,
    /// Event groups this client subscribes to once the service is found.
    pub consumed_event_groups: Vec<ConsumedEventGroupConfig>,
    /// Start looking for the service as soon as the link comes up, without
    /// waiting for an explicit `ClientServiceSetState(REQUESTED)` call.
    pub auto_require: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timer_defaults_are_sane() {
        let timers = ServerTimerConfig::default();
        assert!(timers.initial_delay_min_ticks <= timers.initial_delay_max_ticks);
        assert!(timers.repetition_max > 0);
    }

    #[test]
    fn test_client_timer_defaults_are_sane() {
        let timers = ClientTimerConfig::default();
        assert!(timers.initial_delay_min_ticks <= timers.initial_delay_max_ticks);
        assert!(timers.repetition_max > 0);
    }
}
