//! Server-side (service offering) state machine.
//!
//! One [`ServerService`] tracks a single offered service instance through
//! its four phases: `Down` (not offered), `InitialWait` (randomized
//! pre-offer delay), `Repetition` (a handful of closely-spaced offers to
//! shorten discovery latency for anyone already listening), and `Main`
//! (steady state, optionally with a cyclic offer).

use rand::Rng;
use tracing::{debug, trace};

use crate::header::ServiceId;

use super::config::{ServerServiceConfig, ServerTimerConfig};
use super::flags::{self, Flags};
use super::subscription::SubscriptionTable;
use super::types::InstanceId;

/// Phase of a server or client service state machine. Both sides share the
/// same four phases; only the timers and the entries they emit differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not offered (or not searched for). No entries are sent.
    Down,
    /// Waiting out the randomized pre-announcement delay.
    InitialWait,
    /// Sending closely-spaced repeated announcements.
    Repetition,
    /// Steady state.
    Main,
}

/// One offered service instance and its Offer state machine.
#[derive(Debug)]
pub struct ServerService {
    /// Static configuration (ids, versions, timers, event handlers).
    pub config: ServerServiceConfig,
    /// Current phase.
    pub phase: Phase,
    /// Pending-transition and link flags for this service.
    pub flags: Flags,
    /// Ticks remaining before the next phase transition or retransmission.
    pub delay_ticks: u32,
    /// Number of repeated offers already sent in the `Repetition` phase.
    pub repetition_count: u32,
    /// Subscriber tables, one per configured event handler, indexed the
    /// same as `config.event_handlers`.
    pub subscriptions: Vec<SubscriptionTable>,
}

impl ServerService {
    /// Build a new, initially-down server service context from its config.
    /// If `config.auto_available` is set, a request to offer is raised
    /// immediately — the next tick with the link up carries it straight into
    /// `InitialWait`, without a separate `ServerServiceSetState` call.
    pub fn new(config: ServerServiceConfig) -> Self {
        let subscriptions = config
            .event_handlers
            .iter()
            .map(|eh| SubscriptionTable::new(eh.max_subscribers))
            .collect();
        let auto_available = config.auto_available;

        let mut svc = Self {
            config,
            phase: Phase::Down,
            flags: Flags::new(),
            delay_ticks: 0,
            repetition_count: 0,
            subscriptions,
        };
        if auto_available {
            svc.request_offer();
        }
        svc
    }

    /// Service id of the offered instance.
    pub fn service_id(&self) -> ServiceId {
        self.config.service_id
    }

    /// Instance id of the offered instance.
    pub fn instance_id(&self) -> InstanceId {
        self.config.instance_id
    }

    fn timers(&self) -> &ServerTimerConfig {
        &self.config.timers
    }

    /// Request the service be offered. A no-op if already offered or
    /// transitioning up.
    pub fn request_offer(&mut self) {
        if matches!(self.phase, Phase::Down) {
            self.flags
                .set_clear(flags::server::PENDING_OFFER, flags::server::PENDING_STOP_OFFER);
        }
    }

    /// Request the service stop being offered. A no-op if already down.
    pub fn request_stop_offer(&mut self) {
        if !matches!(self.phase, Phase::Down) {
            self.flags
                .set_clear(flags::server::PENDING_STOP_OFFER, flags::server::PENDING_OFFER);
        }
    }

    /// Mark the link this service runs on as up or down. Going down forces
    /// an immediate transition to `Down`, matching `Sd_ServerServiceLinkControl`.
    pub fn set_link_up(&mut self, up: bool) {
        if up {
            self.flags.set(flags::LINK_UP);
        } else {
            self.flags.clear(flags::LINK_UP);
            self.phase = Phase::Down;
            self.flags.set(flags::server::PENDING_STOP_OFFER);
            self.release_subscribers();
        }
    }

    /// Free every subscriber slot across every event handler. Called
    /// whenever the service stops being offered, whether by explicit
    /// RELEASE or the link going down.
    fn release_subscribers(&mut self) {
        for table in &mut self.subscriptions {
            for i in 0..table.capacity() {
                table.free(i);
            }
        }
    }

    /// Advance the state machine by one tick. Returns `true` if an Offer or
    /// StopOffer entry should be emitted by the packer this tick.
    pub fn tick<R: Rng>(&mut self, rng: &mut R) -> bool {
        let link_up = self.flags.contains(flags::LINK_UP);

        if self.flags.contains(flags::server::PENDING_STOP_OFFER) {
            self.flags.clear_request();
            self.flags.clear(flags::server::PENDING_STOP_OFFER);
            let was_up = !matches!(self.phase, Phase::Down);
            self.phase = Phase::Down;
            self.release_subscribers();
            return was_up;
        }

        match self.phase {
            Phase::Down => {
                if link_up && self.flags.contains(flags::server::PENDING_OFFER) {
                    self.flags.clear(flags::server::PENDING_OFFER);
                    let timers = self.timers();
                    self.delay_ticks = rng
                        .gen_range(timers.initial_delay_min_ticks..=timers.initial_delay_max_ticks);
                    self.repetition_count = 0;
                    self.phase = Phase::InitialWait;
                    trace!(service = %self.service_id(), delay = self.delay_ticks, "server entering InitialWait");
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
                debug!(service = %self.service_id(), "server sending initial offer");
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
                    self.delay_ticks = self.timers().cyclic_offer_delay_ticks;
                } else {
                    self.delay_ticks =
                        self.timers().repetition_base_delay_ticks * (1 << self.repetition_count);
                }
                true
            }
            Phase::Main => {
                if self.timers().cyclic_offer_delay_ticks == 0 {
                    return false;
                }
                if self.delay_ticks > 0 {
                    self.delay_ticks -= 1;
                    return false;
                }
                self.delay_ticks = self.timers().cyclic_offer_delay_ticks;
                true
            }
        }
    }

    /// Whether the service is currently in a phase where it answers Finds
    /// and is considered "up" for matching purposes.
    pub fn is_offered(&self) -> bool {
        matches!(self.phase, Phase::Repetition | Phase::Main)
    }

    /// Whether a Find arriving right now should get an immediate direct
    /// Offer reply: any phase but `Down`, or `Down` with an offer request
    /// already pending (made this tick, not yet carried into `InitialWait`
    /// by the next `tick`).
    pub fn answers_find(&self) -> bool {
        !matches!(self.phase, Phase::Down) || self.flags.contains(flags::server::PENDING_OFFER)
    }

    /// Advance TTLs on every subscriber table by one tick, freeing expired
    /// subscriptions.
    pub fn tick_subscriptions(&mut self) {
        for table in &mut self.subscriptions {
            table.tick();
        }
    }
}
