//! The top-level SD engine: owns every service context and exposes the
//! three entry points a caller drives it through (`init`, `main_function`,
//! `rx_indication`). There is no global state anywhere in this module — a
//! process that runs two independent SD instances (for example, one per
//! network interface) simply owns two `SdEngine`s.

use std::net::SocketAddr;

use rand::rngs::ThreadRng;
use tracing::{error, trace};

use crate::error::Result;

use super::client::ClientService;
use super::config::{ClientServiceConfig, ServerServiceConfig};
use super::dispatcher::Dispatcher;
use super::flags::{FlagLock, NoopLock};
use super::option::Endpoint;
use super::packer::{collect_pending_acks, collect_pending_subscribes, Packer, SessionContext};
use super::server::ServerService;
use super::socket::{SoAd, MULTICAST_CONN, UNICAST_CONN};
use super::subscription::SubscriberSlot;

/// Static configuration for one [`SdEngine`] instance.
pub struct EngineConfig {
    /// Services this engine offers.
    pub servers: Vec<ServerServiceConfig>,
    /// Services this engine looks for.
    pub clients: Vec<ClientServiceConfig>,
    /// Length of one `main_function` tick, in milliseconds.
    pub tick_ms: u32,
    /// Maximum SD payload size (MTU minus headers) for a packed datagram.
    pub max_payload: usize,
    /// The endpoint this engine's offered services are reachable on,
    /// advertised in every Offer and direct Find reply.
    pub local_endpoint: Endpoint,
}

/// Owns every server/client service context for one SD participant and
/// drives their state machines, dispatch, and packing.
pub struct SdEngine {
    servers: Vec<ServerService>,
    clients: Vec<ClientService>,
    dispatcher: Dispatcher,
    packer: Packer,
    session: SessionContext,
    soad: Box<dyn SoAd>,
    lock: Box<dyn FlagLock>,
    rng: ThreadRng,
    local_endpoint: Endpoint,
}

impl SdEngine {
    /// Build a new engine. Every configured service starts `Down`; nothing
    /// is transmitted until [`Self::server_service_request_offer`] or
    /// [`Self::client_service_request_find`] is called (and the link is
    /// reported up).
    pub fn new(config: EngineConfig, soad: Box<dyn SoAd>) -> Self {
        Self {
            servers: config.servers.into_iter().map(ServerService::new).collect(),
            clients: config.clients.into_iter().map(ClientService::new).collect(),
            dispatcher: Dispatcher::new(config.tick_ms),
            packer: Packer::new(config.max_payload),
            session: SessionContext::new(),
            soad,
            lock: Box::new(NoopLock),
            rng: rand::thread_rng(),
            local_endpoint: config.local_endpoint,
        }
    }

    /// Replace the default no-op critical section with a real lock, for
    /// embedders that drive `rx_indication` and `main_function` from
    /// different threads.
    pub fn set_flag_lock(&mut self, lock: Box<dyn FlagLock>) {
        self.lock = lock;
    }

    /// Report link state for every configured server and client service.
    /// Call once at startup with `true`, and again whenever the underlying
    /// network interface changes state.
    pub fn set_link_up(&mut self, up: bool) {
        for server in &mut self.servers {
            server.set_link_up(up);
        }
        for client in &mut self.clients {
            client.set_link_up(up);
        }
    }

    /// Request that the server service at `index` start being offered.
    pub fn server_service_request_offer(&mut self, index: usize) {
        let mut svc = &mut self.servers[index];
        self.lock.critical(&mut || svc.request_offer());
    }

    /// Request that the server service at `index` stop being offered.
    pub fn server_service_request_stop_offer(&mut self, index: usize) {
        let mut svc = &mut self.servers[index];
        self.lock.critical(&mut || svc.request_stop_offer());
    }

    /// Request that the client service at `index` start looking for its
    /// configured service.
    pub fn client_service_request_find(&mut self, index: usize) {
        let mut svc = &mut self.clients[index];
        self.lock.critical(&mut || svc.request_find());
    }

    /// Request that the client service at `index` stop looking (dropping
    /// any active subscriptions).
    pub fn client_service_request_stop_find(&mut self, index: usize) {
        let mut svc = &mut self.clients[index];
        self.lock.critical(&mut || svc.request_stop_find());
    }

    /// Request a subscribe for one of client `client_index`'s configured
    /// event groups, by its index within that client's config.
    pub fn consumed_event_group_request_subscribe(&mut self, client_index: usize, eg_index: usize) {
        let eg = &mut self.clients[client_index].event_groups[eg_index];
        self.lock.critical(&mut || eg.request_subscribe());
    }

    /// Request a stop-subscribe for one of client `client_index`'s
    /// configured event groups.
    pub fn consumed_event_group_request_stop_subscribe(&mut self, client_index: usize, eg_index: usize) {
        let eg = &mut self.clients[client_index].event_groups[eg_index];
        self.lock.critical(&mut || eg.request_stop_subscribe());
    }

    /// Current subscriber slots for server `server_index`'s event handler
    /// `handler_index`, for the application layer to fan events out to.
    pub fn subscribers(&self, server_index: usize, handler_index: usize) -> Vec<SubscriberSlot> {
        self.servers[server_index].subscriptions[handler_index]
            .occupied()
            .copied()
            .collect()
    }

    /// Current provider address for client `client_index`, if its service
    /// has been found.
    pub fn provider_addr(&self, client_index: usize) -> Option<SocketAddr> {
        self.clients[client_index].provider_addr
    }

    /// Poll the socket adapter for inbound datagrams and dispatch every one
    /// available this call. Non-blocking: returns once no datagram is
    /// queued on either connection.
    pub fn rx_indication(&mut self) -> Result<()> {
        for conn in [MULTICAST_CONN, UNICAST_CONN] {
            while let Some((data, sender)) = self.soad.poll(conn)? {
                match self.dispatcher.handle_datagram(
                    &data,
                    sender,
                    self.local_endpoint.clone(),
                    &mut self.servers,
                    &mut self.clients,
                ) {
                    Ok(replies) => {
                        for reply in replies {
                            self.send_unicast(reply.dest, reply.message)?;
                        }
                    }
                    Err(e) => error!(error = %e, %sender, "dropping malformed SD datagram"),
                }
            }
        }
        Ok(())
    }

    /// Advance every service's state machine by one tick and transmit
    /// whatever is due. Call this once per `tick_ms` milliseconds.
    pub fn main_function(&mut self) -> Result<()> {
        let mut offers = Vec::new();
        for server in &mut self.servers {
            if server.tick(&mut self.rng) {
                let msg = if server.is_offered() {
                    super::message::SdMessage::offer_service(
                        server.service_id(),
                        server.instance_id(),
                        server.config.major_version,
                        server.config.minor_version,
                        server.config.timers.offer_ttl_seconds,
                        self.local_endpoint.clone(),
                    )
                } else {
                    super::message::SdMessage::stop_offer_service(
                        server.service_id(),
                        server.instance_id(),
                        server.config.major_version,
                        server.config.minor_version,
                    )
                };
                offers.push(msg);
            }
            server.tick_subscriptions();
        }

        let mut finds = Vec::new();
        for client in &mut self.clients {
            if client.tick(&mut self.rng) {
                finds.push(super::entry::ServiceEntry::find_service(
                    client.service_id(),
                    client.instance_id(),
                    client.config.major_version,
                    client.config.minor_version,
                ));
            }
        }

        if let Some(datagram) = self.packer.pack_multicast(offers, finds) {
            trace!("SD multicast pass sending this tick");
            self.send_multicast(datagram.message)?;
            return Ok(());
        }

        if let Some((dest, acks)) = collect_pending_acks(&self.servers) {
            if let Some(datagram) = self.packer.pack_ack(dest, acks) {
                self.send_unicast(dest, datagram.message)?;
                super::packer::clear_pending_acks(&mut self.servers, dest);
                return Ok(());
            }
        }

        if let Some((dest, subs)) = collect_pending_subscribes(&self.clients, |c| c.provider_addr) {
            if let Some(datagram) = self.packer.pack_subscribe(dest, subs, self.local_endpoint.clone()) {
                self.send_unicast(dest, datagram.message)?;
                super::packer::clear_pending_subscribes(&mut self.clients, dest, |c| c.provider_addr);
            }
        }

        Ok(())
    }

    fn send_multicast(&mut self, mut message: super::message::SdMessage) -> Result<()> {
        let (session_id, reboot) = self.session.stamp();
        message.flags.reboot = reboot;
        message.flags.unicast = false;
        let mut someip = message.to_someip_message();
        someip.header.session_id = session_id;
        match self.soad.transmit(MULTICAST_CONN, None, &someip.to_bytes()) {
            Ok(()) => {
                self.session.advance();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn send_unicast(&mut self, dest: SocketAddr, mut message: super::message::SdMessage) -> Result<()> {
        let (session_id, reboot) = self.session.stamp();
        message.flags.reboot = reboot;
        message.flags.unicast = true;
        let mut someip = message.to_someip_message();
        someip.header.session_id = session_id;
        match self.soad.transmit(UNICAST_CONN, Some(dest), &someip.to_bytes()) {
            Ok(()) => {
                self.session.advance();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ServiceId;
    use crate::sd::config::{EventHandlerConfig, ServerTimerConfig};
    use crate::sd::types::{EventgroupId, InstanceId};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSoAd {
        sent: Mutex<VecDeque<(super::super::socket::SoConId, Option<SocketAddr>, Vec<u8>)>>,
    }

    impl SoAd for FakeSoAd {
        fn local_addr(&self, _conn: super::super::socket::SoConId) -> Result<SocketAddr> {
            Ok("127.0.0.1:30490".parse().unwrap())
        }
        fn transmit(&self, conn: super::super::socket::SoConId, dest: Option<SocketAddr>, data: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push_back((conn, dest, data.to_vec()));
            Ok(())
        }
        fn poll(&self, _conn: super::super::socket::SoConId) -> Result<Option<(Vec<u8>, SocketAddr)>> {
            Ok(None)
        }
    }

    fn engine() -> SdEngine {
        let config = EngineConfig {
            servers: vec![ServerServiceConfig {
                service_id: ServiceId(0x1234),
                instance_id: InstanceId(0x0001),
                major_version: 1,
                minor_version: 0,
                protocol: super::super::types::TransportProtocol::Udp,
                timers: ServerTimerConfig {
                    initial_delay_min_ticks: 0,
                    initial_delay_max_ticks: 0,
                    repetition_base_delay_ticks: 1,
                    repetition_max: 1,
                    cyclic_offer_delay_ticks: 0,
                    offer_ttl_seconds: 3,
                },
                event_handlers: vec![EventHandlerConfig {
                    eventgroup_id: EventgroupId(1),
                    max_subscribers: 4,
                }],
                auto_available: false,
            }],
            clients: Vec::new(),
            tick_ms: 10,
            max_payload: 1400,
            local_endpoint: Endpoint::udp("127.0.0.1:30501".parse().unwrap()),
        };
        SdEngine::new(config, Box::new(FakeSoAd::default()))
    }

    #[test]
    fn test_offer_eventually_transmits() {
        let mut eng = engine();
        eng.set_link_up(true);
        eng.server_service_request_offer(0);

        for _ in 0..5 {
            eng.main_function().unwrap();
        }

        assert!(matches!(eng.servers[0].phase, super::super::server::Phase::Main | super::super::server::Phase::Repetition));
    }

    #[test]
    fn test_subscribers_empty_initially() {
        let eng = engine();
        assert!(eng.subscribers(0, 0).is_empty());
    }
}
