//! Inbound SD datagram dispatch.
//!
//! [`Dispatcher::handle_datagram`] decodes a raw datagram, applies reboot
//! detection, then walks its entries against the engine's server and client
//! service contexts. Matching a service entry to a context always checks
//! ServiceId *and* InstanceId — the original implementation this engine is
//! modeled on matched on either id alone, which let a FindService for one
//! instance answer as if it were a different instance of the same service.
//!
//! A FindService that matches an already-offered service is answered
//! directly with a unicast OfferService, bypassing the packer's queued
//! passes entirely — the provider already knows the answer, so there is no
//! reason to wait for the next tick's multicast pass.
//!
//! Offer and Subscribe entries are additionally checked against the
//! configured major/minor version (with the `ANY_*_VERSION` wildcards),
//! transport protocol, and the mandatory endpoint option's address against
//! the datagram's sender — an Offer or Subscribe that fails any of these is
//! ignored for that service without otherwise disturbing dispatch of the
//! rest of the datagram.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::error::SomeIpError;
use crate::header::{SessionId, SomeIpHeader};

use super::client::{ttl_to_ticks, ClientService};
use super::flags;
use super::message::SdMessage;
use super::option::Endpoint;
use super::server::ServerService;
use super::subscription::SubscriptionTable;
use super::types::{EntryType, InstanceId};

/// Per-sender reboot-detection state: the last session id seen from that
/// sender while its Reboot flag was set.
#[derive(Debug, Default)]
pub struct RebootTracker {
    last_session: HashMap<SocketAddr, u16>,
}

impl RebootTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check an incoming datagram's session id against the stored one for
    /// `sender`. Returns `true` if this datagram indicates the sender has
    /// rebooted since the last datagram from it (so all subscriptions and
    /// found-service state for that sender must be invalidated).
    ///
    /// Per the reboot rule: a reboot is detected when the Reboot flag is set
    /// and the incoming session id is not strictly greater than the stored
    /// one (accounting for wraparound is the sender's responsibility — the
    /// session id only wraps on a real restart, which is exactly a reboot).
    pub fn check(&mut self, sender: SocketAddr, reboot_flag: bool, session_id: SessionId) -> bool {
        let rebooted = match self.last_session.get(&sender) {
            Some(&last) if reboot_flag => session_id.0 <= last,
            _ => false,
        };
        self.last_session.insert(sender, session_id.0);
        rebooted
    }
}

/// A reply the dispatcher wants sent immediately, bypassing the packer's
/// regular per-tick passes.
#[derive(Debug)]
pub struct ImmediateReply {
    /// The message to send.
    pub message: SdMessage,
    /// Destination.
    pub dest: SocketAddr,
}

fn matches_service(configured: (crate::header::ServiceId, InstanceId), incoming: (crate::header::ServiceId, InstanceId)) -> bool {
    let (cfg_service, cfg_instance) = configured;
    let (in_service, in_instance) = incoming;
    cfg_service == in_service && (cfg_instance.is_any() || in_instance.is_any() || cfg_instance == in_instance)
}

/// Check a configured (major, minor) version pair against the entry's
/// advertised version, honoring the `ANY_MAJOR_VERSION`/`ANY_MINOR_VERSION`
/// wildcards on the configured side.
fn version_matches(cfg_major: u8, cfg_minor: u32, entry_major: u8, entry_minor: u32) -> bool {
    use super::types::{ANY_MAJOR_VERSION, ANY_MINOR_VERSION};
    (cfg_major == ANY_MAJOR_VERSION || cfg_major == entry_major)
        && (cfg_minor == ANY_MINOR_VERSION || cfg_minor == entry_minor)
}

/// Dispatches inbound datagrams against the engine's service contexts.
pub struct Dispatcher {
    /// Tracks reboot state per remote endpoint.
    pub reboot_tracker: RebootTracker,
    /// Tick length in milliseconds, used to convert wire TTLs to ticks.
    pub tick_ms: u32,
}

impl Dispatcher {
    /// Build a dispatcher for an engine running at `tick_ms` per
    /// `MainFunction` call.
    pub fn new(tick_ms: u32) -> Self {
        Self {
            reboot_tracker: RebootTracker::new(),
            tick_ms,
        }
    }

    /// Handle one raw inbound datagram. `sender` is the UDP peer address it
    /// arrived from, `local_endpoint` the address/protocol this engine's
    /// services are reachable on (used for direct unicast Offer replies).
    /// Returns any reply that should be sent immediately.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        sender: SocketAddr,
        local_endpoint: Endpoint,
        servers: &mut [ServerService],
        clients: &mut [ClientService],
    ) -> crate::error::Result<Vec<ImmediateReply>> {
        let (header, message) = SdMessage::decode_datagram(data)?;

        let rebooted = self
            .reboot_tracker
            .check(sender, message.flags.reboot, header.session_id);
        if rebooted {
            warn!(%sender, "SD reboot detected, invalidating subscriptions and found state");
            for client in clients.iter_mut() {
                if client.provider_addr == Some(sender) {
                    client.on_service_lost();
                }
            }
            for server in servers.iter_mut() {
                for table in &mut server.subscriptions {
                    table.free_by_addr(sender);
                }
            }
        }

        let mut replies = Vec::new();
        for entry in &message.entries {
            let endpoints = message.get_endpoints_for_entry(entry);
            match entry {
                super::entry::SdEntry::Service(e) => match e.entry_type {
                    EntryType::FindService => {
                        if let Some(reply) = self.handle_find(servers, e, sender, local_endpoint.clone()) {
                            replies.push(reply);
                        }
                    }
                    EntryType::OfferService => {
                        self.handle_offer(clients, e, &endpoints, sender);
                    }
                    _ => unreachable!("service entry type is always Find or Offer"),
                },
                super::entry::SdEntry::Eventgroup(e) => match e.entry_type {
                    EntryType::SubscribeEventgroup => {
                        if let Some(reply) =
                            self.handle_subscribe(servers, e, &endpoints, sender)
                        {
                            replies.push(reply);
                        }
                    }
                    EntryType::SubscribeEventgroupAck => {
                        self.handle_ack(clients, e);
                    }
                    _ => unreachable!("eventgroup entry type is always Subscribe or Ack"),
                },
            }
        }

        Ok(replies)
    }

    fn handle_find(
        &self,
        servers: &mut [ServerService],
        entry: &super::entry::ServiceEntry,
        sender: SocketAddr,
        local_endpoint: Endpoint,
    ) -> Option<ImmediateReply> {
        let server = servers.iter().find(|s| {
            matches_service(
                (s.service_id(), s.instance_id()),
                (entry.service_id, entry.instance_id),
            ) && s.answers_find()
        })?;

        debug!(service = %server.service_id(), %sender, "answering Find with direct unicast Offer");

        let reply = SdMessage::offer_service(
            server.service_id(),
            server.instance_id(),
            server.config.major_version,
            server.config.minor_version,
            server.config.timers.offer_ttl_seconds,
            local_endpoint,
        );
        Some(ImmediateReply { message: reply, dest: sender })
    }

    fn handle_offer(
        &self,
        clients: &mut [ClientService],
        entry: &super::entry::ServiceEntry,
        endpoints: &[Endpoint],
        sender: SocketAddr,
    ) {
        // A StopOffer (TTL=0) carries no endpoint option — the provider is
        // going away, there is nothing to connect to. Only a live Offer
        // requires the mandatory option and the checks that depend on it.
        let endpoint = if entry.is_stop_offer() {
            None
        } else {
            match endpoints.first() {
                Some(ep) => Some(ep),
                None => {
                    debug!(service = %entry.service_id, error = %SomeIpError::OptionNotFound, "dropping Offer");
                    return;
                }
            }
        };
        if let Some(ep) = endpoint {
            if ep.address.ip() != sender.ip() {
                debug!(service = %entry.service_id, %sender, option_ip = %ep.address.ip(), error = %SomeIpError::AddressMismatch, "dropping Offer");
                return;
            }
        }

        for client in clients.iter_mut() {
            if !matches_service(
                (client.service_id(), client.instance_id()),
                (entry.service_id, entry.instance_id),
            ) {
                continue;
            }
            if entry.is_stop_offer() {
                client.on_service_lost();
                continue;
            }
            let endpoint = endpoint.expect("checked above: non-stop-offer requires an endpoint");
            if !version_matches(
                client.config.major_version,
                client.config.minor_version,
                entry.major_version,
                entry.minor_version,
            ) {
                let error = SomeIpError::VersionMismatch {
                    expected_major: client.config.major_version,
                    got_major: entry.major_version,
                };
                debug!(service = %entry.service_id, %error, "ignoring Offer for this client");
                continue;
            }
            if endpoint.protocol != client.config.protocol {
                debug!(service = %entry.service_id, error = %SomeIpError::ProtocolMismatch, "ignoring Offer for this client");
                continue;
            }
            client.on_offer_received(entry.ttl, self.tick_ms, endpoint.address);
        }
    }

    fn handle_subscribe(
        &self,
        servers: &mut [ServerService],
        entry: &super::entry::EventgroupEntry,
        endpoints: &[Endpoint],
        sender: SocketAddr,
    ) -> Option<ImmediateReply> {
        let server = servers.iter_mut().find(|s| {
            matches_service(
                (s.service_id(), s.instance_id()),
                (entry.service_id, entry.instance_id),
            )
        })?;

        let handler_index = server
            .config
            .event_handlers
            .iter()
            .position(|eh| eh.eventgroup_id == entry.eventgroup_id)?;

        if let Some(option) = endpoints.first() {
            if option.protocol != server.config.protocol {
                debug!(service = %entry.service_id, error = %SomeIpError::ProtocolMismatch, "rejecting Subscribe");
                return None;
            }
            if option.address.ip() != sender.ip() {
                debug!(service = %entry.service_id, %sender, option_ip = %option.address.ip(), error = %SomeIpError::AddressMismatch, "rejecting Subscribe");
                return None;
            }
        }
        let remote_addr = endpoints.first().map(|e| e.address).unwrap_or(sender);
        let table: &mut SubscriptionTable = &mut server.subscriptions[handler_index];

        if entry.is_negative() {
            table.free_by_addr(remote_addr);
            return None;
        }

        let ttl_ticks = ttl_to_ticks(entry.ttl, self.tick_ms);
        let slot_index = match table.lookup_or_allocate(remote_addr) {
            Ok(i) => i,
            Err(_) => {
                let nack = SdMessage::subscribe_eventgroup_nack(
                    entry.service_id,
                    entry.instance_id,
                    entry.major_version,
                    entry.eventgroup_id,
                    entry.counter,
                );
                return Some(ImmediateReply { message: nack, dest: sender });
            }
        };

        table.bind(slot_index, remote_addr, remote_addr.port(), SessionId(entry.counter as u16), ttl_ticks);
        table.slot_mut(slot_index).flags.set(flags::SUBSCRIBED);
        table
            .slot_mut(slot_index)
            .flags
            .set(flags::subscriber::PENDING_EVENT_GROUP_ACK);

        None
    }

    fn handle_ack(&self, clients: &mut [ClientService], entry: &super::entry::EventgroupEntry) {
        for client in clients.iter_mut() {
            if !matches_service(
                (client.service_id(), client.instance_id()),
                (entry.service_id, entry.instance_id),
            ) {
                continue;
            }
            if let Some(eg) = client
                .event_groups
                .iter_mut()
                .find(|eg| eg.eventgroup_id() == entry.eventgroup_id)
            {
                if entry.is_negative() {
                    eg.on_nack_or_lost();
                } else {
                    eg.on_ack(ttl_to_ticks(entry.ttl, self.tick_ms));
                }
            }
        }
    }
}
