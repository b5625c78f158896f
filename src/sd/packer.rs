//! Outbound datagram packer.
//!
//! Every `MainFunction` tick, each service's state machine may want to send
//! something: an Offer, a Find, a SubscribeAck, a Subscribe. The packer
//! resolves all of that "wanting to send" into at most one multicast and one
//! unicast datagram per tick, respecting a strict pass order: the multicast
//! pass (offers and finds) always runs first; the Ack pass only runs if the
//! multicast pass produced nothing; the Subscribe/StopSubscribe pass only
//! runs if neither of the first two produced anything. This mirrors the
//! original packer's pass mutual exclusion, which exists because the
//! reference target has exactly one pending-transmission buffer to share
//! between them.
//!
//! The algorithm is "measure then emit": a pass first walks every candidate
//! entry to compute the packed size, drops candidates beyond
//! [`Packer::max_payload`] (logging what was dropped so a tick's starvation
//! is never silent), then serializes the survivors into one [`SdMessage`].

use std::net::SocketAddr;

use tracing::warn;

use super::client::ClientService;
use super::flags;
use super::message::SdMessage;
use super::option::Endpoint;
use super::server::ServerService;
use super::types::SD_ENTRY_SIZE;

/// Tracks the session id and reboot flag this node stamps on every SD
/// datagram it sends. A fresh session starts with the Reboot flag set; it is
/// cleared forever the first time the session id wraps back to 1, per the
/// wire semantics of a 16-bit session counter that never legally repeats on
/// the same boot.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    next_id: u16,
    reboot_flag: bool,
}

impl SessionContext {
    /// A fresh session context for a newly started node.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            reboot_flag: true,
        }
    }

    /// Stamp and advance the session id. The id and reboot flag are only
    /// advanced/cleared when the caller reports the transmit succeeded —
    /// a failed transmit must retry with the same session id next tick.
    pub fn stamp(&self) -> (crate::header::SessionId, bool) {
        (crate::header::SessionId(self.next_id), self.reboot_flag)
    }

    /// Advance past the just-stamped session id after a successful send.
    pub fn advance(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
            self.reboot_flag = false;
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One datagram the packer wants transmitted.
#[derive(Debug)]
pub struct OutboundDatagram {
    /// The message, already stamped with flags (the caller still needs to
    /// set the session id from the active [`SessionContext`]).
    pub message: SdMessage,
    /// Destination. `None` means "the configured multicast group".
    pub dest: Option<SocketAddr>,
}

/// Packs service/client state into outbound datagrams, one pass at a time.
pub struct Packer {
    /// Maximum SD payload size in bytes (MTU minus SOME/IP and SD headers).
    pub max_payload: usize,
}

impl Packer {
    /// Build a packer capping datagrams at `max_payload` bytes of SD
    /// payload (entries + options, not counting the SOME/IP header).
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Run the multicast pass: gather every Offer/StopOffer and Find/StopFind
    /// this tick's state-machine advance produced, bounded by `max_payload`.
    pub fn pack_multicast(
        &self,
        offers: Vec<SdMessage>,
        finds: Vec<super::entry::ServiceEntry>,
    ) -> Option<OutboundDatagram> {
        let mut entries = Vec::new();
        let mut options = Vec::new();
        let mut entry_option_counts = Vec::new();

        for offer_msg in offers {
            let mut e = offer_msg.entries;
            let mut o = offer_msg.options;
            if !e.is_empty() {
                if let super::entry::SdEntry::Service(svc) = &mut e[0] {
                    svc.index_first_option = options.len() as u8;
                }
            }
            // All of this offer's options belong to its last entry, so
            // dropping that entry from the tail drops its options with it.
            let owned = o.len();
            for i in 0..e.len() {
                entry_option_counts.push(if i + 1 == e.len() { owned } else { 0 });
            }
            entries.append(&mut e);
            options.append(&mut o);
        }
        for entry in finds {
            entries.push(super::entry::SdEntry::Service(entry));
            entry_option_counts.push(0);
        }

        if entries.is_empty() {
            return None;
        }

        let (entries, options) = self.bound(entries, options, entry_option_counts);

        Some(OutboundDatagram {
            message: SdMessage {
                flags: Default::default(),
                entries,
                options,
            },
            dest: None,
        })
    }

    /// Run the Ack pass for one destination's pending acknowledgements.
    /// Only called when the multicast pass produced nothing this tick.
    pub fn pack_ack(
        &self,
        dest: SocketAddr,
        entries: Vec<super::entry::EventgroupEntry>,
    ) -> Option<OutboundDatagram> {
        if entries.is_empty() {
            return None;
        }
        let n = entries.len();
        let entries = entries.into_iter().map(super::entry::SdEntry::Eventgroup).collect::<Vec<_>>();
        let (entries, options) = self.bound(entries, Vec::new(), vec![0; n]);
        Some(OutboundDatagram {
            message: SdMessage {
                flags: Default::default(),
                entries,
                options,
            },
            dest: Some(dest),
        })
    }

    /// Run the Subscribe/StopSubscribe pass for one destination. Only
    /// called when neither the multicast nor the Ack pass produced
    /// anything this tick.
    pub fn pack_subscribe(
        &self,
        dest: SocketAddr,
        entries: Vec<super::entry::EventgroupEntry>,
        endpoint: Endpoint,
    ) -> Option<OutboundDatagram> {
        if entries.is_empty() {
            return None;
        }
        let mut sd_entries = Vec::new();
        let mut options = vec![endpoint.to_option()];
        for mut entry in entries {
            entry.index_first_option = 0;
            entry.num_options_1 = 1;
            sd_entries.push(super::entry::SdEntry::Eventgroup(entry));
        }
        // The endpoint option is shared by every entry (all point at index
        // 0), so none of them "owns" it for bound()'s drop accounting.
        let n = sd_entries.len();
        let (sd_entries, options) = self.bound(sd_entries, options, vec![0; n]);
        Some(OutboundDatagram {
            message: SdMessage {
                flags: Default::default(),
                entries: sd_entries,
                options,
            },
            dest: Some(dest),
        })
    }

    /// Truncate `entries`/`options` until the packed size fits
    /// `max_payload`, dropping from the tail. `entry_option_counts` gives,
    /// for each entry (same order, same length), how many trailing options
    /// belong exclusively to it — dropping that entry drops those options
    /// too and recomputes the size accordingly. Entries whose options are
    /// shared with others (e.g. every Subscribe in a pass pointing at the
    /// same endpoint option) pass `0` so the shared option is never dropped
    /// out from under an entry that still references it.
    fn bound(
        &self,
        mut entries: Vec<super::entry::SdEntry>,
        mut options: Vec<super::option::SdOption>,
        mut entry_option_counts: Vec<usize>,
    ) -> (Vec<super::entry::SdEntry>, Vec<super::option::SdOption>) {
        let options_len: usize = options.iter().map(|o| o.to_bytes().len()).sum();
        let mut total = 8 + entries.len() * SD_ENTRY_SIZE + 4 + options_len;

        while total > self.max_payload && !entries.is_empty() {
            entries.pop();
            total -= SD_ENTRY_SIZE;
            let owned = entry_option_counts.pop().unwrap_or(0);
            for _ in 0..owned {
                if let Some(opt) = options.pop() {
                    total -= opt.to_bytes().len();
                }
            }
            warn!(max_payload = self.max_payload, "dropped an SD entry to stay under the datagram cap");
        }

        (entries, options)
    }
}

/// Walk every server service's subscriber tables and collect, for the first
/// destination with any pending acknowledgement, every pending ack entry
/// addressed to it. Does **not** clear the pending flag — the caller only
/// does that once the datagram has actually gone out; a failed transmit
/// must leave `PENDING_EVENT_GROUP_ACK` set so the next tick retries.
pub fn collect_pending_acks(
    servers: &[ServerService],
) -> Option<(SocketAddr, Vec<super::entry::EventgroupEntry>)> {
    for server in servers.iter() {
        for (handler_idx, handler) in server.config.event_handlers.iter().enumerate() {
            let table = &server.subscriptions[handler_idx];
            let target = table
                .occupied()
                .find(|s| s.flags.contains(flags::subscriber::PENDING_EVENT_GROUP_ACK))
                .and_then(|s| s.remote_addr);

            let Some(dest) = target else { continue };

            let entries = table
                .occupied()
                .filter(|s| {
                    s.remote_addr == Some(dest) && s.flags.contains(flags::subscriber::PENDING_EVENT_GROUP_ACK)
                })
                .map(|slot| {
                    super::entry::EventgroupEntry::subscribe_ack(
                        server.service_id(),
                        server.instance_id(),
                        server.config.major_version,
                        handler.eventgroup_id,
                        if slot.ttl_ticks == u32::MAX { super::types::SD_DEFAULT_TTL } else { slot.ttl_ticks },
                        slot.session_id.0 as u8,
                    )
                })
                .collect();
            return Some((dest, entries));
        }
    }
    None
}

/// Clear `PENDING_EVENT_GROUP_ACK` on every slot bound to `dest` across every
/// server/event-handler table. Call only after the Ack datagram collected by
/// [`collect_pending_acks`] for that destination has been transmitted
/// successfully.
pub fn clear_pending_acks(servers: &mut [ServerService], dest: SocketAddr) {
    for server in servers.iter_mut() {
        for table in &mut server.subscriptions {
            for i in 0..table.capacity() {
                let slot = table.slot_mut(i);
                if slot.remote_addr == Some(dest) {
                    slot.flags.clear(flags::subscriber::PENDING_EVENT_GROUP_ACK);
                }
            }
        }
    }
}

/// Walk every client's consumed event groups and collect, for the first
/// client with a resolved provider and any pending subscribe action, the
/// pending Subscribe/StopSubscribe entries. Does **not** clear the pending
/// flags — per the propagation policy a failed transmit must leave them set
/// so the packer retries next tick; the caller clears them via
/// [`clear_pending_subscribes`] only after a successful send.
pub fn collect_pending_subscribes(
    clients: &[ClientService],
    provider_endpoint: impl Fn(&ClientService) -> Option<SocketAddr>,
) -> Option<(SocketAddr, Vec<super::entry::EventgroupEntry>)> {
    for client in clients.iter() {
        let Some(dest) = provider_endpoint(client) else { continue };
        let mut entries = Vec::new();
        for eg in &client.event_groups {
            if eg.flags.contains(flags::eventgroup::PENDING_SUBSCRIBE) {
                entries.push(super::entry::EventgroupEntry::subscribe(
                    client.config.service_id,
                    client.config.instance_id,
                    client.config.major_version,
                    eg.eventgroup_id(),
                    eg.config.subscribe_ttl_seconds,
                ));
            } else if eg.flags.contains(flags::eventgroup::PENDING_STOP_SUBSCRIBE) {
                entries.push(super::entry::EventgroupEntry::unsubscribe(
                    client.config.service_id,
                    client.config.instance_id,
                    client.config.major_version,
                    eg.eventgroup_id(),
                ));
            }
        }
        if !entries.is_empty() {
            return Some((dest, entries));
        }
    }
    None
}

/// Clear `PENDING_SUBSCRIBE`/`PENDING_STOP_SUBSCRIBE` on every consumed
/// event group of the client offered by `dest`. Call only after the
/// Subscribe/StopSubscribe datagram collected by
/// [`collect_pending_subscribes`] for that destination has been transmitted
/// successfully.
pub fn clear_pending_subscribes(
    clients: &mut [ClientService],
    dest: SocketAddr,
    provider_endpoint: impl Fn(&ClientService) -> Option<SocketAddr>,
) {
    for client in clients.iter_mut() {
        if provider_endpoint(client) != Some(dest) {
            continue;
        }
        for eg in &mut client.event_groups {
            eg.flags.clear(flags::eventgroup::PENDING_SUBSCRIBE);
            eg.flags.clear(flags::eventgroup::PENDING_STOP_SUBSCRIBE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_context_wraps_and_clears_reboot() {
        let mut ctx = SessionContext::new();
        assert_eq!(ctx.stamp(), (crate::header::SessionId(1), true));
        ctx.next_id = 0xFFFF;
        ctx.advance();
        assert_eq!(ctx.next_id, 1);
        assert!(!ctx.reboot_flag);
    }

    #[test]
    fn test_session_never_emits_zero() {
        let mut ctx = SessionContext::new();
        for _ in 0..0x1_0000 {
            ctx.advance();
            assert_ne!(ctx.next_id, 0);
        }
    }

    #[test]
    fn test_pack_multicast_empty_is_none() {
        let packer = Packer::new(1400);
        assert!(packer.pack_multicast(Vec::new(), Vec::new()).is_none());
    }

    #[test]
    fn test_pack_multicast_offer_carries_option() {
        use crate::header::ServiceId;
        use crate::sd::types::InstanceId;

        let packer = Packer::new(1400);
        let endpoint = Endpoint::udp("127.0.0.1:30501".parse().unwrap());
        let offer = SdMessage::offer_service(ServiceId(0x1234), InstanceId(0x0001), 1, 0, 3, endpoint);

        let datagram = packer.pack_multicast(vec![offer], Vec::new()).unwrap();
        assert_eq!(datagram.message.entries.len(), 1);
        assert_eq!(datagram.message.options.len(), 1);
    }

    #[test]
    fn test_pack_multicast_drops_entries_beyond_max_payload() {
        use crate::header::ServiceId;
        use crate::sd::types::InstanceId;

        // Fixed SD header (8 + 4) plus one entry (16) and its option (12) is
        // exactly 40 bytes; a second offer would push past it.
        let packer = Packer::new(40);
        let endpoint = Endpoint::udp("127.0.0.1:30501".parse().unwrap());
        let offers: Vec<_> = (0..4u16)
            .map(|i| SdMessage::offer_service(ServiceId(0x1234), InstanceId(i), 1, 0, 3, endpoint.clone()))
            .collect();

        let datagram = packer.pack_multicast(offers, Vec::new()).unwrap();
        assert_eq!(datagram.message.entries.len(), 1);
        assert_eq!(datagram.message.options.len(), 1);
    }

    #[test]
    fn test_collect_pending_acks_leaves_flag_until_cleared() {
        use crate::header::ServiceId;
        use crate::sd::config::{EventHandlerConfig, ServerServiceConfig, ServerTimerConfig};
        use crate::sd::types::{EventgroupId, InstanceId};

        let mut svc = ServerService::new(ServerServiceConfig {
            service_id: ServiceId(0x1234),
            instance_id: InstanceId(0x0001),
            major_version: 1,
            minor_version: 0,
            protocol: super::super::types::TransportProtocol::Udp,
            timers: ServerTimerConfig::default(),
            event_handlers: vec![EventHandlerConfig { eventgroup_id: EventgroupId(1), max_subscribers: 2 }],
            auto_available: false,
        });
        let dest: SocketAddr = "10.0.0.5:30490".parse().unwrap();
        let index = svc.subscriptions[0].lookup_or_allocate(dest).unwrap();
        svc.subscriptions[0].bind(index, dest, dest.port(), crate::header::SessionId(1), 100);
        svc.subscriptions[0].slot_mut(index).flags.set(flags::SUBSCRIBED);
        svc.subscriptions[0].slot_mut(index).flags.set(flags::subscriber::PENDING_EVENT_GROUP_ACK);

        let servers = vec![svc];
        let (collected_dest, entries) = collect_pending_acks(&servers).unwrap();
        assert_eq!(collected_dest, dest);
        assert_eq!(entries.len(), 1);
        assert!(servers[0].subscriptions[0].slot(index).flags.contains(flags::subscriber::PENDING_EVENT_GROUP_ACK));

        // collecting again without clearing still finds the same pending ack —
        // this is what makes a failed transmit retry on the next tick.
        assert!(collect_pending_acks(&servers).is_some());

        let mut servers = servers;
        clear_pending_acks(&mut servers, dest);
        assert!(!servers[0].subscriptions[0].slot(index).flags.contains(flags::subscriber::PENDING_EVENT_GROUP_ACK));
        assert!(collect_pending_acks(&servers).is_none());
    }

    #[test]
    fn test_collect_pending_subscribes_leaves_flag_until_cleared() {
        use crate::header::ServiceId;
        use crate::sd::config::{ClientServiceConfig, ClientTimerConfig, ConsumedEventGroupConfig};
        use crate::sd::types::{EventgroupId, InstanceId};

        let mut cl = ClientService::new(ClientServiceConfig {
            service_id: ServiceId(0x1234),
            instance_id: InstanceId(0x0001),
            major_version: 1,
            minor_version: 0,
            protocol: super::super::types::TransportProtocol::Udp,
            timers: ClientTimerConfig::default(),
            consumed_event_groups: vec![ConsumedEventGroupConfig {
                eventgroup_id: EventgroupId(1),
                subscribe_ttl_seconds: 3,
                auto_require: false,
            }],
            auto_require: false,
        });
        let dest: SocketAddr = "10.0.0.5:30490".parse().unwrap();
        cl.provider_addr = Some(dest);
        cl.event_groups[0].flags.set(flags::eventgroup::PENDING_SUBSCRIBE);

        let clients = vec![cl];
        let provider = |c: &ClientService| c.provider_addr;
        let (collected_dest, entries) = collect_pending_subscribes(&clients, provider).unwrap();
        assert_eq!(collected_dest, dest);
        assert_eq!(entries.len(), 1);
        assert!(clients[0].event_groups[0].flags.contains(flags::eventgroup::PENDING_SUBSCRIBE));
        assert!(collect_pending_subscribes(&clients, provider).is_some());

        let mut clients = clients;
        clear_pending_subscribes(&mut clients, dest, provider);
        assert!(!clients[0].event_groups[0].flags.contains(flags::eventgroup::PENDING_SUBSCRIBE));
        assert!(collect_pending_subscribes(&clients, provider).is_none());
    }

    #[test]
    fn test_pack_multicast_stop_offer_carries_no_option() {
        use crate::header::ServiceId;
        use crate::sd::types::InstanceId;

        let packer = Packer::new(1400);
        let stop = SdMessage::stop_offer_service(ServiceId(0x1234), InstanceId(0x0001), 1, 0);

        let datagram = packer.pack_multicast(vec![stop], Vec::new()).unwrap();
        assert_eq!(datagram.message.entries.len(), 1);
        assert!(datagram.message.options.is_empty());
    }
}
