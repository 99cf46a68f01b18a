//! Peer table and cryptokey routing.
//!
//! Every allowed IP prefix belongs to at most one peer; assigning a prefix
//! to a second peer moves it. Outbound packets are routed to the peer whose
//! prefix is the longest match for the destination address.

use ipnet::IpNet;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use wgkit_shared::proto::{Key, PeerState, PeerUpdate};

use crate::reclaim::Reclaimer;

/// Packets held per peer for the cryptographic engine; the oldest is dropped
/// when full.
pub const MAX_STAGED_PACKETS: usize = 128;

#[derive(Debug)]
struct Peer {
    public_key: Key,
    preshared_key: Option<Key>,
    endpoint: Option<SocketAddr>,
    keepalive: u16,
    allowed_ips: Vec<IpNet>,
    last_handshake: Option<Duration>,
    rx_bytes: u64,
    tx_bytes: u64,
    staged: VecDeque<Vec<u8>>,
}

impl Peer {
    fn new(public_key: Key) -> Self {
        Peer {
            public_key,
            preshared_key: None,
            endpoint: None,
            keepalive: 0,
            allowed_ips: Vec::new(),
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            staged: VecDeque::new(),
        }
    }

    fn stage(&mut self, packet: Vec<u8>) {
        if self.staged.len() >= MAX_STAGED_PACKETS {
            self.staged.pop_front();
        }
        self.staged.push_back(packet);
    }

    fn state(&self) -> PeerState {
        let mut state = PeerState::new(self.public_key.clone());
        state.preshared_key = self.preshared_key.clone();
        state.endpoint = self.endpoint;
        state.last_handshake = self.last_handshake;
        state.rx_bytes = self.rx_bytes;
        state.tx_bytes = self.tx_bytes;
        state.persistent_keepalive_interval = self.keepalive;
        state.allowed_ips = self.allowed_ips.clone();
        state
    }
}

/// All peers of one device, in configuration order.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
    roaming_disabled: bool,
}

impl PeerTable {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn position(&self, key: &Key) -> Option<usize> {
        self.peers.iter().position(|p| &p.public_key == key)
    }

    /// Drop every peer, retiring preshared keys.
    pub fn clear(&mut self, reclaimer: &Reclaimer) {
        for peer in self.peers.drain(..) {
            if let Some(psk) = peer.preshared_key {
                reclaimer.retire(psk);
            }
        }
    }

    /// Apply one peer section of a set document.
    pub fn apply(&mut self, update: &PeerUpdate, reclaimer: &Reclaimer) {
        let existing = self.position(&update.public_key);

        if update.remove {
            if let Some(idx) = existing {
                let peer = self.peers.remove(idx);
                if let Some(psk) = peer.preshared_key {
                    reclaimer.retire(psk);
                }
            }
            return;
        }

        let idx = match existing {
            Some(idx) => idx,
            None if update.update_only => return,
            None => {
                self.peers.push(Peer::new(update.public_key.clone()));
                self.peers.len() - 1
            }
        };

        {
            let peer = &mut self.peers[idx];
            if let Some(psk) = &update.preshared_key {
                if let Some(old) = peer.preshared_key.take() {
                    reclaimer.retire(old);
                }
                peer.preshared_key = (!psk.is_zero()).then(|| psk.clone());
            }
            if let Some(endpoint) = update.endpoint {
                peer.endpoint = Some(endpoint);
            }
            if let Some(interval) = update.persistent_keepalive_interval {
                peer.keepalive = interval;
            }
            if update.replace_allowed_ips {
                peer.allowed_ips.clear();
            }
        }

        for net in &update.allowed_ips {
            self.assign_prefix(idx, *net);
        }
    }

    /// Give `net` to peer `idx`, taking it from whoever held it.
    fn assign_prefix(&mut self, idx: usize, net: IpNet) {
        let prefix = net.trunc();
        for peer in self.peers.iter_mut() {
            peer.allowed_ips.retain(|held| held.trunc() != prefix);
        }
        self.peers[idx].allowed_ips.push(net);
    }

    /// Index of the peer owning the longest prefix containing `dst`.
    fn route(&self, dst: IpAddr) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .flat_map(|(idx, peer)| peer.allowed_ips.iter().map(move |net| (idx, net)))
            .filter(|(_, net)| net.contains(&dst))
            .max_by_key(|(_, net)| net.prefix_len())
            .map(|(idx, _)| idx)
    }

    /// Public key of the peer that `dst` routes to.
    pub fn lookup(&self, dst: IpAddr) -> Option<&Key> {
        self.route(dst).map(|idx| &self.peers[idx].public_key)
    }

    /// Route an outbound IP packet and stage it. Returns false when no peer
    /// covers the destination.
    pub fn stage_packet(&mut self, packet: &[u8]) -> bool {
        let Some(idx) = destination(packet).and_then(|dst| self.route(dst)) else {
            return false;
        };
        let peer = &mut self.peers[idx];
        peer.tx_bytes += packet.len() as u64;
        peer.stage(packet.to_vec());
        true
    }

    /// Stage an empty keepalive for every peer with an endpoint.
    pub fn queue_keepalives(&mut self) -> usize {
        let mut queued = 0;
        for peer in self.peers.iter_mut().filter(|p| p.endpoint.is_some()) {
            peer.stage(Vec::new());
            queued += 1;
        }
        queued
    }

    /// Drain staged packets of one peer.
    pub fn take_staged(&mut self, key: &Key) -> Vec<Vec<u8>> {
        match self.position(key) {
            Some(idx) => self.peers[idx].staged.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Credit a datagram received from `from` to the peer at that endpoint.
    pub fn credit_rx(&mut self, from: SocketAddr, len: usize) -> bool {
        match self.peers.iter_mut().find(|p| p.endpoint == Some(from)) {
            Some(peer) => {
                peer.rx_bytes += len as u64;
                true
            }
            None => false,
        }
    }

    /// Follow a peer's authenticated source address unless roaming is off.
    pub fn observe_endpoint(&mut self, key: &Key, endpoint: SocketAddr) -> bool {
        if self.roaming_disabled {
            return false;
        }
        match self.position(key) {
            Some(idx) => {
                self.peers[idx].endpoint = Some(endpoint);
                true
            }
            None => false,
        }
    }

    pub fn record_handshake(&mut self, key: &Key, since_epoch: Duration) {
        if let Some(idx) = self.position(key) {
            self.peers[idx].last_handshake = Some(since_epoch);
        }
    }

    pub fn disable_roaming(&mut self) {
        self.roaming_disabled = true;
    }

    pub fn roaming_disabled(&self) -> bool {
        self.roaming_disabled
    }

    pub fn endpoints(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.peers.iter().filter_map(|p| p.endpoint)
    }

    pub fn states(&self) -> Vec<PeerState> {
        self.peers.iter().map(Peer::state).collect()
    }
}

/// Destination address of an IPv4 or IPv6 packet.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
