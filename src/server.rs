//! The packet dispatcher.
//!
//! A single task owns the UDP socket and all mutable state: it blocks on
//! the socket with a one second timeout, classifies each datagram, drives
//! the per-node login state machine and the per-talkgroup ownership rules,
//! and runs the housekeeping sweep when its interval elapses. Parrot
//! playback is the only work handed to other tasks, and each playback owns
//! its buffer outright, so no locks guard the registry.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::ident;
use crate::packet::{self, DmrdFrame, Packet};
use crate::parrot::{self, ParrotCapture, MAX_CAPTURE_SECS};
use crate::state::{State, NODE_IDLE_SECS, SCANNER_TG, UNSUBSCRIBE_ALL_TG};
use crate::status;

/// A talkgroup owner silent this long forfeits the stream.
const OWNER_TIMEOUT_MS: u64 = 1500;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The MMDVM relay server.
///
/// # Examples
///
/// ```no_run
/// use dmrelay::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default().with_port(62031);
/// let server = Server::bind(config).await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    socket: Arc<UdpSocket>,
    clock: Clock,
    state: State,
    last_housekeeping_sec: u64,
}

impl Server {
    /// Binds the UDP socket and prepares the relay state.
    ///
    /// The socket gets `SO_REUSEADDR` and `SO_BROADCAST` before it is
    /// handed to tokio. Failure to bind is fatal and bubbles up to the
    /// caller. The configured extra talkgroups are opened here, alongside
    /// the scanner and TAC groups the state always carries.
    pub async fn bind(config: Config) -> Result<Self> {
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, config.general.udp_port).into();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        info!("Listening on {}", socket.local_addr()?);

        let mut state = State::new();
        for &tg in &config.general.talkgroups {
            state.find_group(tg, true);
        }

        Ok(Self {
            config,
            socket: Arc::new(socket),
            clock: Clock::start(),
            state,
            last_housekeeping_sec: 0,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the dispatcher loop. Never returns under normal operation.
    pub async fn run(mut self) -> Result<()> {
        let housekeeping_secs = self.config.general.housekeeping_minutes * 60;
        let mut buf = [0u8; 1024];
        loop {
            match time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, addr))) => {
                    self.handle_packet(addr, &mut buf[..len]).await;
                }
                Ok(Err(e)) => {
                    warn!("recv error: {}", e);
                    time::sleep(RECV_ERROR_BACKOFF).await;
                }
                Err(_) => {} // timeout, fall through to housekeeping
            }

            let now_sec = self.clock.now_sec();
            if now_sec.saturating_sub(self.last_housekeeping_sec) >= housekeeping_secs {
                self.housekeeping(now_sec);
                self.last_housekeeping_sec = now_sec;
            }
        }
    }

    async fn handle_packet(&mut self, addr: SocketAddr, pk: &mut [u8]) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("RX {} {} bytes: {}", addr, pk.len(), packet::hex_dump(pk));
        }
        match packet::classify(pk) {
            Some(Packet::Voice(frame)) => self.handle_voice(addr, pk, frame).await,
            Some(Packet::Login { nodeid }) => self.handle_login(addr, nodeid).await,
            Some(Packet::Key { nodeid, digest }) => self.handle_key(addr, nodeid, digest).await,
            Some(Packet::Description { nodeid }) => self.handle_description(addr, nodeid).await,
            Some(Packet::Ping { nodeid }) => self.handle_ping(addr, nodeid).await,
            Some(Packet::Close { nodeid }) => self.handle_close(addr, nodeid).await,
            Some(Packet::Status) => self.handle_status(addr).await,
            None => debug!("Dropping unrecognized {} byte packet from {}", pk.len(), addr),
        }
    }

    /// RPTL: start (or restart) the login handshake.
    ///
    /// The node goes back to the challenged state with a fresh salt; only
    /// the following RPTK can (re)authenticate it. A login for a node that
    /// is authenticated at a different IP is rejected outright.
    async fn handle_login(&mut self, addr: SocketAddr, nodeid: u32) {
        info!("RPTL node {} from {}", nodeid, addr);
        if let Some(node) = self.state.find_or_create_node(nodeid, false) {
            if node.authenticated {
                if let Some(locked) = node.addr {
                    if locked.ip() != addr.ip() {
                        warn!("Node {} already logged in at {}", nodeid, locked);
                        return;
                    }
                }
            }
        }
        let now_sec = self.clock.now_sec();
        let salt = match self.state.find_or_create_node(nodeid, true) {
            Some(node) => {
                node.last_seen_sec = now_sec;
                if node.addr.is_none() {
                    node.addr = Some(addr);
                }
                node.salt = rand::random();
                node.authenticated = false;
                node.salt
            }
            None => {
                warn!("RPTL node {} out of range", nodeid);
                return;
            }
        };
        self.send(addr, &packet::login_ack(salt)).await;
    }

    /// RPTK: verify `SHA256(salt ‖ password)` against the client's digest.
    async fn handle_key(&mut self, addr: SocketAddr, nodeid: u32, digest: [u8; 32]) {
        info!("RPTK node {} from {}", nodeid, addr);
        let now_sec = self.clock.now_sec();
        let password = self.config.password_bytes();
        enum Outcome {
            Missing,
            WrongAddr,
            Ack,
            Nak,
        }
        let outcome = match self.state.find_or_create_node(nodeid, false) {
            None => Outcome::Missing,
            Some(node) => {
                if node.addr.map(|a| a.ip()) != Some(addr.ip()) {
                    Outcome::WrongAddr
                } else {
                    node.last_seen_sec = now_sec;
                    if !node.authenticated && auth_digest(&node.salt, password) == digest {
                        node.authenticated = true;
                        node.addr = Some(addr);
                    }
                    if node.authenticated {
                        Outcome::Ack
                    } else {
                        Outcome::Nak
                    }
                }
            }
        };
        match outcome {
            Outcome::Missing => warn!("Node {} not found for RPTK", nodeid),
            Outcome::WrongAddr => {
                warn!("Invalid RPTK address {} for node {}", addr, nodeid);
                self.send(addr, &packet::nak(nodeid)).await;
            }
            Outcome::Ack => self.send(addr, &packet::ack(nodeid)).await,
            Outcome::Nak => {
                warn!("Authentication failed for node {}", nodeid);
                self.send(addr, &packet::nak(nodeid)).await;
            }
        }
    }

    /// RPTC: callsign, location and so on. Acknowledged but not stored.
    async fn handle_description(&mut self, addr: SocketAddr, nodeid: u32) {
        info!("RPTC node {} from {}", nodeid, addr);
        let now_sec = self.clock.now_sec();
        let accepted = match self.state.find_or_create_node(nodeid, false) {
            Some(node) if node.addr.map(|a| a.ip()) == Some(addr.ip()) => {
                node.last_seen_sec = now_sec;
                true
            }
            Some(_) => {
                warn!("Invalid RPTC address {} for node {}", addr, nodeid);
                false
            }
            None => {
                warn!("Node {} not found for RPTC", nodeid);
                false
            }
        };
        if accepted {
            self.send(addr, &packet::ack(nodeid)).await;
        }
    }

    async fn handle_ping(&mut self, addr: SocketAddr, nodeid: u32) {
        let now_sec = self.clock.now_sec();
        let alive = match self.state.find_or_create_node(nodeid, false) {
            Some(node)
                if node.authenticated && node.addr.map(|a| a.ip()) == Some(addr.ip()) =>
            {
                node.last_seen_sec = now_sec;
                true
            }
            _ => false,
        };
        if alive {
            self.send(addr, &packet::pong(nodeid)).await;
        } else {
            self.send(addr, &packet::nak(nodeid)).await;
        }
    }

    /// RPTCL: the node asks to be forgotten. Only honoured from its own IP.
    async fn handle_close(&mut self, addr: SocketAddr, nodeid: u32) {
        info!("RPTCL node {} from {}", nodeid, addr);
        let ip_ok = self
            .state
            .node(nodeid)
            .map(|node| node.addr.map(|a| a.ip()) == Some(addr.ip()));
        match ip_ok {
            Some(true) => self.state.delete_node(nodeid),
            Some(false) => warn!("Invalid RPTCL address {} for node {}", addr, nodeid),
            None => warn!("Node {} doesn't exist for RPTCL", nodeid),
        }
    }

    async fn handle_status(&mut self, addr: SocketAddr) {
        let dump = status::render(&self.state, &self.clock);
        self.send(addr, dump.as_bytes()).await;
    }

    async fn handle_voice(&mut self, addr: SocketAddr, pk: &mut [u8], frame: DmrdFrame) {
        let slotid = frame.slotid();
        debug!(
            "DMRD {} radio {} dst {} stream {:08X} flags {:02X}",
            ident::display(slotid),
            frame.radioid,
            frame.dst,
            frame.streamid,
            frame.flags
        );

        let now_sec = self.clock.now_sec();
        match self.state.find_or_create_node(frame.nodeid, true) {
            Some(node) => {
                if !node.authenticated {
                    warn!("Node {} not authenticated for DMRD", frame.nodeid);
                    return;
                }
                if node.addr.map(|a| a.ip()) != Some(addr.ip()) {
                    warn!("Node {} invalid address {} for DMRD", frame.nodeid, addr);
                    return;
                }
                node.addr = Some(addr);
                node.last_seen_sec = now_sec;
            }
            None => {
                warn!("Slot {} not found for DMRD", ident::display(slotid));
                return;
            }
        }
        self.state.record_radio_slot(frame.radioid, slotid);

        if frame.dst == UNSUBSCRIBE_ALL_TG {
            if frame.is_stream_start() {
                info!("Unsubscribe all, slot {}", ident::display(slotid));
                self.state.unsubscribe(slotid);
            }
            return;
        }

        if frame.is_private() {
            if frame.dst == frame.radioid {
                self.handle_parrot(pk, &frame, slotid).await;
            } else {
                self.handle_private_call(pk, &frame, slotid).await;
            }
            return;
        }

        self.handle_group_call(pk, &frame, slotid).await;
    }

    /// Private call to the radio's own ID: capture now, echo back later.
    async fn handle_parrot(&mut self, pk: &[u8], frame: &DmrdFrame, slotid: u32) {
        let now_sec = self.clock.now_sec();

        if frame.is_stream_end() {
            info!("Parrot stream end on slot {}", ident::display(slotid));
            let capture = match self.state.find_slot(slotid, false) {
                Some(slot) => slot.parrot.take(),
                None => return,
            };
            if let Some(mut capture) = capture {
                capture.push(pk);
                let dest = self.state.node(slotid).and_then(|n| n.addr);
                if let Some(dest) = dest {
                    parrot::spawn_playback(Arc::clone(&self.socket), dest, capture);
                }
            }
            return;
        }

        if frame.is_stream_start() {
            info!("Parrot stream start on slot {}", ident::display(slotid));
            self.state.unsubscribe(slotid);
            // Pi-Star repeats the start frame (flags 0xE1), so a capture may
            // already be running; only the first start allocates.
            if let Some(slot) = self.state.find_slot(slotid, false) {
                if slot.parrot.is_none() {
                    slot.parrot = Some(ParrotCapture::new(now_sec));
                    slot.parrot_seq = slot.parrot_seq.wrapping_add(1);
                }
            }
        }

        if let Some(slot) = self.state.find_slot(slotid, false) {
            if let Some(capture) = slot.parrot.as_mut() {
                if now_sec.saturating_sub(capture.start_sec()) < MAX_CAPTURE_SECS {
                    capture.push(pk);
                }
            }
        }
    }

    /// Private radio-to-radio call: relay to wherever the destination
    /// radio was last heard.
    async fn handle_private_call(&mut self, pk: &mut [u8], frame: &DmrdFrame, slotid: u32) {
        self.state.unsubscribe(slotid);

        let boundary = frame.is_stream_start() || frame.is_stream_end();
        if frame.is_stream_start() {
            info!("Private stream start, radio {} to {}", frame.radioid, frame.dst);
        } else if frame.is_stream_end() {
            info!("Private stream end, radio {} to {}", frame.radioid, frame.dst);
        }

        if !ident::dmrid_in_range(frame.dst) {
            if boundary {
                warn!("Private call destination {} out of range", frame.dst);
            }
            return;
        }
        let dest_slotid = match self.state.radio_slot_of(frame.dst) {
            Some(dest_slotid) => dest_slotid,
            None => {
                if boundary {
                    warn!("Private call destination {} never heard", frame.dst);
                }
                return;
            }
        };
        match self.state.node(dest_slotid).and_then(|n| n.addr) {
            Some(dest) => {
                if boundary {
                    info!(
                        "Private call dest slot {} found for radio {}",
                        ident::display(dest_slotid),
                        frame.dst
                    );
                }
                packet::set_dest_slot(pk, ident::slot_index(dest_slotid));
                self.send(dest, pk).await;
            }
            None => {
                if boundary {
                    warn!(
                        "Private call dest slot {} not found for radio {}",
                        ident::display(dest_slotid),
                        frame.dst
                    );
                }
            }
        }
    }

    /// Talkgroup call: subscribe the slot, arbitrate stream ownership, fan
    /// the frame out, and mirror everything into the scanner group.
    async fn handle_group_call(&mut self, pk: &mut [u8], frame: &DmrdFrame, slotid: u32) {
        let tg = frame.dst;
        if self.state.group(tg).is_none() {
            if frame.is_stream_start() {
                warn!("Node {} keyup on non-existent group {}", frame.nodeid, tg);
            }
            self.state.unsubscribe(slotid);
            return;
        }

        let current_tg = self.state.slot(slotid).map(|s| s.tg).unwrap_or(0);
        if current_tg != tg {
            self.state.subscribe(slotid, tg);
        }

        // The scanner never runs a stream of its own; keying it up only
        // subscribes. Its traffic comes from the mirror below.
        if tg == SCANNER_TG {
            return;
        }

        let now_ms = self.clock.now_ms();
        let owns = match self.state.find_group(tg, false) {
            Some(group) => {
                if group.owner_slotid != 0
                    && now_ms.saturating_sub(group.last_packet_ms) >= OWNER_TIMEOUT_MS
                {
                    info!("Timeout group {}, slot {}", tg, ident::display(group.owner_slotid));
                    group.owner_slotid = 0;
                }
                if frame.is_stream_start() && group.owner_slotid == 0 {
                    info!("Take group {}, slot {}", tg, ident::display(slotid));
                    group.owner_slotid = slotid;
                    group.last_packet_ms = now_ms;
                } else if frame.is_stream_end() && group.owner_slotid == slotid {
                    info!("Drop group {}, slot {}", tg, ident::display(slotid));
                    group.owner_slotid = 0;
                }
                let owns = group.owner_slotid == slotid;
                if owns {
                    group.last_packet_ms = now_ms;
                }
                owns
            }
            None => false,
        };
        if owns {
            for (dest, dest_slotid) in self.state.fanout_targets(tg, slotid) {
                packet::set_dest_slot(pk, ident::slot_index(dest_slotid));
                self.send(dest, pk).await;
            }
        }

        // Scanner mirror: the same ownership rules, but fan-out does not
        // exclude the sender (scanner subscribers are different radios by
        // definition).
        let owns_scanner = match self.state.find_group(SCANNER_TG, false) {
            Some(scanner) => {
                if scanner.owner_slotid != 0
                    && now_ms.saturating_sub(scanner.last_packet_ms) >= OWNER_TIMEOUT_MS
                {
                    info!("Timeout scanner, slot {}", ident::display(scanner.owner_slotid));
                    scanner.owner_slotid = 0;
                }
                if scanner.owner_slotid == slotid && frame.is_stream_end() {
                    info!("Drop scanner, slot {}", ident::display(slotid));
                    scanner.owner_slotid = 0;
                }
                if scanner.owner_slotid == 0 && !frame.is_stream_end() {
                    info!("Take scanner, slot {}", ident::display(slotid));
                    scanner.owner_slotid = slotid;
                    scanner.last_packet_ms = now_ms;
                }
                let owns = scanner.owner_slotid == slotid;
                if owns {
                    scanner.last_packet_ms = now_ms;
                }
                owns
            }
            None => false,
        };
        if owns_scanner {
            for (dest, dest_slotid) in self.state.fanout_targets(SCANNER_TG, 0) {
                packet::set_dest_slot(pk, ident::slot_index(dest_slotid));
                self.send(dest, pk).await;
            }
        }
    }

    /// Deletes every node that went silent. Candidates are collected
    /// before any deletion so the sweep never invalidates its own walk.
    fn housekeeping(&mut self, now_sec: u64) {
        let idle = self.state.idle_node_ids(now_sec, NODE_IDLE_SECS);
        let dropped = idle.len();
        for nodeid in idle {
            self.state.delete_node(nodeid);
        }
        info!(
            "Housekeeping at {}s: {} active nodes, {} dropped",
            now_sec,
            self.state.node_count(),
            dropped
        );
    }

    /// Best-effort send; failures only show up in the debug trace.
    async fn send(&self, dest: SocketAddr, pk: &[u8]) {
        debug!("TX {} {} bytes", dest, pk.len());
        if let Err(e) = self.socket.send_to(pk, dest).await {
            debug!("Send to {} failed: {}", dest, e);
        }
    }
}

/// Digest the client must present: `SHA256(salt ‖ password)`, with the
/// salt bytes exactly as they appeared in the RPTACK reply.
fn auth_digest(salt: &[u8; 4], password: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_digest_matches_reference() {
        // SHA256("\x01\x02\x03\x04" || "passw0rd"), reference value from
        // an external sha256 implementation
        let expected = [
            0x3B, 0xEE, 0x14, 0xFF, 0xD8, 0xE5, 0xCF, 0xE5, 0x8A, 0x54, 0xE3, 0x42, 0x0B, 0x82,
            0x65, 0x56, 0xC4, 0xA5, 0x85, 0xFB, 0x37, 0x47, 0x4E, 0xD2, 0x8D, 0xB2, 0xF6, 0x53,
            0xF3, 0x03, 0x21, 0x3D,
        ];
        assert_eq!(auth_digest(&[1, 2, 3, 4], b"passw0rd"), expected);
    }

    #[test]
    fn test_auth_digest_depends_on_salt() {
        let a = auth_digest(&[0; 4], b"passw0rd");
        let b = auth_digest(&[1, 0, 0, 0], b"passw0rd");
        assert_ne!(a, b);
    }
}
