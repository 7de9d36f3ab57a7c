//! Status responder and query client.
//!
//! A datagram starting with `/STAT` gets a human-readable dump of the node
//! registry in reply. The query side is what `-s` uses: it asks a locally
//! running server and prints the answer. There is no authentication on
//! this path; it is meant for loopback use only.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::state::State;

/// Replies longer than this are truncated.
pub const MAX_STATUS_BYTES: usize = 500;

/// Source port the status query binds.
pub const QUERY_PORT: u16 = 62111;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Renders the registry dump sent in reply to `/STAT`.
pub fn render(state: &State, clock: &Clock) -> String {
    let mut out = format!("sec {} tick {}\n", clock.now_sec(), clock.now_ms());
    for node in state.nodes() {
        let addr = node
            .addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{} id {} dmrid {} auth {} sec {}\n",
            addr, node.nodeid, node.dmrid, node.authenticated as u8, node.last_seen_sec
        ));
        for (index, slot) in node.slots.iter().enumerate() {
            if slot.tg != 0 {
                out.push_str(&format!("\tS{} TG {}\n", index + 1, slot.tg));
            }
        }
    }
    for (dmrid, slotid) in state.radio_slots() {
        out.push_str(&format!("radio {} slotid {}\n", dmrid, slotid));
    }
    if out.len() > MAX_STATUS_BYTES {
        let mut end = MAX_STATUS_BYTES;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Sends `/STAT` to a locally running server and returns the reply.
pub async fn query(port: u16) -> Result<String> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, QUERY_PORT)).await?;
    let server: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
    socket.send_to(b"/STAT", server).await?;
    let mut buf = [0u8; 1024];
    match time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Ok(String::from_utf8_lossy(&buf[..len]).into_owned()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout("no reply from server".to_string())),
    }
}
