//! Parrot capture and playback.
//!
//! A private call to the radio's own ID turns the server into a parrot:
//! the stream is captured into memory and echoed back to the node once the
//! transmission ends. Playback runs on its own task which takes ownership
//! of the detached buffer, so the dispatcher never waits on it and several
//! parrots can play concurrently for different nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;
use tokio::time;

use crate::packet::DMRD_LEN;

/// A capture stops accepting frames this long after it started.
pub const MAX_CAPTURE_SECS: u64 = 6;

const PLAYBACK_DELAY: Duration = Duration::from_secs(1);
const FRAME_GAP: Duration = Duration::from_millis(20);

/// An in-memory recording of one parrot stream.
#[derive(Debug)]
pub struct ParrotCapture {
    frames: Vec<[u8; DMRD_LEN]>,
    start_sec: u64,
}

impl ParrotCapture {
    /// Creates an empty capture stamped with the start second.
    pub fn new(start_sec: u64) -> Self {
        Self {
            frames: Vec::new(),
            start_sec,
        }
    }

    /// Second the capture started, used to enforce the duration cap.
    pub fn start_sec(&self) -> u64 {
        self.start_sec
    }

    /// Appends a voice frame. Anything that is not exactly one DMRD frame
    /// is ignored.
    pub fn push(&mut self, frame: &[u8]) {
        if let Ok(frame) = <[u8; DMRD_LEN]>::try_from(frame) {
            self.frames.push(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Spawns a task that echoes a finished capture back to the node.
///
/// Frames go out in capture order after a one second delay, paced 20 ms
/// apart, best-effort. The task owns the capture and drops it when done.
pub fn spawn_playback(socket: Arc<UdpSocket>, dest: SocketAddr, capture: ParrotCapture) {
    tokio::spawn(async move {
        debug!("Parrot playback of {} frames to {}", capture.len(), dest);
        time::sleep(PLAYBACK_DELAY).await;
        for frame in &capture.frames {
            if let Err(e) = socket.send_to(frame, dest).await {
                debug!("Parrot send to {} failed: {}", dest, e);
            }
            time::sleep(FRAME_GAP).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_keeps_frame_order() {
        let mut capture = ParrotCapture::new(10);
        for i in 0..4u8 {
            let mut frame = [0u8; DMRD_LEN];
            frame[4] = i;
            capture.push(&frame);
        }
        assert_eq!(capture.len(), 4);
        assert_eq!(capture.start_sec(), 10);
        for (i, frame) in capture.frames.iter().enumerate() {
            assert_eq!(frame[4], i as u8);
        }
    }

    #[test]
    fn test_capture_rejects_odd_sizes() {
        let mut capture = ParrotCapture::new(0);
        capture.push(&[0u8; 54]);
        capture.push(&[0u8; 56]);
        assert!(capture.is_empty());
    }
}
