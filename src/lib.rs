//! dmrelay - a Pi-Star compatible MMDVM DMR relay server
//!
//! This library implements the MMDVM "home-brew repeater" protocol spoken by
//! Pi-Star-class hotspots. Hotspots log in over UDP, authenticate with a
//! salted SHA-256 challenge, subscribe to talkgroups by keying up, and
//! exchange 55-byte DMR voice frames which the server fans out to every
//! subscriber of the active talkgroup.
//!
//! # Features
//!
//! - Challenge-response login (RPTL / RPTK) with address lockout
//! - Talkgroup subscription, stream ownership arbitration and fan-out
//! - Scanner talkgroup (TG 777) mirroring all active streams
//! - Private radio-to-radio calls and a "parrot" self-echo test loop
//! - Periodic eviction of silent nodes
//! - Asynchronous I/O using tokio

pub mod clock;
pub mod config;
pub mod error;
pub mod ident;
pub mod packet;
pub mod parrot;
pub mod server;
pub mod state;
pub mod status;

pub use clock::Clock;
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
pub use state::State;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
