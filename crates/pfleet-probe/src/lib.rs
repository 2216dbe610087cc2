//! pfleet probe - PPTP control-port testing
//!
//! Judges remote PPTP nodes without building a data tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   TCP/1723    ┌───────────────┐
//! │ ProtocolTester   │──────────────▶│  PPTP node    │
//! │                  │  SCCRQ ──▶    │               │
//! │  ping_light      │  ◀── SCCRP    │               │
//! │  ping_auth       │  OCRQ  ──▶    │               │
//! │  speed_estimate  │  ◀── OCRP     │               │
//! └──────────────────┘               └───────────────┘
//! ```
//!
//! The tester holds no per-node state; any number of probes can run
//! against different nodes at once.

mod config;
mod error;
pub mod pptp;
mod speed;
mod tester;

pub use config::{ProbeConfig, ProbeConfigError};
pub use error::{ProbeError, ProbeErrorKind};
pub use speed::{SpeedResult, download_factor, jitter};
pub use tester::{PingResult, ProtocolTester};
