//! # vox-telemetry
//!
//! Structured logging for Vox using `tracing`.
//!
//! ## Usage
//!
//! ```rust
//! use vox_telemetry::{init_telemetry, info};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_telemetry("vox")?;
//!     info!(model = "gemini-live", "Connecting");
//!     Ok(())
//! }
//! ```
//!
//! Verbosity follows `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=vox_realtime=debug,vox_audio=trace`.

pub mod init;
pub mod spans;

// Re-export tracing macros for convenience
pub use tracing::{Instrument, Span, debug, error, info, instrument, trace, warn};

pub use init::{TelemetryError, init_json_telemetry, init_telemetry};
pub use spans::*;
