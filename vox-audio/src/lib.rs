//! # vox-audio
//!
//! Microphone capture and low-latency playback for live voice sessions.
//!
//! Two execution domains meet in this crate:
//!
//! - the **real-time audio thread**, where [`AudioUnit`]s process fixed
//!   128-sample blocks and never block or allocate, and
//! - the **event loop**, where everything else runs as async tasks.
//!
//! Units talk to the event loop through a wait-free SPSC ring ([`port`]).
//!
//! ```text
//!   microphone ──► [pcm16-encoder] ──┐            ┌──► base64 blocks (CapturePipeline)
//!                  [vu-meter]     ───┼─► ring ──►─┤
//!                                    │            └──► input volume
//!
//!   network PCM16 ──► PlaybackPipeline ──► scheduled buffers ──► AudioContext
//!                                              [vu-meter] ◄── output tap ──┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vox_audio::{PlaybackPipeline, PlaybackOptions, UnitLoader};
//! use vox_audio::desktop::CpalAudioContext;
//!
//! let context = Arc::new(CpalAudioContext::new(24_000));
//! let playback = PlaybackPipeline::new(context, UnitLoader::shared(), PlaybackOptions::default());
//! playback.resume().await?;
//! playback.add_pcm16(&bytes_from_network);
//! ```

pub mod capture;
pub mod context;
pub mod error;
pub mod format;
pub mod loader;
pub mod playback;
pub mod port;
pub mod testing;
pub mod units;

#[cfg(feature = "desktop-audio")]
pub mod desktop;

pub use capture::{CaptureEvent, CaptureOptions, CapturePipeline, InputStream, Microphone};
pub use context::{AudioContext, ContextId, ScheduledBuffer};
pub use error::{AudioError, Result};
pub use format::{AudioBlock, AudioFormat, SmartAudioBuffer};
pub use loader::UnitLoader;
pub use playback::{PlaybackOptions, PlaybackPipeline};
pub use port::{PortReceiver, UnitMessage, UnitPort};
pub use units::{AudioUnit, BLOCK_SIZE, BlockProcessor, UnitCatalog, UnitSource};
