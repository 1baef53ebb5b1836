//! The audio-context seam: a device clock that units install into and
//! buffers are scheduled on.

use crate::error::{AudioError, Result};
use crate::port::UnitPort;
use crate::units::{AudioUnit, UnitSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of an audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A block of mono samples placed at an absolute time on a context's timeline.
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    /// Start time in seconds on the context clock.
    pub start: f64,
    /// Normalized samples.
    pub samples: Arc<[f32]>,
    /// Sample rate of `samples`.
    pub sample_rate: u32,
}

impl ScheduledBuffer {
    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Time at which the last sample finishes.
    pub fn end(&self) -> f64 {
        self.start + self.duration()
    }
}

/// An audio-processing context: owns a device clock, hosts installed units
/// and plays scheduled buffers.
#[async_trait]
pub trait AudioContext: Send + Sync {
    /// Identity used by the unit loader registry.
    fn id(&self) -> ContextId;

    /// Sample rate of the context timeline.
    fn sample_rate(&self) -> u32;

    /// Current position of the device clock in seconds.
    fn current_time(&self) -> f64;

    /// Whether the device clock is advancing.
    fn is_running(&self) -> bool;

    /// Start (or restart) the device. Must precede any audible output.
    async fn resume(&self) -> Result<()>;

    /// Install a unit so that [`create_unit`](Self::create_unit) can build it.
    async fn install_unit(&self, source: &UnitSource) -> Result<()>;

    /// Instantiate an installed unit.
    fn create_unit(&self, name: &str) -> Result<Box<dyn AudioUnit>>;

    /// Queue a buffer for output at `buffer.start`.
    fn schedule(&self, buffer: ScheduledBuffer) -> Result<()>;

    /// Drop every scheduled buffer that has not finished playing.
    /// Returns how many were cancelled.
    fn cancel_scheduled(&self) -> usize;

    /// Run `unit` over the rendered output signal, posting to `port`.
    /// Replaces any previous tap.
    fn attach_output_tap(&self, unit: Box<dyn AudioUnit>, port: UnitPort) -> Result<()>;

    /// Remove the output tap, if any.
    fn detach_output_tap(&self);
}

/// Installed-unit table shared by context implementations.
#[derive(Debug, Default)]
pub struct UnitTable {
    units: Mutex<HashMap<String, UnitSource>>,
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, source: &UnitSource) {
        self.units.lock().insert(source.name().to_string(), source.clone());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.lock().contains_key(name)
    }

    pub fn create(&self, name: &str, sample_rate: u32) -> Result<Box<dyn AudioUnit>> {
        let units = self.units.lock();
        let source = units.get(name).ok_or_else(|| AudioError::UnitNotInstalled(name.to_string()))?;
        Ok(source.instantiate(sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitCatalog;

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scheduled_buffer_end() {
        let buffer = ScheduledBuffer { start: 1.0, samples: vec![0.0; 12_000].into(), sample_rate: 24_000 };
        assert!((buffer.end() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_unit_table_requires_install() {
        let table = UnitTable::new();
        assert!(matches!(table.create("vu-meter", 24_000), Err(AudioError::UnitNotInstalled(_))));

        let catalog = UnitCatalog::builtin();
        table.install(catalog.get("vu-meter").unwrap());
        assert!(table.contains("vu-meter"));
        assert!(table.create("vu-meter", 24_000).is_ok());
    }
}
