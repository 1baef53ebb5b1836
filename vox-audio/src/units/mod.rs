//! Audio units: small processors that run inside a context's real-time callback.
//!
//! A unit is installed into an [`AudioContext`](crate::AudioContext) from its
//! [`UnitSource`], then instantiated per graph node. Processing happens in
//! fixed [`BLOCK_SIZE`] blocks; results leave through a [`UnitPort`].

mod encoder;
mod meter;

pub use encoder::{ENCODER_UNIT, Pcm16Encoder};
pub use meter::{METER_UNIT, VuMeter};

use crate::port::UnitPort;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of samples per render block.
pub const BLOCK_SIZE: usize = 128;

/// A processor invoked on the real-time thread once per render block.
///
/// Implementations must not block, lock, or allocate inside `process`.
pub trait AudioUnit: Send {
    /// Process one block of mono samples.
    fn process(&mut self, block: &[f32], port: &mut UnitPort);
}

type UnitFactory = dyn Fn(u32) -> Box<dyn AudioUnit> + Send + Sync;

/// Installable description of a unit: a name plus a constructor taking the sample rate.
#[derive(Clone)]
pub struct UnitSource {
    name: String,
    factory: Arc<UnitFactory>,
}

impl UnitSource {
    /// Create a new unit source.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn AudioUnit> + Send + Sync + 'static,
    {
        Self { name: name.into(), factory: Arc::new(factory) }
    }

    /// Unit name, unique within a catalog.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a fresh unit instance for a context running at `sample_rate`.
    pub fn instantiate(&self, sample_rate: u32) -> Box<dyn AudioUnit> {
        (self.factory)(sample_rate)
    }
}

impl std::fmt::Debug for UnitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSource").field("name", &self.name).finish()
    }
}

/// Named collection of unit sources the loader can install.
#[derive(Debug, Clone, Default)]
pub struct UnitCatalog {
    sources: HashMap<String, UnitSource>,
}

impl UnitCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in encoder and meter.
    pub fn builtin() -> Self {
        Self::new()
            .with(UnitSource::new(ENCODER_UNIT, |_| Box::new(Pcm16Encoder::new())))
            .with(UnitSource::new(METER_UNIT, |rate| Box::new(VuMeter::new(rate))))
    }

    /// Add or replace a source.
    pub fn with(mut self, source: UnitSource) -> Self {
        self.sources.insert(source.name.clone(), source);
        self
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Option<&UnitSource> {
        self.sources.get(name)
    }
}

/// Re-blocks arbitrarily sized device callbacks into [`BLOCK_SIZE`] blocks
/// and runs a chain of units over each block.
///
/// All storage is allocated up front; `push` is safe to call from a
/// real-time callback.
pub struct BlockProcessor {
    units: Vec<Box<dyn AudioUnit>>,
    port: UnitPort,
    block: [f32; BLOCK_SIZE],
    fill: usize,
}

impl BlockProcessor {
    /// Create a processor running `units` in order and posting to `port`.
    pub fn new(units: Vec<Box<dyn AudioUnit>>, port: UnitPort) -> Self {
        Self { units, port, block: [0.0; BLOCK_SIZE], fill: 0 }
    }

    /// Feed mono samples; every completed block is processed immediately.
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.push_sample(sample);
        }
    }

    /// Feed a single mono sample.
    #[inline]
    pub fn push_sample(&mut self, sample: f32) {
        self.block[self.fill] = sample;
        self.fill += 1;
        if self.fill == BLOCK_SIZE {
            for unit in self.units.iter_mut() {
                unit.process(&self.block, &mut self.port);
            }
            self.fill = 0;
        }
    }
}

impl std::fmt::Debug for BlockProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockProcessor")
            .field("units", &self.units.len())
            .field("fill", &self.fill)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{UnitMessage, port};

    struct CountingUnit;

    impl AudioUnit for CountingUnit {
        fn process(&mut self, block: &[f32], port: &mut UnitPort) {
            port.post(UnitMessage::Volume(block.len() as f32));
        }
    }

    #[test]
    fn test_block_processor_reblocks_uneven_input() {
        let (tx, mut rx) = port(16);
        let mut processor = BlockProcessor::new(vec![Box::new(CountingUnit)], tx);

        processor.push(&[0.0; 100]);
        assert!(rx.try_recv().is_none());
        processor.push(&[0.0; 200]);

        let mut blocks = 0;
        while let Some(UnitMessage::Volume(len)) = rx.try_recv() {
            assert_eq!(len as usize, BLOCK_SIZE);
            blocks += 1;
        }
        assert_eq!(blocks, 2);
    }

    #[test]
    fn test_builtin_catalog_has_encoder_and_meter() {
        let catalog = UnitCatalog::builtin();
        assert!(catalog.get(ENCODER_UNIT).is_some());
        assert!(catalog.get(METER_UNIT).is_some());
        assert!(catalog.get("reverb").is_none());
    }
}
