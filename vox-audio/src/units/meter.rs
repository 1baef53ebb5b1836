use super::AudioUnit;
use crate::port::{UnitMessage, UnitPort};

/// Name under which the volume meter is installed.
pub const METER_UNIT: &str = "vu-meter";

/// Decay applied to the held level on every block.
const DECAY: f32 = 0.95;

/// Reporting period in milliseconds (~40 Hz).
const REPORT_INTERVAL_MS: u32 = 25;

/// RMS level meter with exponential decay, reporting at a fixed cadence.
#[derive(Debug)]
pub struct VuMeter {
    level: f32,
    samples_per_report: usize,
    since_report: usize,
}

impl VuMeter {
    pub fn new(sample_rate: u32) -> Self {
        let samples_per_report = (sample_rate * REPORT_INTERVAL_MS / 1000).max(1) as usize;
        Self { level: 0.0, samples_per_report, since_report: 0 }
    }

    /// Current held level.
    pub fn level(&self) -> f32 {
        self.level
    }
}

impl AudioUnit for VuMeter {
    fn process(&mut self, block: &[f32], port: &mut UnitPort) {
        if block.is_empty() {
            return;
        }
        let sum: f32 = block.iter().map(|s| s * s).sum();
        let rms = (sum / block.len() as f32).sqrt();
        self.level = rms.max(self.level * DECAY).min(1.0);

        self.since_report += block.len();
        if self.since_report >= self.samples_per_report {
            self.since_report = 0;
            port.post(UnitMessage::Volume(self.level));
        }
    }
}
