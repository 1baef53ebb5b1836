//! In-memory audio backend with a manually driven clock.
//!
//! `ManualAudioContext` records installs and scheduled buffers and renders
//! its output tap only when the clock is advanced; `ManualMicrophone` lets
//! the caller push frames as if they came from a device callback.

use crate::capture::{FrameSink, InputStream, Microphone};
use crate::context::{AudioContext, ContextId, ScheduledBuffer, UnitTable};
use crate::error::{AudioError, Result};
use crate::port::UnitPort;
use crate::units::{AudioUnit, BlockProcessor, UnitSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;

/// Audio context whose clock only moves when [`advance`](Self::advance) is called.
pub struct ManualAudioContext {
    id: ContextId,
    sample_rate: u32,
    frames: AtomicU64,
    running: AtomicBool,
    units: UnitTable,
    installs: AtomicUsize,
    failing_units: Mutex<HashSet<String>>,
    resume_error: Mutex<Option<AudioError>>,
    active: Mutex<Vec<ScheduledBuffer>>,
    history: Mutex<Vec<ScheduledBuffer>>,
    cancelled: AtomicUsize,
    tap: Mutex<Option<BlockProcessor>>,
}

impl ManualAudioContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            id: ContextId::next(),
            sample_rate,
            frames: AtomicU64::new(0),
            running: AtomicBool::new(false),
            units: UnitTable::new(),
            installs: AtomicUsize::new(0),
            failing_units: Mutex::new(HashSet::new()),
            resume_error: Mutex::new(None),
            active: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
            tap: Mutex::new(None),
        }
    }

    /// Make every install of `unit` fail until [`heal_unit`](Self::heal_unit).
    pub fn fail_unit(&self, unit: &str) {
        self.failing_units.lock().insert(unit.to_string());
    }

    /// Let installs of `unit` succeed again.
    pub fn heal_unit(&self, unit: &str) {
        self.failing_units.lock().remove(unit);
    }

    /// Make the next `resume` calls fail with `error`.
    pub fn fail_resume(&self, error: AudioError) {
        *self.resume_error.lock() = Some(error);
    }

    /// Number of install calls that reached this context.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Every buffer ever scheduled, in submission order.
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.history.lock().clone()
    }

    /// Buffers still waiting to finish playing.
    pub fn pending(&self) -> Vec<ScheduledBuffer> {
        self.active.lock().clone()
    }

    /// Total buffers dropped by `cancel_scheduled`.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether an output tap is attached.
    pub fn has_output_tap(&self) -> bool {
        self.tap.lock().is_some()
    }

    /// Move the clock forward by `seconds`, rendering the output tap over
    /// the covered span and retiring finished buffers.
    pub fn advance(&self, seconds: f64) {
        let start = self.frames.load(Ordering::SeqCst);
        let count = (seconds * self.sample_rate as f64).round() as u64;
        let end = start + count;

        if let Some(tap) = self.tap.lock().as_mut() {
            let active = self.active.lock();
            let rate = self.sample_rate as f64;
            for frame in start..end {
                let t = frame as f64 / rate;
                let mut value = 0.0f32;
                for buffer in active.iter() {
                    if t >= buffer.start && t < buffer.end() {
                        let index = ((t - buffer.start) * rate) as usize;
                        value += buffer.samples.get(index).copied().unwrap_or(0.0);
                    }
                }
                tap.push_sample(value);
            }
        }

        self.frames.store(end, Ordering::SeqCst);
        let now = self.current_time();
        self.active.lock().retain(|b| b.end() > now);
    }
}

impl std::fmt::Debug for ManualAudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualAudioContext")
            .field("id", &self.id)
            .field("time", &self.current_time())
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl AudioContext for ManualAudioContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<()> {
        if let Some(err) = self.resume_error.lock().clone() {
            return Err(err);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn install_unit(&self, source: &UnitSource) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.failing_units.lock().contains(source.name()) {
            return Err(AudioError::load(source.name(), "install rejected by context"));
        }
        self.units.install(source);
        Ok(())
    }

    fn create_unit(&self, name: &str) -> Result<Box<dyn AudioUnit>> {
        self.units.create(name, self.sample_rate)
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> Result<()> {
        self.history.lock().push(buffer.clone());
        self.active.lock().push(buffer);
        Ok(())
    }

    fn cancel_scheduled(&self) -> usize {
        let now = self.current_time();
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|b| b.end() <= now);
        let cancelled = before - active.len();
        self.cancelled.fetch_add(cancelled, Ordering::SeqCst);
        cancelled
    }

    fn attach_output_tap(&self, unit: Box<dyn AudioUnit>, port: UnitPort) -> Result<()> {
        *self.tap.lock() = Some(BlockProcessor::new(vec![unit], port));
        Ok(())
    }

    fn detach_output_tap(&self) {
        self.tap.lock().take();
    }
}

/// Microphone fed by the caller instead of a device.
pub struct ManualMicrophone {
    sink: Arc<Mutex<Option<FrameSink>>>,
    active: Arc<AtomicBool>,
    opens: AtomicUsize,
    gate: watch::Sender<bool>,
    open_error: Mutex<Option<AudioError>>,
}

impl ManualMicrophone {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            sink: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            opens: AtomicUsize::new(0),
            gate,
            open_error: Mutex::new(None),
        }
    }

    /// Block subsequent `open` calls until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let pending and future `open` calls proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Make subsequent `open` calls fail with `error`.
    pub fn fail_open(&self, error: AudioError) {
        *self.open_error.lock() = Some(error);
    }

    /// Deliver frames as the device callback would. Ignored while closed.
    pub fn feed(&self, frames: &[f32]) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink(frames);
        }
    }

    /// Whether a stream is currently open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for ManualMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Microphone for ManualMicrophone {
    async fn open(&self, _sample_rate: u32, sink: FrameSink) -> Result<Box<dyn InputStream>> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await.map_err(|_| AudioError::device("microphone gate closed"))?;

        if let Some(err) = self.open_error.lock().clone() {
            return Err(err);
        }

        *self.sink.lock() = Some(sink);
        self.active.store(true, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualInputStream { sink: self.sink.clone(), active: self.active.clone() }))
    }
}

struct ManualInputStream {
    sink: Arc<Mutex<Option<FrameSink>>>,
    active: Arc<AtomicBool>,
}

impl InputStream for ManualInputStream {
    fn stop(&mut self) {
        self.sink.lock().take();
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ManualInputStream {
    fn drop(&mut self) {
        self.stop();
    }
}
