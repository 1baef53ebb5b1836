//! Gapless playback of PCM16 streamed from the network.
//!
//! Bytes are decoded into fixed-size scheduling buffers. Full buffers queue
//! up and a pump hands them to the context a short horizon ahead of the
//! device clock, each starting exactly where the previous one ends.

use crate::context::{AudioContext, ScheduledBuffer};
use crate::error::Result;
use crate::format::{PLAYBACK_SAMPLE_RATE, pcm16_to_f32};
use crate::loader::UnitLoader;
use crate::port::{DEFAULT_PORT_CAPACITY, PortReceiver, UnitMessage, port};
use crate::units::METER_UNIT;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Playback tuning.
#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    /// Sample rate of incoming PCM16.
    pub sample_rate: u32,
    /// Samples per scheduling buffer (7680 = 0.32 s at 24 kHz).
    pub buffer_samples: usize,
    /// Delay before the first buffer of a fresh timeline, in seconds.
    pub initial_lead: f64,
    /// How far ahead of the clock buffers are handed to the context, in seconds.
    pub schedule_ahead: f64,
    /// Pump period.
    pub tick: Duration,
    /// Run the output VU meter.
    pub metering: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            buffer_samples: 7680,
            initial_lead: 0.1,
            schedule_ahead: 0.2,
            tick: Duration::from_millis(25),
            metering: true,
        }
    }
}

/// Timeline bookkeeping, independent of any device.
#[derive(Debug)]
struct Scheduler {
    sample_rate: u32,
    buffer_samples: usize,
    initial_lead: f64,
    schedule_ahead: f64,
    filling: Vec<f32>,
    queue: VecDeque<Arc<[f32]>>,
    carry: Option<u8>,
    playing: bool,
    scheduled_time: f64,
}

impl Scheduler {
    fn new(options: &PlaybackOptions) -> Self {
        let buffer_samples = options.buffer_samples.max(1);
        Self {
            sample_rate: options.sample_rate,
            buffer_samples,
            initial_lead: options.initial_lead,
            schedule_ahead: options.schedule_ahead,
            filling: Vec::with_capacity(buffer_samples),
            queue: VecDeque::new(),
            carry: None,
            playing: false,
            scheduled_time: 0.0,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let mut rest = bytes;

        // A sample split across two network blocks.
        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    self.push_sample(pcm16_to_f32(i16::from_le_bytes([low, high])));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        for pair in pairs.by_ref() {
            self.push_sample(pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])));
        }
        self.carry = pairs.remainder().first().copied();
    }

    fn push_sample(&mut self, sample: f32) {
        self.filling.push(sample);
        if self.filling.len() == self.buffer_samples {
            self.seal();
        }
    }

    fn seal(&mut self) {
        let full = std::mem::replace(&mut self.filling, Vec::with_capacity(self.buffer_samples));
        self.queue.push_back(full.into());
    }

    fn flush(&mut self) {
        if !self.filling.is_empty() {
            self.seal();
        }
    }

    /// Pop every queued buffer that must start before `now + schedule_ahead`.
    fn drain_due(&mut self, now: f64) -> Vec<ScheduledBuffer> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        if !self.playing {
            self.playing = true;
            self.scheduled_time = now + self.initial_lead;
        }

        let mut due = Vec::new();
        while self.scheduled_time < now + self.schedule_ahead {
            let Some(samples) = self.queue.pop_front() else {
                break;
            };
            let buffer = ScheduledBuffer {
                start: self.scheduled_time.max(now),
                samples,
                sample_rate: self.sample_rate,
            };
            self.scheduled_time = buffer.end();
            due.push(buffer);
        }
        due
    }

    fn reset(&mut self) {
        self.filling.clear();
        self.queue.clear();
        self.carry = None;
        self.playing = false;
        self.scheduled_time = 0.0;
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

struct PlaybackInner {
    context: Arc<dyn AudioContext>,
    loader: Arc<UnitLoader>,
    options: PlaybackOptions,
    scheduler: Mutex<Scheduler>,
    meter: Mutex<Option<PortReceiver>>,
    volume: watch::Sender<f32>,
    pump_started: Mutex<bool>,
    cancel: CancellationToken,
}

/// Streams PCM16 to an [`AudioContext`] without gaps or overlap.
pub struct PlaybackPipeline {
    inner: Arc<PlaybackInner>,
}

impl PlaybackPipeline {
    /// Create a pipeline over `context`. Nothing plays until [`resume`](Self::resume).
    pub fn new(context: Arc<dyn AudioContext>, loader: Arc<UnitLoader>, options: PlaybackOptions) -> Self {
        let (volume, _) = watch::channel(0.0);
        Self {
            inner: Arc::new(PlaybackInner {
                context,
                loader,
                scheduler: Mutex::new(Scheduler::new(&options)),
                options,
                meter: Mutex::new(None),
                volume,
                pump_started: Mutex::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The context buffers are scheduled on.
    pub fn context(&self) -> &Arc<dyn AudioContext> {
        &self.inner.context
    }

    /// Start the output device, attach the meter and start the pump.
    ///
    /// A meter that fails to load only costs the volume reading.
    pub async fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        inner.context.resume().await?;

        let needs_meter = inner.options.metering && inner.meter.lock().is_none();
        if needs_meter {
            if let Err(e) = inner.attach_meter().await {
                warn!(error = %e, "Output metering unavailable, playback continues without it");
            }
        }

        let mut started = inner.pump_started.lock();
        if !*started {
            *started = true;
            tokio::spawn(pump(Arc::downgrade(inner), inner.options.tick, inner.cancel.clone()));
            debug!(context = %inner.context.id(), "Playback pump started");
        }
        drop(started);

        self.schedule_due();
        Ok(())
    }

    /// Append little-endian PCM16 bytes to the stream.
    pub fn add_pcm16(&self, bytes: &[u8]) {
        self.inner.scheduler.lock().push_bytes(bytes);
        self.schedule_due();
    }

    /// Queue the partially filled buffer so a trailing fragment plays.
    pub fn flush(&self) {
        self.inner.scheduler.lock().flush();
        self.schedule_due();
    }

    /// Cancel everything not yet played and start a fresh timeline on the next input.
    pub fn stop(&self) {
        // Held across the cancel so a concurrent pump cannot schedule a
        // buffer it popped before the reset.
        let mut scheduler = self.inner.scheduler.lock();
        let dropped = scheduler.queued();
        scheduler.reset();
        let cancelled = self.inner.context.cancel_scheduled();
        drop(scheduler);

        info!(cancelled, dropped, "Playback stopped");
    }

    /// Hand due buffers to the context. Returns how many were scheduled.
    ///
    /// The pump calls this every tick; it is public so callers driving a
    /// manual clock can schedule without waiting for the pump.
    pub fn schedule_due(&self) -> usize {
        self.inner.schedule_due()
    }

    /// Buffers waiting for their turn to be scheduled.
    pub fn queued(&self) -> usize {
        self.inner.scheduler.lock().queued()
    }

    /// Latest output level in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        *self.inner.volume.borrow()
    }

    /// Watch the output level.
    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.inner.volume.subscribe()
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.inner.context.detach_output_tap();
        // Last owner of the context: its installed units go with it.
        if Arc::strong_count(&self.inner.context) == 1 {
            self.inner.loader.forget(self.inner.context.id());
        }
    }
}

impl std::fmt::Debug for PlaybackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackPipeline")
            .field("context", &self.inner.context.id())
            .field("queued", &self.queued())
            .field("volume", &self.volume())
            .finish()
    }
}

impl PlaybackInner {
    async fn attach_meter(&self) -> Result<()> {
        let context = self.context.as_ref();
        self.loader.ensure_loaded(context, METER_UNIT).await?;
        let unit = context.create_unit(METER_UNIT)?;
        let (tx, rx) = port(DEFAULT_PORT_CAPACITY);
        context.attach_output_tap(unit, tx)?;
        *self.meter.lock() = Some(rx);
        Ok(())
    }

    fn schedule_due(&self) -> usize {
        if !self.context.is_running() {
            return 0;
        }

        // The lock covers popping and scheduling; see `stop`.
        let mut scheduler = self.scheduler.lock();
        let due = scheduler.drain_due(self.context.current_time());
        let mut scheduled = 0;
        for buffer in due {
            trace!(start = buffer.start, samples = buffer.samples.len(), "Scheduling buffer");
            match self.context.schedule(buffer) {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(error = %e, "Failed to schedule playback buffer"),
            }
        }
        scheduled
    }

    fn read_meter(&self) {
        let mut meter = self.meter.lock();
        let Some(receiver) = meter.as_mut() else {
            return;
        };
        let mut latest = None;
        while let Some(message) = receiver.try_recv() {
            if let UnitMessage::Volume(level) = message {
                latest = Some(level);
            }
        }
        if let Some(level) = latest {
            self.volume.send_replace(level.clamp(0.0, 1.0));
        }
    }
}

async fn pump(inner: Weak<PlaybackInner>, tick: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.schedule_due();
        inner.read_meter();
    }
    debug!("Playback pump stopped");
}
