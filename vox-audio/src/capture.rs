//! Microphone capture: device frames → PCM16 encoder unit → base64 blocks.

use crate::context::AudioContext;
use crate::error::{AudioError, Result};
use crate::format::{AudioBlock, AudioFormat, CAPTURE_SAMPLE_RATE, SmartAudioBuffer};
use crate::loader::UnitLoader;
use crate::port::{DEFAULT_PORT_CAPACITY, PortReceiver, UnitMessage, port};
use crate::units::{BlockProcessor, ENCODER_UNIT, METER_UNIT};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving mono float frames on the device's real-time thread.
pub type FrameSink = Box<dyn FnMut(&[f32]) + Send>;

/// An input device that can be opened at a given sample rate.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device and start delivering frames to `sink`.
    async fn open(&self, sample_rate: u32, sink: FrameSink) -> Result<Box<dyn InputStream>>;
}

/// Handle to an open input device.
pub trait InputStream: Send {
    /// Stop delivering frames and release the device.
    fn stop(&mut self);
}

/// Events emitted by the capture pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A base64-encoded PCM16 chunk ready to send.
    Data {
        /// Little-endian PCM16, base64 (standard alphabet).
        base64: String,
    },
}

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Device sample rate requested from the microphone.
    pub sample_rate: u32,
    /// Encoded blocks are coalesced until this much audio is buffered.
    pub chunk_duration_ms: u32,
    /// Capacity of the real-time → event-loop ring, in render blocks.
    pub ring_capacity: usize,
    /// How often the event loop drains the ring.
    pub drain_interval: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            chunk_duration_ms: 128,
            ring_capacity: DEFAULT_PORT_CAPACITY,
            drain_interval: Duration::from_millis(10),
        }
    }
}

type SharedStart = Shared<BoxFuture<'static, Result<()>>>;
type SharedStop = Shared<BoxFuture<'static, ()>>;

enum CaptureState {
    NotStarted,
    Starting(SharedStart),
    Started(ActiveCapture),
    Stopping(SharedStop),
}

struct ActiveCapture {
    stream: Box<dyn InputStream>,
    cancel: CancellationToken,
    drain: JoinHandle<()>,
}

enum Pending {
    Start(SharedStart),
    Stop(SharedStop),
}

struct Inner {
    context: Arc<dyn AudioContext>,
    microphone: Arc<dyn Microphone>,
    loader: Arc<UnitLoader>,
    options: CaptureOptions,
    state: Mutex<CaptureState>,
    events: broadcast::Sender<CaptureEvent>,
    volume: watch::Sender<f32>,
}

/// Microphone capture pipeline.
///
/// `start` and `stop` may be called concurrently from any number of tasks.
/// A start that is already in flight is shared, and a stop issued during a
/// start waits for it to settle before tearing down.
#[derive(Clone)]
pub struct CapturePipeline {
    inner: Arc<Inner>,
}

impl CapturePipeline {
    /// Create a pipeline. `context` hosts the encoder and meter units.
    pub fn new(
        context: Arc<dyn AudioContext>,
        microphone: Arc<dyn Microphone>,
        loader: Arc<UnitLoader>,
        options: CaptureOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (volume, _) = watch::channel(0.0);
        Self {
            inner: Arc::new(Inner {
                context,
                microphone,
                loader,
                options,
                state: Mutex::new(CaptureState::NotStarted),
                events,
                volume,
            }),
        }
    }

    /// Subscribe to encoded blocks.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.events.subscribe()
    }

    /// Latest input level in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        *self.inner.volume.borrow()
    }

    /// Watch the input level.
    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.inner.volume.subscribe()
    }

    /// Whether the microphone is currently open.
    pub fn is_started(&self) -> bool {
        matches!(*self.inner.state.lock(), CaptureState::Started(_))
    }

    /// Open the microphone and start emitting blocks.
    pub async fn start(&self) -> Result<()> {
        loop {
            let pending = {
                let mut state = self.inner.state.lock();
                match &*state {
                    CaptureState::Started(_) => return Ok(()),
                    CaptureState::Starting(start) => Pending::Start(start.clone()),
                    CaptureState::Stopping(stop) => Pending::Stop(stop.clone()),
                    CaptureState::NotStarted => {
                        let start = Inner::start(Arc::downgrade(&self.inner), self.inner.acquisition())
                            .boxed()
                            .shared();
                        *state = CaptureState::Starting(start.clone());
                        Pending::Start(start)
                    }
                }
            };

            match pending {
                Pending::Start(start) => return start.await,
                // A teardown is in progress; start afresh once it settles.
                Pending::Stop(stop) => stop.await,
            }
        }
    }

    /// Stop capturing. Idempotent; waits for any pending start first.
    pub async fn stop(&self) {
        loop {
            let pending = {
                let mut state = self.inner.state.lock();
                match std::mem::replace(&mut *state, CaptureState::NotStarted) {
                    CaptureState::NotStarted => return,
                    CaptureState::Starting(start) => {
                        *state = CaptureState::Starting(start.clone());
                        Pending::Start(start)
                    }
                    CaptureState::Stopping(stop) => {
                        *state = CaptureState::Stopping(stop.clone());
                        Pending::Stop(stop)
                    }
                    CaptureState::Started(active) => {
                        let stop = Inner::shutdown(Arc::downgrade(&self.inner), active).boxed().shared();
                        *state = CaptureState::Stopping(stop.clone());
                        Pending::Stop(stop)
                    }
                }
            };

            match pending {
                Pending::Start(start) => {
                    let _ = start.await;
                }
                Pending::Stop(stop) => return stop.await,
            }
        }
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.state.lock() {
            CaptureState::NotStarted => "not_started",
            CaptureState::Starting(_) => "starting",
            CaptureState::Started(_) => "started",
            CaptureState::Stopping(_) => "stopping",
        };
        f.debug_struct("CapturePipeline")
            .field("state", &state)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if Arc::strong_count(&self.context) == 1 {
            self.loader.forget(self.context.id());
        }
    }
}

/// What opening the device needs. In-flight starts and stops live in
/// `Inner::state`, so they hold these clones and a `Weak<Inner>`, never the
/// pipeline itself.
struct Acquisition {
    context: Arc<dyn AudioContext>,
    microphone: Arc<dyn Microphone>,
    loader: Arc<UnitLoader>,
    options: CaptureOptions,
    events: broadcast::Sender<CaptureEvent>,
    volume: watch::Sender<f32>,
}

impl Inner {
    fn acquisition(&self) -> Acquisition {
        Acquisition {
            context: self.context.clone(),
            microphone: self.microphone.clone(),
            loader: self.loader.clone(),
            options: self.options.clone(),
            events: self.events.clone(),
            volume: self.volume.clone(),
        }
    }

    async fn start(this: Weak<Self>, acquisition: Acquisition) -> Result<()> {
        let result = acquisition.acquire().await;
        let Some(inner) = this.upgrade() else {
            // The pipeline went away while the device was opening.
            if let Ok(mut active) = result {
                active.stream.stop();
                active.cancel.cancel();
            }
            return Err(AudioError::device("capture pipeline dropped during start"));
        };

        let mut state = inner.state.lock();
        match result {
            Ok(active) => {
                *state = CaptureState::Started(active);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to start capture");
                *state = CaptureState::NotStarted;
                Err(e)
            }
        }
    }

    async fn shutdown(this: Weak<Self>, mut active: ActiveCapture) {
        active.stream.stop();
        active.cancel.cancel();
        if let Err(e) = active.drain.await {
            warn!(error = %e, "Capture drain task failed");
        }
        drop(active.stream);

        if let Some(inner) = this.upgrade() {
            *inner.state.lock() = CaptureState::NotStarted;
            inner.volume.send_replace(0.0);
        }
        info!("Capture stopped");
    }
}

impl Acquisition {
    async fn acquire(&self) -> Result<ActiveCapture> {
        let context = self.context.as_ref();

        self.loader.ensure_loaded(context, ENCODER_UNIT).await?;
        let mut units = vec![context.create_unit(ENCODER_UNIT)?];

        let meter = match self.loader.ensure_loaded(context, METER_UNIT).await {
            Ok(()) => context.create_unit(METER_UNIT),
            Err(e) => Err(e),
        };
        match meter {
            Ok(meter) => units.push(meter),
            Err(e) => warn!(error = %e, "Input metering unavailable, continuing without it"),
        }

        let (port, receiver) = port(self.options.ring_capacity);
        let mut processor = BlockProcessor::new(units, port);
        let sink: FrameSink = Box::new(move |frames| processor.push(frames));

        let stream = self.microphone.open(self.options.sample_rate, sink).await?;

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_loop(
            receiver,
            self.events.clone(),
            self.volume.clone(),
            self.options.clone(),
            cancel.clone(),
        ));

        info!(sample_rate = self.options.sample_rate, "Capture started");
        Ok(ActiveCapture { stream, cancel, drain })
    }
}

async fn drain_loop(
    mut receiver: PortReceiver,
    events: broadcast::Sender<CaptureEvent>,
    volume: watch::Sender<f32>,
    options: CaptureOptions,
    cancel: CancellationToken,
) {
    let format = AudioFormat { sample_rate: options.sample_rate, ..AudioFormat::pcm16_16khz() };
    let mut chunker = SmartAudioBuffer::new(options.sample_rate, options.chunk_duration_ms);
    let mut ticker = tokio::time::interval(options.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        drain_port(&mut receiver, &mut chunker, format, &events, &volume);
    }

    // Whatever the device produced before it stopped still goes out.
    drain_port(&mut receiver, &mut chunker, format, &events, &volume);
    if let Some(samples) = chunker.flush_remaining() {
        emit(&events, &samples, format);
    }
    debug!("Capture drain task finished");
}

fn drain_port(
    receiver: &mut PortReceiver,
    chunker: &mut SmartAudioBuffer,
    format: AudioFormat,
    events: &broadcast::Sender<CaptureEvent>,
    volume: &watch::Sender<f32>,
) {
    while let Some(message) = receiver.try_recv() {
        match message {
            UnitMessage::Pcm16 { samples, len } => {
                chunker.push(&samples[..len]);
                if let Some(chunk) = chunker.flush() {
                    emit(events, &chunk, format);
                }
            }
            UnitMessage::Volume(level) => {
                volume.send_replace(level);
            }
        }
    }

    let dropped = receiver.take_new_drops();
    if dropped > 0 {
        warn!(dropped, total = receiver.dropped(), "Capture ring full, dropped newest blocks");
    }
}

fn emit(events: &broadcast::Sender<CaptureEvent>, samples: &[i16], format: AudioFormat) {
    let base64 = AudioBlock::from_i16_samples(samples, format).to_base64();
    // No subscribers is fine: nobody is listening yet.
    let _ = events.send(CaptureEvent::Data { base64 });
}
