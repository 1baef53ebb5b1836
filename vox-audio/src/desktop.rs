//! Desktop audio I/O on top of `cpal`.
//!
//! `cpal::Stream` is `!Send`, so each stream lives on its own thread for as
//! long as it is open. The output callback renders scheduled buffers at
//! their exact start frame and feeds the rendered signal to the output tap.

use crate::capture::{FrameSink, InputStream, Microphone};
use crate::context::{AudioContext, ContextId, ScheduledBuffer, UnitTable};
use crate::error::{AudioError, Result};
use crate::port::{DEFAULT_PORT_CAPACITY, UnitPort};
use crate::units::{AudioUnit, BlockProcessor, UnitSource};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Largest device callback the microphone downmixes in one pass.
const MIC_SCRATCH_FRAMES: usize = 4096;

struct ScheduledFrames {
    start_frame: u64,
    samples: Arc<[f32]>,
    generation: u64,
}

/// State shared between the context and its output callback.
struct RenderShared {
    frames: AtomicU64,
    generation: AtomicU64,
    outstanding: AtomicUsize,
    tap: Mutex<Option<BlockProcessor>>,
}

/// Handle to the thread that owns an open `cpal::Stream`.
struct StreamThread {
    stop: mpsc::Sender<()>,
}

impl StreamThread {
    fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// Output context on the default output device.
///
/// The device opens lazily on the first [`resume`](AudioContext::resume).
pub struct CpalAudioContext {
    id: ContextId,
    sample_rate: u32,
    units: UnitTable,
    shared: Arc<RenderShared>,
    producer: Mutex<Producer<ScheduledFrames>>,
    retired: Mutex<Consumer<Arc<[f32]>>>,
    pending_renderer: Mutex<Option<Renderer>>,
    running: AtomicBool,
    device: Mutex<Option<StreamThread>>,
}

impl CpalAudioContext {
    pub fn new(sample_rate: u32) -> Self {
        let shared = Arc::new(RenderShared {
            frames: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            tap: Mutex::new(None),
        });
        let (producer, consumer) = RingBuffer::new(DEFAULT_PORT_CAPACITY);
        let (retire_tx, retire_rx) = RingBuffer::new(DEFAULT_PORT_CAPACITY);
        let renderer = Renderer { consumer, retire: retire_tx, current: None, shared: shared.clone() };

        Self {
            id: ContextId::next(),
            sample_rate,
            units: UnitTable::new(),
            shared,
            producer: Mutex::new(producer),
            retired: Mutex::new(retire_rx),
            pending_renderer: Mutex::new(Some(renderer)),
            running: AtomicBool::new(false),
            device: Mutex::new(None),
        }
    }

    /// Release buffers the callback has finished with, off the real-time thread.
    fn collect_retired(&self) {
        let mut retired = self.retired.lock();
        while retired.pop().is_ok() {}
    }
}

impl Drop for CpalAudioContext {
    fn drop(&mut self) {
        if let Some(device) = self.device.lock().take() {
            device.stop();
        }
    }
}

impl std::fmt::Debug for CpalAudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalAudioContext")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl AudioContext for CpalAudioContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.shared.frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn resume(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let Some(renderer) = self.pending_renderer.lock().take() else {
            // Another caller is opening the device.
            return Ok(());
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let sample_rate = self.sample_rate;

        std::thread::Builder::new()
            .name("vox-audio-output".into())
            .spawn(move || match open_output(sample_rate, renderer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Keep the stream alive until stopped or the context goes away.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::device(format!("failed to spawn output thread: {e}")))?;

        ready_rx.await.map_err(|_| AudioError::device("output thread exited during startup"))??;

        *self.device.lock() = Some(StreamThread { stop: stop_tx });
        self.running.store(true, Ordering::Release);
        info!(context = %self.id, sample_rate, "Output device started");
        Ok(())
    }

    async fn install_unit(&self, source: &UnitSource) -> Result<()> {
        self.units.install(source);
        Ok(())
    }

    fn create_unit(&self, name: &str) -> Result<Box<dyn AudioUnit>> {
        self.units.create(name, self.sample_rate)
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> Result<()> {
        self.collect_retired();
        let frames = ScheduledFrames {
            start_frame: (buffer.start * self.sample_rate as f64).round() as u64,
            samples: buffer.samples,
            generation: self.shared.generation.load(Ordering::Acquire),
        };
        self.producer
            .lock()
            .push(frames)
            .map_err(|_| AudioError::device("output schedule ring is full"))?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn cancel_scheduled(&self) -> usize {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.outstanding.swap(0, Ordering::AcqRel)
    }

    fn attach_output_tap(&self, unit: Box<dyn AudioUnit>, port: UnitPort) -> Result<()> {
        *self.shared.tap.lock() = Some(BlockProcessor::new(vec![unit], port));
        Ok(())
    }

    fn detach_output_tap(&self) {
        self.shared.tap.lock().take();
    }
}

/// Real-time side of [`CpalAudioContext`].
struct Renderer {
    consumer: Consumer<ScheduledFrames>,
    retire: Producer<Arc<[f32]>>,
    current: Option<ScheduledFrames>,
    shared: Arc<RenderShared>,
}

impl Renderer {
    fn render<T>(&mut self, output: &mut [T], channels: usize)
    where
        T: SizedSample + FromSample<f32>,
    {
        let generation = self.shared.generation.load(Ordering::Acquire);
        let mut frame = self.shared.frames.load(Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let mut tap = shared.tap.try_lock();

        for out in output.chunks_mut(channels.max(1)) {
            let value = self.next_sample(frame, generation);
            let sample = T::from_sample(value);
            for channel in out.iter_mut() {
                *channel = sample;
            }
            if let Some(processor) = tap.as_mut().and_then(|t| t.as_mut()) {
                processor.push_sample(value);
            }
            frame += 1;
        }

        self.shared.frames.store(frame, Ordering::Release);
    }

    fn next_sample(&mut self, frame: u64, generation: u64) -> f32 {
        loop {
            if self.current.is_none() {
                let due = match self.consumer.peek() {
                    Ok(next) => next.generation != generation || next.start_frame <= frame,
                    Err(_) => return 0.0,
                };
                if !due {
                    return 0.0;
                }
                self.current = self.consumer.pop().ok();
            }

            let Some(current) = self.current.as_ref() else {
                return 0.0;
            };
            if current.generation == generation {
                let offset = frame.saturating_sub(current.start_frame) as usize;
                if let Some(&value) = current.samples.get(offset) {
                    return value;
                }
            }
            self.retire_current();
        }
    }

    fn retire_current(&mut self) {
        if let Some(done) = self.current.take() {
            if done.generation == self.shared.generation.load(Ordering::Relaxed) {
                let _ = self.shared.outstanding.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                    n.checked_sub(1)
                });
            }
            // Full ring: the buffer is freed here instead of on the event loop.
            let _ = self.retire.push(done.samples);
        }
    }
}

fn pick_config<I>(configs: I, sample_rate: u32) -> Option<(StreamConfig, SampleFormat)>
where
    I: Iterator<Item = SupportedStreamConfigRange>,
{
    let rate = cpal::SampleRate(sample_rate);
    let mut candidates: Vec<_> = configs
        .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .collect();
    // Mono first, then float.
    candidates.sort_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::F32));
    candidates.into_iter().next().map(|c| {
        let format = c.sample_format();
        (c.with_sample_rate(rate).config(), format)
    })
}

fn open_output(sample_rate: u32, mut renderer: Renderer) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::device("no output device available"))?;
    let configs = device.supported_output_configs().map_err(|e| AudioError::device(e.to_string()))?;
    let (config, format) = pick_config(configs, sample_rate)
        .ok_or_else(|| AudioError::format(format!("output device has no f32 or i16 config at {sample_rate} Hz")))?;
    let channels = config.channels as usize;

    let on_error = |e: cpal::StreamError| error!(error = %e, "Output stream error");
    let stream = match format {
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| renderer.render(data, channels),
            on_error,
            None,
        ),
        _ => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data, channels),
            on_error,
            None,
        ),
    }
    .map_err(|e| AudioError::device(e.to_string()))?;

    stream.play().map_err(|e| AudioError::device(e.to_string()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        channels,
        ?format,
        "Opened output stream"
    );
    Ok(stream)
}

/// Default input device.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self, sample_rate: u32, sink: FrameSink) -> Result<Box<dyn InputStream>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("vox-audio-input".into())
            .spawn(move || match open_input(sample_rate, sink) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::device(format!("failed to spawn input thread: {e}")))?;

        ready_rx.await.map_err(|_| AudioError::device("input thread exited during startup"))??;
        Ok(Box::new(CpalInputStream { thread: Some(StreamThread { stop: stop_tx }) }))
    }
}

struct CpalInputStream {
    thread: Option<StreamThread>,
}

impl InputStream for CpalInputStream {
    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Downmixes interleaved device frames into a preallocated mono scratch.
struct Downmix {
    sink: FrameSink,
    scratch: Vec<f32>,
    channels: usize,
}

impl Downmix {
    fn push<T>(&mut self, data: &[T])
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = self.channels.max(1);
        for block in data.chunks(MIC_SCRATCH_FRAMES * channels) {
            let frames = block.len() / channels;
            for (out, frame) in self.scratch[..frames].iter_mut().zip(block.chunks_exact(channels)) {
                let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                *out = sum / channels as f32;
            }
            (self.sink)(&self.scratch[..frames]);
        }
    }
}

fn open_input(sample_rate: u32, sink: FrameSink) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::device("no input device available"))?;
    let configs = device.supported_input_configs().map_err(|e| AudioError::device(e.to_string()))?;
    let (config, format) = pick_config(configs, sample_rate)
        .ok_or_else(|| AudioError::format(format!("input device has no f32 or i16 config at {sample_rate} Hz")))?;

    let mut downmix = Downmix { sink, scratch: vec![0.0; MIC_SCRATCH_FRAMES], channels: config.channels as usize };
    let on_error = |e: cpal::StreamError| warn!(error = %e, "Input stream error");
    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| downmix.push(data),
            on_error,
            None,
        ),
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| downmix.push(data),
            on_error,
            None,
        ),
    }
    .map_err(|e| AudioError::device(e.to_string()))?;

    stream.play().map_err(|e| AudioError::device(e.to_string()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        channels = config.channels,
        ?format,
        "Opened input stream"
    );
    Ok(stream)
}
