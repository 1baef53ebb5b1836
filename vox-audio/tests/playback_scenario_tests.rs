//! Playback scenarios: interruption, best-effort metering, fresh timelines.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use vox_audio::testing::ManualAudioContext;
use vox_audio::units::METER_UNIT;
use vox_audio::{
    AudioContext, AudioError, AudioUnit, ContextId, PlaybackOptions, PlaybackPipeline, ScheduledBuffer, UnitCatalog,
    UnitLoader, UnitPort, UnitSource,
};

const BUFFER: usize = 7680;

fn pcm(value: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat_n(value.to_le_bytes(), samples).flatten().collect()
}

fn pipeline(metering: bool) -> (PlaybackPipeline, Arc<ManualAudioContext>) {
    let ctx = Arc::new(ManualAudioContext::new(24_000));
    let options = PlaybackOptions { metering, ..Default::default() };
    let playback =
        PlaybackPipeline::new(ctx.clone(), Arc::new(UnitLoader::new(UnitCatalog::builtin())), options);
    (playback, ctx)
}

#[tokio::test]
async fn test_nothing_plays_before_resume() {
    let (playback, ctx) = pipeline(false);
    playback.add_pcm16(&pcm(0, BUFFER));
    assert!(ctx.scheduled().is_empty());
    assert_eq!(playback.queued(), 1);

    playback.resume().await.unwrap();
    assert_eq!(ctx.scheduled().len(), 1);
    assert!((ctx.scheduled()[0].start - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_interruption_cancels_queued_and_scheduled_audio() {
    let (playback, ctx) = pipeline(false);
    playback.resume().await.unwrap();

    playback.add_pcm16(&pcm(1000, BUFFER * 3));
    assert_eq!(ctx.scheduled().len(), 1);
    assert_eq!(playback.queued(), 2);

    playback.stop();
    assert_eq!(ctx.cancelled_count(), 1);
    assert!(ctx.pending().is_empty());
    assert_eq!(playback.queued(), 0);

    // Buffers queued before the interruption never reach the device.
    ctx.advance(1.0);
    assert_eq!(playback.schedule_due(), 0);
    assert_eq!(ctx.scheduled().len(), 1);

    // New audio starts a fresh timeline relative to the clock.
    playback.add_pcm16(&pcm(1000, BUFFER));
    let scheduled = ctx.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert!((scheduled[1].start - 1.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_partial_buffer_waits_for_flush() {
    let (playback, ctx) = pipeline(false);
    playback.resume().await.unwrap();

    playback.add_pcm16(&pcm(0, 100));
    assert!(ctx.scheduled().is_empty());

    playback.flush();
    assert_eq!(ctx.scheduled().len(), 1);
    assert_eq!(ctx.scheduled()[0].samples.len(), 100);
}

#[tokio::test]
async fn test_meter_failure_does_not_block_playback() {
    let (playback, ctx) = pipeline(true);
    ctx.fail_unit(METER_UNIT);

    playback.resume().await.unwrap();
    assert!(!ctx.has_output_tap());

    playback.add_pcm16(&pcm(1000, BUFFER));
    assert_eq!(ctx.scheduled().len(), 1);
    assert_eq!(playback.volume(), 0.0);
}

#[tokio::test]
async fn test_resume_failure_is_a_device_error() {
    let (playback, ctx) = pipeline(true);
    ctx.fail_resume(AudioError::device("no output device"));
    let err = playback.resume().await.unwrap_err();
    assert!(matches!(err, AudioError::DeviceError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_volume_tracks_rendered_output() {
    let (playback, ctx) = pipeline(true);
    playback.resume().await.unwrap();
    assert!(ctx.has_output_tap());

    playback.add_pcm16(&pcm(16384, BUFFER));
    ctx.advance(0.3);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let volume = playback.volume();
    assert!((0.45..=0.55).contains(&volume), "unexpected volume {volume}");
}

/// Context whose next `schedule` call parks until the test releases it.
struct GatedContext {
    inner: ManualAudioContext,
    armed: AtomicBool,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

#[async_trait]
impl AudioContext for GatedContext {
    fn id(&self) -> ContextId {
        self.inner.id()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    async fn resume(&self) -> vox_audio::Result<()> {
        self.inner.resume().await
    }

    async fn install_unit(&self, source: &UnitSource) -> vox_audio::Result<()> {
        self.inner.install_unit(source).await
    }

    fn create_unit(&self, name: &str) -> vox_audio::Result<Box<dyn AudioUnit>> {
        self.inner.create_unit(name)
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> vox_audio::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.lock().send(()).unwrap();
            self.release.lock().recv().unwrap();
        }
        self.inner.schedule(buffer)
    }

    fn cancel_scheduled(&self) -> usize {
        self.inner.cancel_scheduled()
    }

    fn attach_output_tap(&self, unit: Box<dyn AudioUnit>, port: UnitPort) -> vox_audio::Result<()> {
        self.inner.attach_output_tap(unit, port)
    }

    fn detach_output_tap(&self) {
        self.inner.detach_output_tap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_scheduling_cancels_the_popped_buffer() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let ctx = Arc::new(GatedContext {
        inner: ManualAudioContext::new(24_000),
        armed: AtomicBool::new(false),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    // A long tick keeps the pump out of the way after its first pass.
    let options = PlaybackOptions { metering: false, tick: Duration::from_secs(3600), ..Default::default() };
    let playback = PlaybackPipeline::new(ctx.clone(), Arc::new(UnitLoader::new(UnitCatalog::builtin())), options);
    playback.resume().await.unwrap();
    ctx.armed.store(true, Ordering::SeqCst);

    std::thread::scope(|scope| {
        // Pops the buffer, then parks inside `schedule`.
        let feeder = scope.spawn(|| playback.add_pcm16(&pcm(1000, BUFFER)));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopper = scope.spawn(|| playback.stop());
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        feeder.join().unwrap();
        stopper.join().unwrap();
    });

    assert_eq!(ctx.inner.scheduled().len(), 1);
    assert!(ctx.inner.pending().is_empty(), "a buffer popped before stop must not outlive it");
    assert_eq!(ctx.inner.cancelled_count(), 1);
    assert_eq!(playback.queued(), 0);
}
