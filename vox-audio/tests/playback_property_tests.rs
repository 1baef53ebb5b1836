//! Property tests for playback scheduling.
//!
//! *For any* sequence of PCM16 byte blocks, interleaved with arbitrary clock
//! advances and flushes, the buffers handed to the context start in
//! non-decreasing order and never overlap:
//! `start[i + 1] >= start[i] + duration[i]`.

use proptest::prelude::*;
use std::sync::Arc;
use vox_audio::testing::ManualAudioContext;
use vox_audio::{AudioContext, PlaybackOptions, PlaybackPipeline, UnitCatalog, UnitLoader};

#[derive(Debug, Clone)]
struct Step {
    bytes: Vec<u8>,
    advance: f64,
    flush: bool,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (prop::collection::vec(any::<u8>(), 0..3000), 0.0f64..0.4, any::<bool>())
        .prop_map(|(bytes, advance, flush)| Step { bytes, advance, flush })
}

fn pipeline() -> (PlaybackPipeline, Arc<ManualAudioContext>) {
    let ctx = Arc::new(ManualAudioContext::new(24_000));
    futures::executor::block_on(ctx.resume()).unwrap();
    let options = PlaybackOptions { buffer_samples: 960, metering: false, ..Default::default() };
    let playback =
        PlaybackPipeline::new(ctx.clone(), Arc::new(UnitLoader::new(UnitCatalog::builtin())), options);
    (playback, ctx)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_schedule_is_gapless_and_ordered(steps in prop::collection::vec(arb_step(), 1..40)) {
        let (playback, ctx) = pipeline();
        let mut total_bytes = 0usize;

        for step in &steps {
            total_bytes += step.bytes.len();
            playback.add_pcm16(&step.bytes);
            if step.flush {
                playback.flush();
            }
            ctx.advance(step.advance);
            playback.schedule_due();
        }

        playback.flush();
        while playback.queued() > 0 {
            ctx.advance(0.1);
            playback.schedule_due();
        }

        let scheduled = ctx.scheduled();
        for pair in scheduled.windows(2) {
            prop_assert!(
                pair[1].start >= pair[0].end(),
                "buffer starting at {} overlaps previous ending at {}",
                pair[1].start,
                pair[0].end()
            );
        }

        let samples: usize = scheduled.iter().map(|b| b.samples.len()).sum();
        prop_assert_eq!(samples, total_bytes / 2);
    }

    #[test]
    fn prop_buffers_never_start_in_the_past(steps in prop::collection::vec(arb_step(), 1..20)) {
        let (playback, ctx) = pipeline();

        for step in &steps {
            let now = ctx.current_time();
            let before = ctx.scheduled().len();
            playback.add_pcm16(&step.bytes);
            playback.flush();
            for buffer in &ctx.scheduled()[before..] {
                prop_assert!(buffer.start >= now);
            }
            ctx.advance(step.advance);
        }
    }
}
