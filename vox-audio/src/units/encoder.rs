use super::{AudioUnit, BLOCK_SIZE};
use crate::format::f32_to_pcm16;
use crate::port::{UnitMessage, UnitPort};

/// Name under which the PCM16 encoder is installed.
pub const ENCODER_UNIT: &str = "pcm16-encoder";

/// Converts float blocks to signed 16-bit and posts them to the event loop.
#[derive(Debug)]
pub struct Pcm16Encoder {
    scratch: [i16; BLOCK_SIZE],
}

impl Pcm16Encoder {
    pub fn new() -> Self {
        Self { scratch: [0; BLOCK_SIZE] }
    }
}

impl Default for Pcm16Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioUnit for Pcm16Encoder {
    fn process(&mut self, block: &[f32], port: &mut UnitPort) {
        let len = block.len().min(BLOCK_SIZE);
        for (out, &sample) in self.scratch[..len].iter_mut().zip(block) {
            *out = f32_to_pcm16(sample);
        }
        port.post(UnitMessage::Pcm16 { samples: self.scratch, len });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::port;

    #[test]
    fn test_encoder_clamps_full_scale() {
        let (mut tx, mut rx) = port(4);
        let mut encoder = Pcm16Encoder::new();
        let mut block = [0.0f32; BLOCK_SIZE];
        block[0] = 1.0;
        block[1] = -1.0;
        block[2] = 2.0;
        block[3] = 0.5;

        encoder.process(&block, &mut tx);

        match rx.try_recv() {
            Some(UnitMessage::Pcm16 { samples, len }) => {
                assert_eq!(len, BLOCK_SIZE);
                assert_eq!(samples[0].to_le_bytes(), [0xFF, 0x7F]);
                assert_eq!(samples[1].to_le_bytes(), [0x01, 0x80]);
                assert_eq!(samples[2], i16::MAX);
                assert_eq!(samples[3], 16383);
            }
            other => panic!("expected PCM16 block, got {other:?}"),
        }
    }
}
