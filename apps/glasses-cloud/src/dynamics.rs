//! Feed-forward dynamics compressor for 16-bit little-endian PCM.
//!
//! Gain reduction is smoothed by a one-pole envelope with separate attack and
//! release coefficients. The envelope lives on the processor, so consecutive
//! frames are treated as one continuous signal.

use serde::{Deserialize, Serialize};

const MIN_LEVEL: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioProcessorConfig {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    /// Make-up gain applied after compression.
    pub gain_db: f32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioProcessorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            ratio: 3.0,
            attack_ms: 5.0,
            release_ms: 50.0,
            gain_db: 16.0,
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DynamicsProcessor {
    config: AudioProcessorConfig,
    attack_coeff: f32,
    release_coeff: f32,
    reduction_db: f32,
}

impl DynamicsProcessor {
    pub fn new(config: AudioProcessorConfig) -> Self {
        // Interleaved channels share one envelope, so the envelope ticks once
        // per sample rather than once per frame of channels.
        let ticks_per_sec = config.sample_rate as f32 * config.channels.max(1) as f32;
        Self {
            attack_coeff: smoothing_coeff(config.attack_ms, ticks_per_sec),
            release_coeff: smoothing_coeff(config.release_ms, ticks_per_sec),
            reduction_db: 0.0,
            config,
        }
    }

    pub fn config(&self) -> &AudioProcessorConfig {
        &self.config
    }

    /// Current gain reduction in dB.
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    /// Returns a frame of the same length. A trailing odd byte is copied
    /// through untouched.
    pub fn process(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(frame.len());
        let mut samples = frame.chunks_exact(2);
        for pair in &mut samples {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            out.extend_from_slice(&self.process_sample(sample).to_le_bytes());
        }
        out.extend_from_slice(samples.remainder());
        out
    }

    fn process_sample(&mut self, sample: i16) -> i16 {
        let x = sample as f32 / 32_768.0;
        let level_db = 20.0 * x.abs().max(MIN_LEVEL).log10();

        let over = level_db - self.config.threshold_db;
        let target = if over > 0.0 && self.config.ratio > 1.0 {
            over * (1.0 - 1.0 / self.config.ratio)
        } else {
            0.0
        };

        let coeff = if target > self.reduction_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

        let gain = db_to_linear(self.config.gain_db - self.reduction_db);
        let y = (x * gain).clamp(-1.0, 1.0);
        (y * i16::MAX as f32).round() as i16
    }
}

fn smoothing_coeff(time_ms: f32, ticks_per_sec: f32) -> f32 {
    if time_ms <= 0.0 || ticks_per_sec <= 0.0 {
        return 0.0;
    }
    (-1.0 / (time_ms * 0.001 * ticks_per_sec)).exp()
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn first_sample(frame: &[u8]) -> i16 {
        i16::from_le_bytes([frame[0], frame[1]])
    }

    fn flat_config() -> AudioProcessorConfig {
        AudioProcessorConfig {
            gain_db: 0.0,
            ..AudioProcessorConfig::default()
        }
    }

    #[test]
    fn defaults_match_voice_pipeline() {
        let config = AudioProcessorConfig::default();
        assert_eq!(config.threshold_db, -24.0);
        assert_eq!(config.ratio, 3.0);
        assert_eq!(config.attack_ms, 5.0);
        assert_eq!(config.release_ms, 50.0);
        assert_eq!(config.gain_db, 16.0);
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn frame_length_is_preserved() {
        let mut processor = DynamicsProcessor::new(AudioProcessorConfig::default());
        let mut frame = pcm(&[100, -200, 300]);
        frame.push(0x7f);

        let out = processor.process(&frame);
        assert_eq!(out.len(), frame.len());
        assert_eq!(*out.last().unwrap(), 0x7f);
        assert!(processor.process(&[]).is_empty());
    }

    #[test]
    fn silence_stays_silent() {
        let mut processor = DynamicsProcessor::new(AudioProcessorConfig::default());
        let out = processor.process(&pcm(&[0; 64]));
        assert!(out.iter().all(|byte| *byte == 0));
        assert_eq!(processor.reduction_db(), 0.0);
    }

    #[test]
    fn quiet_signal_only_receives_makeup_gain() {
        // -40 dBFS sits below the threshold; 16 dB of make-up gain applies.
        let mut processor = DynamicsProcessor::new(AudioProcessorConfig::default());
        let out = processor.process(&pcm(&[328]));
        let expected = 328.0 * db_to_linear(16.0);
        assert!((first_sample(&out) as f32 - expected).abs() < 4.0);
    }

    #[test]
    fn envelope_carries_across_frames() {
        let mut processor = DynamicsProcessor::new(flat_config());
        let loud = pcm(&[29_500; 32]);

        let first = processor.process(&loud);
        let second = processor.process(&loud);

        assert!(processor.reduction_db() > 0.0);
        assert!(first_sample(&second) < first_sample(&first));
        assert!(first_sample(&second) > 0);
    }
}
