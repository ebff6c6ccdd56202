//! Adjustments and amplitudes shared by every channel type.

use std::sync::Arc;

/// Lowest tempo a streaming track supports; use frequency below this
pub const TEMPO_MINIMUM_SUPPORTED: f64 = 0.05;

/// Number of frequency bins in [`ChannelAmplitudes`]
pub const AMPLITUDES_SIZE: usize = 256;

/// Volume, balance, frequency and tempo of a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustments {
    /// Linear volume (0.0 to 1.0)
    pub volume: f64,
    /// Stereo balance (-1.0 left to 1.0 right)
    pub balance: f64,
    /// Playback rate multiplier affecting pitch
    pub frequency: f64,
    /// Playback rate multiplier preserving pitch
    pub tempo: f64,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            volume: 1.0,
            balance: 0.0,
            frequency: 1.0,
            tempo: 1.0,
        }
    }
}

impl Adjustments {
    /// Values as they should reach the backend
    pub fn clamped(&self) -> Self {
        Self {
            volume: self.volume.clamp(0.0, 1.0),
            balance: self.balance.clamp(-1.0, 1.0),
            frequency: self.frequency.max(0.0),
            tempo: self.tempo,
        }
    }
}

/// Peak levels and frequency content of a playing channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAmplitudes {
    pub left: f32,
    pub right: f32,
    pub frequency_amplitudes: Arc<[f32]>,
}

impl ChannelAmplitudes {
    /// Silence
    pub fn empty() -> Self {
        Self {
            left: 0.0,
            right: 0.0,
            frequency_amplitudes: Arc::from(vec![0.0f32; AMPLITUDES_SIZE]),
        }
    }

    /// Louder of the two channels
    pub fn maximum(&self) -> f32 {
        self.left.max(self.right)
    }

    /// Mean of the two channels
    pub fn average(&self) -> f32 {
        (self.left + self.right) / 2.0
    }
}

impl Default for ChannelAmplitudes {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_adjustments() {
        let adjustments = Adjustments {
            volume: 1.5,
            balance: -3.0,
            frequency: -1.0,
            tempo: 0.5,
        };
        let clamped = adjustments.clamped();
        assert_eq!(clamped.volume, 1.0);
        assert_eq!(clamped.balance, -1.0);
        assert_eq!(clamped.frequency, 0.0);
        assert_eq!(clamped.tempo, 0.5);
    }

    #[test]
    fn test_amplitudes() {
        let empty = ChannelAmplitudes::empty();
        assert_eq!(empty.frequency_amplitudes.len(), AMPLITUDES_SIZE);
        assert_eq!(empty.maximum(), 0.0);

        let loud = ChannelAmplitudes {
            left: 0.2,
            right: 0.6,
            frequency_amplitudes: empty.frequency_amplitudes.clone(),
        };
        assert_eq!(loud.maximum(), 0.6);
        assert!((loud.average() - 0.4).abs() < 1e-6);
    }
}
