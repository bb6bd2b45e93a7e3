//! Audio loudness in dBFS.

use std::fmt;

/// Level reported for silence (and for empty buffers).
pub const SILENCE_DBFS: f64 = -96.0;

/// Full-scale amplitude of a signed 16-bit sample.
const FULL_SCALE: f64 = 32768.0;

/// One loudness sample in decibels relative to full scale.
///
/// Displays with one decimal place, the telemetry wire format.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct DbfsLevel(pub f64);

impl DbfsLevel {
    /// Measures a buffer of signed 16-bit samples.
    pub fn measure(samples: &[i16]) -> Self {
        Self(dbfs(samples))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for DbfsLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

/// Root-mean-square amplitude of a buffer. Empty buffers are silent.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Loudness of a buffer in dBFS, floored at [`SILENCE_DBFS`] for silence.
pub fn dbfs(samples: &[i16]) -> f64 {
    let rms = rms(samples);
    if rms == 0.0 {
        return SILENCE_DBFS;
    }
    20.0 * (rms / FULL_SCALE).log10()
}
