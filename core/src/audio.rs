//! Audible alert patterns.
//!
//! Patterns are plain data; an [`AudioSink`] decides how (or whether) to
//! render them. Playback failures never propagate past the caller that
//! requested the sound.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    Triangle,
}

/// One beep, offset from the start of its pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub freq_hz: f32,
    pub start_ms: u32,
    pub duration_ms: u32,
    pub waveform: Waveform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TonePattern {
    pub name: String,
    pub tones: Vec<Tone>,
}

impl TonePattern {
    fn single(name: &str, freq_hz: f32, duration_ms: u32, waveform: Waveform) -> Self {
        Self {
            name: name.to_string(),
            tones: vec![Tone {
                freq_hz,
                start_ms: 0,
                duration_ms,
                waveform,
            }],
        }
    }

    /// Keyword alarm: five square-wave beeps 150 ms apart, alternating
    /// 1000 Hz and 800 Hz.
    pub fn emergency_alarm() -> Self {
        let tones = [0u32, 150, 300, 450, 600]
            .iter()
            .enumerate()
            .map(|(i, &start_ms)| Tone {
                freq_hz: if i % 2 == 0 { 1000.0 } else { 800.0 },
                start_ms,
                duration_ms: 120,
                waveform: Waveform::Square,
            })
            .collect();
        Self {
            name: "emergency_alarm".into(),
            tones,
        }
    }

    /// Siren played when a panic emergency fires.
    pub fn siren() -> Self {
        let tones = [880.0f32, 700.0, 880.0, 700.0, 880.0]
            .iter()
            .enumerate()
            .map(|(i, &freq_hz)| Tone {
                freq_hz,
                start_ms: i as u32 * 200,
                duration_ms: 150,
                waveform: Waveform::Square,
            })
            .collect();
        Self {
            name: "siren".into(),
            tones,
        }
    }

    /// Panic countdown warning: three 800 Hz triangle beeps.
    pub fn panic_warning() -> Self {
        let tones = (0..3)
            .map(|i| Tone {
                freq_hz: 800.0,
                start_ms: i * 300,
                duration_ms: 200,
                waveform: Waveform::Triangle,
            })
            .collect();
        Self {
            name: "panic_warning".into(),
            tones,
        }
    }

    pub fn notification_default() -> Self {
        Self::single("notification_default", 440.0, 200, Waveform::Sine)
    }

    pub fn notification_emergency() -> Self {
        Self::single("notification_emergency", 880.0, 500, Waveform::Square)
    }

    pub fn notification_warning() -> Self {
        Self::single("notification_warning", 660.0, 300, Waveform::Triangle)
    }

    pub fn notification_success() -> Self {
        Self::single("notification_success", 523.25, 200, Waveform::Sine)
    }

    /// Total length of the pattern.
    pub fn duration_ms(&self) -> u32 {
        self.tones
            .iter()
            .map(|t| t.start_ms + t.duration_ms)
            .max()
            .unwrap_or(0)
    }
}

/// Renders tone patterns.
pub trait AudioSink: Send + Sync {
    fn play(&self, pattern: &TonePattern) -> Result<()>;
}

/// Rings the terminal bell once per tone.
#[derive(Debug, Default)]
pub struct TerminalBell;

impl AudioSink for TerminalBell {
    fn play(&self, pattern: &TonePattern) -> Result<()> {
        debug!(target: "audio", pattern = %pattern.name, tones = pattern.tones.len(), "Ringing bell");
        let bells = "\x07".repeat(pattern.tones.len());
        let mut err = std::io::stderr().lock();
        err.write_all(bells.as_bytes())?;
        err.flush()?;
        Ok(())
    }
}

/// Discards every pattern.
#[derive(Debug, Default)]
pub struct SilentSink;

impl AudioSink for SilentSink {
    fn play(&self, _pattern: &TonePattern) -> Result<()> {
        Ok(())
    }
}
