//! Node-side audio filters and the named presets built on top of them.
//!
//! Filters are a sparse set: only the keys present are sent to the node.
//! Presets are static parameter sets applied through a shallow merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of equalizer bands the node exposes (25 Hz .. 16 kHz).
pub const EQ_BANDS: usize = 15;

/// Centre frequencies of the node's equalizer bands.
const NODE_BAND_FREQUENCIES: [f32; EQ_BANDS] = [
    25.0, 40.0, 63.0, 100.0, 160.0, 250.0, 400.0, 630.0, 1000.0, 1600.0, 2500.0, 4000.0, 6300.0,
    10000.0, 16000.0,
];

/// Centre frequencies of the 10-band dB curves below.
const CURVE_FREQUENCIES: [f32; 10] = [
    32.0,    // Sub-bass
    64.0,    // Bass
    125.0,   // Low-mid
    250.0,   // Mid
    500.0,   // Upper-mid
    1000.0,  // Presence
    2000.0,  // Brilliance
    4000.0,  // High
    8000.0,  // Very high
    16000.0, // Air
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

/// Shared shape of the tremolo and vibrato filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: f32,
    pub sin_scale: f32,
    pub cos_offset: f32,
    pub cos_scale: f32,
    pub tan_offset: f32,
    pub tan_scale: f32,
    pub offset: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

/// Sparse filter map. `None` means "not part of this update".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<Band>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub plugin_filters: Map<String, Value>,
}

impl Filters {
    /// Shallow merge: every key present in `update` replaces the local one.
    pub fn merge(&mut self, update: Filters) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if update.$field.is_some() { self.$field = update.$field; })*
            };
        }
        take!(
            volume,
            equalizer,
            karaoke,
            timescale,
            tremolo,
            vibrato,
            rotation,
            distortion,
            channel_mix,
            low_pass
        );
        self.plugin_filters.extend(update.plugin_filters);
    }

    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }

    /// Every known key set to its neutral value.
    pub fn neutral() -> Self {
        Self {
            volume: Some(1.0),
            equalizer: Some(flat_bands()),
            karaoke: Some(Karaoke {
                level: 0.0,
                mono_level: 0.0,
                filter_band: 0.0,
                filter_width: 0.0,
            }),
            timescale: Some(Timescale {
                speed: 1.0,
                pitch: 1.0,
                rate: 1.0,
            }),
            tremolo: Some(Oscillation {
                frequency: 2.0,
                depth: 0.0,
            }),
            vibrato: Some(Oscillation {
                frequency: 2.0,
                depth: 0.0,
            }),
            rotation: Some(Rotation { rotation_hz: 0.0 }),
            distortion: Some(Distortion {
                sin_offset: 0.0,
                sin_scale: 1.0,
                cos_offset: 0.0,
                cos_scale: 1.0,
                tan_offset: 0.0,
                tan_scale: 1.0,
                offset: 0.0,
                scale: 1.0,
            }),
            channel_mix: Some(ChannelOutput::Stereo.mix()),
            low_pass: Some(LowPass { smoothing: 1.0 }),
            plugin_filters: Map::new(),
        }
    }

    pub fn with_equalizer(gains: &[f32]) -> Self {
        Self {
            equalizer: Some(bands(gains)),
            ..Default::default()
        }
    }

    pub fn with_channel_mix(mix: ChannelMix) -> Self {
        Self {
            channel_mix: Some(mix),
            ..Default::default()
        }
    }
}

fn bands(gains: &[f32]) -> Vec<Band> {
    gains
        .iter()
        .take(EQ_BANDS)
        .enumerate()
        .map(|(band, &gain)| Band {
            band: band as u8,
            gain: gain.clamp(-0.25, 1.0),
        })
        .collect()
}

fn flat_bands() -> Vec<Band> {
    bands(&[0.0; EQ_BANDS])
}

/// 10-band equalizer curve expressed in dB, projected onto the node bands.
#[derive(Debug, Clone, PartialEq)]
pub struct EqCurve {
    pub name: &'static str,
    pub gains_db: [f32; 10],
}

impl EqCurve {
    pub const FLAT: EqCurve = EqCurve {
        name: "flat",
        gains_db: [0.0; 10],
    };
    pub const POP: EqCurve = EqCurve {
        name: "pop",
        gains_db: [-1.0, 2.0, 4.0, 5.0, 3.0, 0.0, -1.0, -1.0, 0.0, 0.0],
    };
    pub const ROCK: EqCurve = EqCurve {
        name: "rock",
        gains_db: [5.0, 4.0, 3.0, 1.0, -1.0, -1.0, 0.0, 2.0, 3.0, 4.0],
    };
    pub const JAZZ: EqCurve = EqCurve {
        name: "jazz",
        gains_db: [0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0],
    };
    pub const CLASSICAL: EqCurve = EqCurve {
        name: "classical",
        gains_db: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -2.0, -2.0, -2.0, -3.0],
    };
    pub const ELECTRONIC: EqCurve = EqCurve {
        name: "electronic",
        gains_db: [5.0, 4.0, 1.0, 0.0, -2.0, 2.0, 1.0, 0.0, 3.0, 4.0],
    };
    pub const VOCAL: EqCurve = EqCurve {
        name: "vocal",
        gains_db: [-2.0, -1.0, 0.0, 2.0, 4.0, 3.0, 2.0, 1.0, 0.0, -1.0],
    };
    pub const SOFT: EqCurve = EqCurve {
        name: "soft",
        gains_db: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -3.0, -4.0, -5.0, -6.0],
    };
    pub const TREBLE_BASS: EqCurve = EqCurve {
        name: "treblebass",
        gains_db: [6.0, 4.0, 2.0, 0.0, -2.0, -2.0, 0.0, 2.0, 4.0, 6.0],
    };

    /// Builds a curve from user gains; each must be within -15..=15 dB.
    pub fn custom(gains_db: [f32; 10]) -> Result<Self> {
        if let Some((band, gain)) = gains_db
            .iter()
            .enumerate()
            .find(|(_, gain)| !(-15.0..=15.0).contains(*gain))
        {
            return Err(Error::Config(format!(
                "gain out of range on band {}: {} dB (expected -15..=15)",
                band + 1,
                gain
            )));
        }
        Ok(Self {
            name: "custom",
            gains_db,
        })
    }

    /// Node band gains. +6 dB maps to 0.25 (double amplitude).
    pub fn node_gains(&self) -> [f32; EQ_BANDS] {
        let mut gains = [0.0; EQ_BANDS];
        for (slot, &frequency) in gains.iter_mut().zip(NODE_BAND_FREQUENCIES.iter()) {
            let nearest = CURVE_FREQUENCIES
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = (frequency.ln() - a.ln()).abs();
                    let db = (frequency.ln() - b.ln()).abs();
                    da.total_cmp(&db)
                })
                .map(|(index, _)| index)
                .unwrap_or(0);
            *slot = (self.gains_db[nearest] / 24.0).clamp(-0.25, 1.0);
        }
        gains
    }

    pub fn filters(&self) -> Filters {
        Filters::with_equalizer(&self.node_gains())
    }
}

/// Output routing presets implemented with channel-mix coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelOutput {
    Stereo,
    Mono,
    Left,
    Right,
    /// -1.0 is hard left, 1.0 hard right.
    Balance(f32),
}

impl ChannelOutput {
    pub fn mix(self) -> ChannelMix {
        match self {
            ChannelOutput::Stereo => ChannelMix {
                left_to_left: 1.0,
                left_to_right: 0.0,
                right_to_left: 0.0,
                right_to_right: 1.0,
            },
            ChannelOutput::Mono => ChannelMix {
                left_to_left: 0.5,
                left_to_right: 0.5,
                right_to_left: 0.5,
                right_to_right: 0.5,
            },
            ChannelOutput::Left => ChannelMix {
                left_to_left: 1.0,
                left_to_right: 0.0,
                right_to_left: 1.0,
                right_to_right: 0.0,
            },
            ChannelOutput::Right => ChannelMix {
                left_to_left: 0.0,
                left_to_right: 1.0,
                right_to_left: 0.0,
                right_to_right: 1.0,
            },
            ChannelOutput::Balance(pan) => {
                let pan = pan.clamp(-1.0, 1.0);
                ChannelMix {
                    left_to_left: (1.0 - pan).min(1.0),
                    left_to_right: 0.0,
                    right_to_left: 0.0,
                    right_to_right: (1.0 + pan).min(1.0),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BassBoost {
    Low,
    Medium,
    High,
    Extreme,
}

impl BassBoost {
    fn gain(self) -> f32 {
        match self {
            BassBoost::Low => 0.1,
            BassBoost::Medium => 0.2,
            BassBoost::High => 0.35,
            BassBoost::Extreme => 0.6,
        }
    }
}

/// Named filter presets.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPreset {
    BassBoost(BassBoost),
    Nightcore,
    Vaporwave,
    Karaoke,
    Tremolo,
    Vibrato,
    /// The "8D" effect.
    Rotation,
    Distortion,
    LowPass,
    Equalizer(EqCurve),
    Channel(ChannelOutput),
}

impl FilterPreset {
    pub fn filters(&self) -> Filters {
        match self {
            FilterPreset::BassBoost(level) => {
                let gain = level.gain();
                let mut gains = [0.0; EQ_BANDS];
                gains[0] = gain;
                gains[1] = gain;
                gains[2] = gain * 0.8;
                gains[3] = gain * 0.5;
                gains[4] = gain * 0.2;
                Filters::with_equalizer(&gains)
            }
            FilterPreset::Nightcore => Filters {
                timescale: Some(Timescale {
                    speed: 1.1,
                    pitch: 1.2,
                    rate: 1.0,
                }),
                ..Default::default()
            },
            FilterPreset::Vaporwave => Filters {
                timescale: Some(Timescale {
                    speed: 0.85,
                    pitch: 0.8,
                    rate: 1.0,
                }),
                ..Default::default()
            },
            FilterPreset::Karaoke => Filters {
                karaoke: Some(Karaoke {
                    level: 1.0,
                    mono_level: 1.0,
                    filter_band: 220.0,
                    filter_width: 100.0,
                }),
                ..Default::default()
            },
            FilterPreset::Tremolo => Filters {
                tremolo: Some(Oscillation {
                    frequency: 4.0,
                    depth: 0.75,
                }),
                ..Default::default()
            },
            FilterPreset::Vibrato => Filters {
                vibrato: Some(Oscillation {
                    frequency: 4.0,
                    depth: 0.75,
                }),
                ..Default::default()
            },
            FilterPreset::Rotation => Filters {
                rotation: Some(Rotation { rotation_hz: 0.2 }),
                ..Default::default()
            },
            FilterPreset::Distortion => Filters {
                distortion: Some(Distortion {
                    sin_offset: 0.0,
                    sin_scale: 1.0,
                    cos_offset: 0.0,
                    cos_scale: 1.0,
                    tan_offset: 0.0,
                    tan_scale: 1.0,
                    offset: 0.0,
                    scale: 1.5,
                }),
                ..Default::default()
            },
            FilterPreset::LowPass => Filters {
                low_pass: Some(LowPass { smoothing: 20.0 }),
                ..Default::default()
            },
            FilterPreset::Equalizer(curve) => curve.filters(),
            FilterPreset::Channel(output) => Filters::with_channel_mix(output.mix()),
        }
    }

    /// Names accepted by [`FromStr`].
    pub fn list() -> Vec<&'static str> {
        vec![
            "bassboost-low",
            "bassboost",
            "bassboost-high",
            "bassboost-extreme",
            "nightcore",
            "vaporwave",
            "karaoke",
            "tremolo",
            "vibrato",
            "8d",
            "distortion",
            "lowpass",
            "pop",
            "rock",
            "jazz",
            "classical",
            "electronic",
            "vocal",
            "soft",
            "treblebass",
            "flat",
            "stereo",
            "mono",
            "left",
            "right",
        ]
    }
}

impl FromStr for FilterPreset {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let preset = match name.to_lowercase().as_str() {
            "bassboost-low" => FilterPreset::BassBoost(BassBoost::Low),
            "bassboost" | "bassboost-medium" => FilterPreset::BassBoost(BassBoost::Medium),
            "bassboost-high" => FilterPreset::BassBoost(BassBoost::High),
            "bassboost-extreme" => FilterPreset::BassBoost(BassBoost::Extreme),
            "nightcore" => FilterPreset::Nightcore,
            "vaporwave" => FilterPreset::Vaporwave,
            "karaoke" => FilterPreset::Karaoke,
            "tremolo" => FilterPreset::Tremolo,
            "vibrato" => FilterPreset::Vibrato,
            "8d" | "rotation" => FilterPreset::Rotation,
            "distortion" => FilterPreset::Distortion,
            "lowpass" => FilterPreset::LowPass,
            "pop" => FilterPreset::Equalizer(EqCurve::POP),
            "rock" => FilterPreset::Equalizer(EqCurve::ROCK),
            "jazz" => FilterPreset::Equalizer(EqCurve::JAZZ),
            "classical" => FilterPreset::Equalizer(EqCurve::CLASSICAL),
            "electronic" => FilterPreset::Equalizer(EqCurve::ELECTRONIC),
            "vocal" => FilterPreset::Equalizer(EqCurve::VOCAL),
            "soft" => FilterPreset::Equalizer(EqCurve::SOFT),
            "treblebass" => FilterPreset::Equalizer(EqCurve::TREBLE_BASS),
            "flat" => FilterPreset::Equalizer(EqCurve::FLAT),
            "stereo" => FilterPreset::Channel(ChannelOutput::Stereo),
            "mono" => FilterPreset::Channel(ChannelOutput::Mono),
            "left" => FilterPreset::Channel(ChannelOutput::Left),
            "right" => FilterPreset::Channel(ChannelOutput::Right),
            _ => return Err(Error::Config(format!("unknown filter preset '{name}'"))),
        };
        Ok(preset)
    }
}

impl fmt::Display for FilterPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPreset::BassBoost(level) => write!(f, "bassboost ({level:?})"),
            FilterPreset::Equalizer(curve) => write!(f, "equalizer ({})", curve.name),
            FilterPreset::Channel(output) => write!(f, "channel ({output:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}
