use anyhow::{bail, Result};
use opencv::core::Scalar;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Lower/upper bounds in OpenCV HSV units (8-bit hue is 0..=179).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorBand {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl ColorBand {
    /// Fixed red preset used for the "Enemy" band.
    pub const RED: ColorBand = ColorBand {
        lower: [0, 100, 100],
        upper: [10, 255, 255],
    };

    /// Initial green preset for the tunable "Ally" band.
    pub const GREEN: ColorBand = ColorBand {
        lower: [30, 40, 40],
        upper: [80, 255, 255],
    };

    pub fn new(lower: [u8; 3], upper: [u8; 3]) -> Result<Self> {
        for (channel, (lo, hi)) in ["H", "S", "V"].iter().zip(lower.iter().zip(upper.iter())) {
            if lo > hi {
                bail!("{} lower bound {} exceeds upper bound {}", channel, lo, hi);
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn lower_scalar(&self) -> Scalar {
        to_scalar(self.lower)
    }

    pub fn upper_scalar(&self) -> Scalar {
        to_scalar(self.upper)
    }
}

impl fmt::Display for ColorBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}", self.lower, self.upper)
    }
}

fn to_scalar(values: [u8; 3]) -> Scalar {
    Scalar::new(values[0] as f64, values[1] as f64, values[2] as f64, 0.0)
}

/// Supplies the tunable band once per processed frame.
pub trait ColorBandSource {
    fn current(&self) -> Result<ColorBand>;
}

/// Band shared between the console thread and the capture loop.
///
/// Each bound is its own atomic, so a reader may observe a new lower bound with
/// a stale upper bound while an update is in flight. That only lasts one frame.
/// Operator edits are counted per bound so other band sources can pick them up.
#[derive(Debug)]
pub struct SharedBand {
    lower: [AtomicU8; 3],
    upper: [AtomicU8; 3],
    lower_edits: AtomicU64,
    upper_edits: AtomicU64,
}

/// Edit counters of a `SharedBand`, one per bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandEdits {
    pub lower: u64,
    pub upper: u64,
}

impl SharedBand {
    pub fn new(band: ColorBand) -> Self {
        Self {
            lower: band.lower.map(AtomicU8::new),
            upper: band.upper.map(AtomicU8::new),
            lower_edits: AtomicU64::new(0),
            upper_edits: AtomicU64::new(0),
        }
    }

    pub fn set_lower(&self, values: [u8; 3]) {
        store_all(&self.lower, values);
        self.lower_edits.fetch_add(1, Ordering::Release);
    }

    pub fn set_upper(&self, values: [u8; 3]) {
        store_all(&self.upper, values);
        self.upper_edits.fetch_add(1, Ordering::Release);
    }

    /// Records a band without counting it as an operator edit.
    pub fn publish(&self, band: ColorBand) {
        store_all(&self.lower, band.lower);
        store_all(&self.upper, band.upper);
    }

    pub fn edits(&self) -> BandEdits {
        BandEdits {
            lower: self.lower_edits.load(Ordering::Acquire),
            upper: self.upper_edits.load(Ordering::Acquire),
        }
    }

    pub fn snapshot(&self) -> ColorBand {
        ColorBand {
            lower: self.lower.each_ref().map(|v| v.load(Ordering::Relaxed)),
            upper: self.upper.each_ref().map(|v| v.load(Ordering::Relaxed)),
        }
    }
}

fn store_all(slots: &[AtomicU8; 3], values: [u8; 3]) {
    for (slot, value) in slots.iter().zip(values) {
        slot.store(value, Ordering::Relaxed);
    }
}

impl ColorBandSource for SharedBand {
    fn current(&self) -> Result<ColorBand> {
        Ok(self.snapshot())
    }
}
