use crate::band::{BandEdits, ColorBand, ColorBandSource, SharedBand};
use anyhow::{Context, Result};
use opencv::{core::Mat, highgui};
use std::cell::Cell;
use std::sync::Arc;

const KEY_QUIT: i32 = b'q' as i32;
const KEY_ESC: i32 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    Continue,
    Quit,
}

pub trait DisplaySink {
    fn show(&mut self, frame: &Mat) -> Result<DisplayEvent>;
    /// Tears down any windows. Safe to call more than once.
    fn close(&mut self);
}

pub struct HighguiDisplay {
    window: String,
    closed: bool,
}

impl HighguiDisplay {
    pub fn open(window: &str) -> Result<Self> {
        highgui::named_window(window, highgui::WINDOW_AUTOSIZE)
            .with_context(|| format!("Failed to open display window {}", window))?;
        Ok(Self {
            window: window.to_string(),
            closed: false,
        })
    }
}

impl DisplaySink for HighguiDisplay {
    fn show(&mut self, frame: &Mat) -> Result<DisplayEvent> {
        highgui::imshow(&self.window, frame)?;
        let key = highgui::wait_key(1)?;
        if key >= 0 && matches!(key & 0xFF, KEY_QUIT | KEY_ESC) {
            tracing::info!("Exiting capture loop on quit key");
            return Ok(DisplayEvent::Quit);
        }
        Ok(DisplayEvent::Continue)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = highgui::destroy_all_windows() {
            tracing::warn!("Failed to close display windows: {}", err);
        }
    }
}

impl Drop for HighguiDisplay {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sink for runs without a display; frames are dropped after annotation.
#[derive(Debug, Default)]
pub struct HeadlessDisplay;

impl DisplaySink for HeadlessDisplay {
    fn show(&mut self, _frame: &Mat) -> Result<DisplayEvent> {
        Ok(DisplayEvent::Continue)
    }

    fn close(&mut self) {}
}

const TRACKBARS: [&str; 6] = ["LH", "LS", "LV", "UH", "US", "UV"];

/// Tunable band backed by six highgui trackbars. Console edits made to
/// `requested` are pushed into the trackbars before they are read.
pub struct TrackbarBand {
    window: String,
    requested: Arc<SharedBand>,
    seen: Cell<BandEdits>,
}

impl TrackbarBand {
    pub fn create(window: &str, requested: Arc<SharedBand>) -> Result<Self> {
        highgui::named_window(window, highgui::WINDOW_AUTOSIZE)
            .with_context(|| format!("Failed to open trackbar window {}", window))?;
        for name in TRACKBARS {
            highgui::create_trackbar(name, window, None, 255, None)
                .with_context(|| format!("Failed to create trackbar {}", name))?;
        }
        let trackbars = Self {
            window: window.to_string(),
            seen: Cell::new(requested.edits()),
            requested,
        };
        let band = trackbars.requested.snapshot();
        trackbars.apply(&TRACKBARS[..3], band.lower)?;
        trackbars.apply(&TRACKBARS[3..], band.upper)?;
        Ok(trackbars)
    }

    fn apply(&self, names: &[&str], values: [u8; 3]) -> Result<()> {
        for (name, value) in names.iter().zip(values) {
            highgui::set_trackbar_pos(name, &self.window, value as i32)?;
        }
        Ok(())
    }

    /// Moves only the trackbars of a bound the console has edited, so a
    /// slider the operator is dragging on the other bound keeps its position.
    fn sync_console_edits(&self) -> Result<()> {
        let edits = self.requested.edits();
        let seen = self.seen.get();
        if edits == seen {
            return Ok(());
        }
        let band = self.requested.snapshot();
        if edits.lower != seen.lower {
            self.apply(&TRACKBARS[..3], band.lower)?;
        }
        if edits.upper != seen.upper {
            self.apply(&TRACKBARS[3..], band.upper)?;
        }
        tracing::debug!("Applied console band {} to trackbars", band);
        self.seen.set(edits);
        Ok(())
    }
}

impl ColorBandSource for TrackbarBand {
    fn current(&self) -> Result<ColorBand> {
        self.sync_console_edits()?;

        let mut values = [0u8; 6];
        for (slot, name) in values.iter_mut().zip(TRACKBARS) {
            let pos = highgui::get_trackbar_pos(name, &self.window)?;
            *slot = pos.clamp(0, 255) as u8;
        }
        tracing::debug!(
            "Trackbar values: LH={} LS={} LV={} UH={} US={} UV={}",
            values[0],
            values[1],
            values[2],
            values[3],
            values[4],
            values[5]
        );
        // Inverted positions are tolerated; they simply match nothing.
        Ok(ColorBand {
            lower: [values[0], values[1], values[2]],
            upper: [values[3], values[4], values[5]],
        })
    }
}
