use crate::{
    annotate,
    band::{ColorBand, ColorBandSource, SharedBand},
    capture::FrameSource,
    display::{DisplayEvent, DisplaySink},
    journal::{timestamp_now, EventJournal, FrameLog},
    mask,
    playback::{FrameRateTracker, PlaybackController},
    regions::{self, Region},
};
use anyhow::{Context, Result};
use opencv::core::{self, Mat, Scalar};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub const ENEMY_LABEL: &str = "Enemy";
pub const ALLY_LABEL: &str = "Ally";

fn enemy_color() -> Scalar {
    Scalar::new(0.0, 0.0, 255.0, 0.0)
}

fn ally_color() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

#[derive(Debug, Default)]
pub struct Detections {
    pub enemies: Vec<Region>,
    pub allies: Vec<Region>,
}

/// Static "Enemy" band plus the tunable "Ally" band, drawn onto the frame.
pub struct DualBandDetector {
    static_band: ColorBand,
    min_area: f64,
}

impl DualBandDetector {
    pub fn new(static_band: ColorBand, min_area: f64) -> Self {
        Self {
            static_band,
            min_area,
        }
    }

    pub fn process(&self, frame: &mut Mat, dynamic: &ColorBand) -> Result<Detections> {
        let hsv = mask::to_hsv(frame)?;
        let ally_mask = mask::build_mask(&hsv, dynamic)?;
        let enemy_mask = mask::build_mask(&hsv, &self.static_band)?;

        let enemies =
            regions::find_regions(&enemy_mask, self.min_area, ENEMY_LABEL, enemy_color())?;
        annotate::annotate(frame, &enemies)?;
        let allies =
            regions::find_regions(&ally_mask, self.min_area, ALLY_LABEL, ally_color())?;
        annotate::annotate(frame, &allies)?;

        tracing::debug!(
            "Enemy regions: {}, Ally regions: {} (ally band {})",
            enemies.len(),
            allies.len(),
            dynamic
        );
        Ok(Detections { enemies, allies })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Cancelled,
    QuitKey,
    EndOfStream,
}

impl fmt::Display for LoopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopOutcome::Cancelled => "cancelled",
            LoopOutcome::QuitKey => "quit_key",
            LoopOutcome::EndOfStream => "end_of_stream",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSummary {
    pub captured: u64,
    pub processed: u64,
    pub outcome: LoopOutcome,
}

/// Releases the source and sink exactly once, on every exit path.
struct Session<'a> {
    source: &'a mut dyn FrameSource,
    sink: &'a mut dyn DisplaySink,
    released: bool,
}

impl Session<'_> {
    fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.source.release();
        self.sink.close();
        tracing::info!("Video capture ended, resources released");
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub struct CaptureLoop {
    detector: DualBandDetector,
    playback: PlaybackController,
    mirror: bool,
    fps: FrameRateTracker,
    observed: Option<Arc<SharedBand>>,
}

impl CaptureLoop {
    pub fn new(detector: DualBandDetector, playback: PlaybackController, mirror: bool) -> Self {
        Self {
            detector,
            playback,
            mirror,
            fps: FrameRateTracker::new(),
            observed: None,
        }
    }

    /// Publishes every ally band the loop reads into `observed`.
    pub fn with_observer(mut self, observed: Arc<SharedBand>) -> Self {
        self.observed = Some(observed);
        self
    }

    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn DisplaySink,
        bands: &dyn ColorBandSource,
        mut journal: Option<&mut EventJournal>,
    ) -> Result<LoopSummary> {
        let mut session = Session {
            source,
            sink,
            released: false,
        };
        let mut captured: u64 = 0;
        let mut processed: u64 = 0;

        let outcome = loop {
            if self.playback.is_stopping() {
                break LoopOutcome::Cancelled;
            }
            let Some(frame) = session.source.read()? else {
                tracing::warn!("Failed to capture frame");
                break LoopOutcome::EndOfStream;
            };
            captured += 1;
            if !self.playback.should_process(captured) {
                continue;
            }
            processed += 1;

            let mut frame = if self.mirror {
                let mut flipped = Mat::default();
                core::flip(&frame, &mut flipped, 1).context("Failed to mirror frame")?;
                flipped
            } else {
                frame
            };

            let dynamic = bands.current()?;
            if let Some(observed) = &self.observed {
                observed.publish(dynamic);
            }
            let detections = self.detector.process(&mut frame, &dynamic)?;
            let fps = self.fps.tick(Instant::now());
            annotate::draw_fps(&mut frame, fps)?;

            if let Some(journal) = journal.as_deref_mut() {
                journal.write_event(&FrameLog {
                    event: "frame",
                    timestamp: timestamp_now(),
                    frame_index: captured,
                    fps,
                    enemies: detections.enemies.len(),
                    allies: detections.allies.len(),
                    dynamic_lower: dynamic.lower,
                    dynamic_upper: dynamic.upper,
                })?;
            }

            if session.sink.show(&frame)? == DisplayEvent::Quit {
                break LoopOutcome::QuitKey;
            }
        };

        session.teardown();
        Ok(LoopSummary {
            captured,
            processed,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::StopToken;
    use anyhow::bail;
    use opencv::core::{Rect, CV_8UC3};
    use opencv::imgproc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn blank_frame() -> Mat {
        Mat::new_rows_cols_with_default(120, 160, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn paint(frame: &mut Mat, rect: Rect, bgr: Scalar) {
        imgproc::rectangle(frame, rect, bgr, imgproc::FILLED, imgproc::LINE_8, 0).unwrap();
    }

    fn green_blob_frame() -> Mat {
        let mut frame = blank_frame();
        paint(&mut frame, Rect::new(60, 40, 30, 30), Scalar::new(0.0, 255.0, 0.0, 0.0));
        frame
    }

    type ReadHook = Box<dyn FnMut(usize) + Send>;

    struct ScriptedSource {
        frames: VecDeque<Mat>,
        fail_after: Option<usize>,
        on_read: Option<ReadHook>,
        reads: usize,
        releases: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(count: usize, releases: Arc<AtomicUsize>) -> Self {
            Self::from_frames((0..count).map(|_| blank_frame()).collect(), releases)
        }

        fn from_frames(frames: VecDeque<Mat>, releases: Arc<AtomicUsize>) -> Self {
            Self {
                frames,
                fail_after: None,
                on_read: None,
                reads: 0,
                releases,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Option<Mat>> {
            self.reads += 1;
            if self.fail_after.is_some_and(|limit| self.reads > limit) {
                bail!("device lost");
            }
            if let Some(hook) = self.on_read.as_mut() {
                hook(self.reads);
            }
            Ok(self.frames.pop_front())
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingSink {
        shown: usize,
        quit_on: Option<usize>,
        closes: Arc<AtomicUsize>,
    }

    impl RecordingSink {
        fn new(closes: Arc<AtomicUsize>) -> Self {
            Self {
                shown: 0,
                quit_on: None,
                closes,
            }
        }
    }

    impl DisplaySink for RecordingSink {
        fn show(&mut self, _frame: &Mat) -> Result<DisplayEvent> {
            self.shown += 1;
            if self.quit_on == Some(self.shown) {
                return Ok(DisplayEvent::Quit);
            }
            Ok(DisplayEvent::Continue)
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn capture_loop(stop: StopToken) -> CaptureLoop {
        CaptureLoop::new(
            DualBandDetector::new(ColorBand::RED, regions::DEFAULT_MIN_AREA),
            PlaybackController::new(5, stop),
            true,
        )
    }

    fn journal_column(path: &std::path::Path, field: &str) -> Vec<u64> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let event: serde_json::Value = serde_json::from_str(line).unwrap();
                event[field].as_u64().unwrap()
            })
            .collect()
    }

    #[test]
    fn detects_one_enemy_and_one_ally() {
        let mut frame = blank_frame();
        let red = Rect::new(10, 20, 30, 30);
        let green = Rect::new(100, 60, 25, 25);
        paint(&mut frame, red, Scalar::new(0.0, 0.0, 255.0, 0.0));
        paint(&mut frame, green, Scalar::new(0.0, 255.0, 0.0, 0.0));

        let detector = DualBandDetector::new(ColorBand::RED, regions::DEFAULT_MIN_AREA);
        let detections = detector.process(&mut frame, &ColorBand::GREEN).unwrap();

        assert_eq!(detections.enemies.len(), 1);
        assert_eq!(detections.enemies[0].label, ENEMY_LABEL);
        assert_eq!(detections.enemies[0].rect, red);
        assert_eq!(detections.enemies[0].color, enemy_color());

        assert_eq!(detections.allies.len(), 1);
        assert_eq!(detections.allies[0].label, ALLY_LABEL);
        assert_eq!(detections.allies[0].rect, green);
        assert_eq!(detections.allies[0].color, ally_color());
    }

    #[test]
    fn only_every_fifth_frame_reaches_the_display() {
        let releases = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = ScriptedSource::new(20, releases.clone());
        let mut sink = RecordingSink::new(closes.clone());
        let bands = SharedBand::new(ColorBand::GREEN);

        let summary = capture_loop(StopToken::new())
            .run(&mut source, &mut sink, &bands, None)
            .unwrap();

        assert_eq!(summary.captured, 20);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.outcome, LoopOutcome::EndOfStream);
        assert_eq!(sink.shown, 4);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_before_capture_reads_nothing() {
        let releases = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = ScriptedSource::new(20, releases.clone());
        let mut sink = RecordingSink::new(closes.clone());
        let stop = StopToken::new();
        stop.cancel();

        let summary = capture_loop(stop)
            .run(&mut source, &mut sink, &SharedBand::new(ColorBand::GREEN), None)
            .unwrap();

        assert_eq!(summary.outcome, LoopOutcome::Cancelled);
        assert_eq!(summary.captured, 0);
        assert_eq!(source.reads, 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_during_run_exits_at_next_poll() {
        let releases = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let stop = StopToken::new();
        let mut source = ScriptedSource::new(20, releases.clone());
        let remote = stop.clone();
        source.on_read = Some(Box::new(move |read| {
            if read == 7 {
                remote.cancel();
            }
        }));
        let mut sink = RecordingSink::new(closes.clone());

        let summary = capture_loop(stop)
            .run(&mut source, &mut sink, &SharedBand::new(ColorBand::GREEN), None)
            .unwrap();

        assert_eq!(summary.outcome, LoopOutcome::Cancelled);
        assert_eq!(summary.captured, 7);
        assert_eq!(summary.processed, 1);
        assert_eq!(source.reads, 7);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_key_ends_the_loop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = ScriptedSource::new(20, Arc::new(AtomicUsize::new(0)));
        let mut sink = RecordingSink::new(closes.clone());
        sink.quit_on = Some(1);

        let summary = capture_loop(StopToken::new())
            .run(&mut source, &mut sink, &SharedBand::new(ColorBand::GREEN), None)
            .unwrap();

        assert_eq!(summary.outcome, LoopOutcome::QuitKey);
        assert_eq!(summary.captured, 5);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_error_still_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut source = ScriptedSource::new(20, releases.clone());
        source.fail_after = Some(3);
        let mut sink = RecordingSink::new(closes.clone());

        let result = capture_loop(StopToken::new()).run(
            &mut source,
            &mut sink,
            &SharedBand::new(ColorBand::GREEN),
            None,
        );

        assert!(result.is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn journal_records_processed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut journal = EventJournal::create(&path).unwrap();
        let mut source = ScriptedSource::new(10, Arc::new(AtomicUsize::new(0)));
        let mut sink = RecordingSink::new(Arc::new(AtomicUsize::new(0)));
        let bands = SharedBand::new(ColorBand::GREEN);

        capture_loop(StopToken::new())
            .run(&mut source, &mut sink, &bands, Some(&mut journal))
            .unwrap();
        journal.flush().unwrap();

        assert_eq!(journal_column(&path, "frame_index"), vec![5, 10]);
    }

    #[test]
    fn detections_follow_band_edits_made_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut journal = EventJournal::create(&path).unwrap();

        let requested = Arc::new(SharedBand::new(ColorBand::GREEN));
        let observed = Arc::new(SharedBand::new(ColorBand::GREEN));
        let frames = (0..20).map(|_| green_blob_frame()).collect();
        let mut source = ScriptedSource::from_frames(frames, Arc::new(AtomicUsize::new(0)));
        let console = requested.clone();
        source.on_read = Some(Box::new(move |read| {
            if read == 7 {
                console.set_lower([100, 40, 40]);
                console.set_upper([130, 255, 255]);
            }
        }));
        let mut sink = RecordingSink::new(Arc::new(AtomicUsize::new(0)));

        capture_loop(StopToken::new())
            .with_observer(observed.clone())
            .run(&mut source, &mut sink, requested.as_ref(), Some(&mut journal))
            .unwrap();
        journal.flush().unwrap();

        assert_eq!(journal_column(&path, "allies"), vec![1, 0, 0, 0]);
        assert_eq!(journal_column(&path, "enemies"), vec![0, 0, 0, 0]);
        let last = observed.snapshot();
        assert_eq!(last.lower, [100, 40, 40]);
        assert_eq!(last.upper, [130, 255, 255]);
    }
}
