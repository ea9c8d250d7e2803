mod annotate;
mod band;
mod capture;
mod console;
mod control;
mod display;
mod journal;
mod mask;
mod pipeline;
mod playback;
mod regions;

use anyhow::{bail, Context, Result};
use band::{ColorBand, ColorBandSource, SharedBand};
use capture::{CameraSource, SourceSpec};
use clap::Parser;
use console::{ColorPriority, Command, Mode};
use control::{ControlBridge, ControlError, Job, RunState, StopToken};
use display::{DisplaySink, HeadlessDisplay, HighguiDisplay, TrackbarBand};
use journal::{timestamp_now, EventJournal, SessionLog, SummaryLog};
use pipeline::{CaptureLoop, DualBandDetector};
use playback::{PlaybackController, DEFAULT_FRAME_SKIP};
use std::{
    io::{self, BufRead},
    path::PathBuf,
    sync::Arc,
};
use tracing_subscriber::EnvFilter;

const DISPLAY_WINDOW: &str = "Camera Feed";
const TRACKBAR_WINDOW: &str = "Trackbars";

#[derive(Parser, Debug)]
#[command(name = "hsvwatch", about = "Dual-color HSV detection on a live camera feed")]
struct Args {
    /// Camera index to open
    #[arg(long, default_value_t = 0, conflicts_with = "file")]
    camera: i32,
    /// Read frames from a video file instead of a camera
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Run detection on every Nth captured frame
    #[arg(
        long,
        default_value_t = DEFAULT_FRAME_SKIP,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    frame_skip: u64,
    /// Regions enclosing this many pixels or fewer are ignored
    #[arg(long, default_value_t = regions::DEFAULT_MIN_AREA)]
    min_area: f64,
    /// Initial ally band lower bound, H,S,V
    #[arg(long, value_delimiter = ',', default_values_t = ColorBand::GREEN.lower)]
    lower: Vec<u8>,
    /// Initial ally band upper bound, H,S,V
    #[arg(long, value_delimiter = ',', default_values_t = ColorBand::GREEN.upper)]
    upper: Vec<u8>,
    /// Do not mirror frames horizontally
    #[arg(long)]
    no_mirror: bool,
    /// Run without any window; the ally band is tuned from the console
    #[arg(long)]
    headless: bool,
    /// Keep the display but tune the ally band from the console
    #[arg(long)]
    no_trackbars: bool,
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,
    #[arg(long, value_enum, default_value_t = ColorPriority::Green)]
    priority: ColorPriority,
    /// Start capturing immediately instead of waiting for `start`
    #[arg(long)]
    autostart: bool,
    #[arg(long)]
    log_json: Option<PathBuf>,
}

impl Args {
    fn source(&self) -> SourceSpec {
        match &self.file {
            Some(path) => SourceSpec::File(path.clone()),
            None => SourceSpec::Camera(self.camera),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    if args.min_area < 0.0 {
        bail!("--min-area must not be negative");
    }
    let lower = triple(&args.lower, "--lower")?;
    let upper = triple(&args.upper, "--upper")?;
    let initial = ColorBand::new(lower, upper)?;
    let surface = ControlSurface::new(args, initial);

    println!("{}", console::HELP);
    if surface.args.autostart {
        surface.request_start(surface.args.mode, surface.args.priority);
    }
    let exit = surface.serve(io::stdin().lock())?;
    surface.shutdown(exit);
    Ok(())
}

fn triple(values: &[u8], flag: &str) -> Result<[u8; 3]> {
    values
        .try_into()
        .ok()
        .with_context(|| format!("{} expects exactly three values H,S,V", flag))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleExit {
    Quit,
    EndOfInput,
}

/// Operator-facing side of the bridge. `requested` carries console band edits
/// to the loop; `active` is the ally band the loop read last.
struct ControlSurface {
    bridge: ControlBridge,
    args: Arc<Args>,
    requested: Arc<SharedBand>,
    active: Arc<SharedBand>,
}

impl ControlSurface {
    fn new(args: Args, initial: ColorBand) -> Self {
        Self {
            bridge: ControlBridge::new(),
            args: Arc::new(args),
            requested: Arc::new(SharedBand::new(initial)),
            active: Arc::new(SharedBand::new(initial)),
        }
    }

    fn serve<R: BufRead>(&self, input: R) -> Result<ConsoleExit> {
        for line in input.lines() {
            let line = line.context("Failed to read console input")?;
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(Command::Quit) => return Ok(ConsoleExit::Quit),
                Ok(command) => self.dispatch(command),
                Err(err) => println!("{:#}", err),
            }
        }
        Ok(ConsoleExit::EndOfInput)
    }

    fn dispatch(&self, command: Command) {
        match command {
            Command::Start { mode, priority } => self.request_start(
                mode.unwrap_or(self.args.mode),
                priority.unwrap_or(self.args.priority),
            ),
            Command::Stop => {
                if let Err(err) = self.bridge.stop() {
                    println!("{}", err);
                }
            }
            Command::Reset => {
                if let Err(err) = self.bridge.reset() {
                    println!("{}", err);
                }
            }
            Command::Status => println!("{}", self.status()),
            Command::Lower(values) => {
                self.requested.set_lower(values);
                self.report_request();
            }
            Command::Upper(values) => {
                self.requested.set_upper(values);
                self.report_request();
            }
            Command::Help => println!("{}", console::HELP),
            Command::Quit => {}
        }
    }

    fn status(&self) -> String {
        format!(
            "status: {} | ally band in use {}",
            self.bridge.state(),
            self.active.snapshot()
        )
    }

    fn report_request(&self) {
        let band = self.requested.snapshot();
        if ColorBand::new(band.lower, band.upper).is_err() {
            println!("ally band {} is inverted on some channel and will match nothing", band);
        } else {
            println!("ally band {} requested; applied on the next processed frame", band);
        }
    }

    /// A quit stops the loop; closed input leaves it running until it ends on
    /// its own.
    fn shutdown(&self, exit: ConsoleExit) -> RunState {
        match exit {
            ConsoleExit::Quit => {
                let _ = self.bridge.stop();
            }
            ConsoleExit::EndOfInput => {
                if self.bridge.state() == RunState::Running {
                    tracing::info!("Console input closed; capture continues until it ends");
                }
            }
        }
        self.bridge.wait()
    }

    fn request_start(&self, mode: Mode, priority: ColorPriority) {
        println!(
            "Mode: {} | Target priority: {}",
            console::value_name(&mode),
            console::value_name(&priority)
        );
        if mode != Mode::Auto {
            tracing::warn!(
                "Mode {} is not implemented; running auto dual-band detection",
                console::value_name(&mode)
            );
        }
        if priority != ColorPriority::Green {
            tracing::warn!(
                "Priority {} is not implemented; ally band stays tunable, enemy band stays red",
                console::value_name(&priority)
            );
        }

        let bands = SessionBands {
            requested: Arc::clone(&self.requested),
            active: Arc::clone(&self.active),
        };
        let args = Arc::clone(&self.args);
        match self.bridge.start(move || launch(args, bands, mode, priority)) {
            Ok(()) => println!("status: running"),
            Err(ControlError::AlreadyRunning) => println!("Video is already running."),
            Err(err) => {
                tracing::error!("{}", err);
                println!("status: {}", self.bridge.state());
            }
        }
    }
}

struct SessionBands {
    requested: Arc<SharedBand>,
    active: Arc<SharedBand>,
}

/// Opens the source on the control thread so an unusable device is reported
/// before the bridge ever reports `Running`.
fn launch(
    args: Arc<Args>,
    bands: SessionBands,
    mode: Mode,
    priority: ColorPriority,
) -> Result<Job> {
    let spec = args.source();
    let source = CameraSource::open(&spec)?;

    let mut journal = match args.log_json.as_ref() {
        Some(path) => Some(EventJournal::create(path)?),
        None => None,
    };
    if let Some(journal) = journal.as_mut() {
        journal.write_event(&SessionLog {
            event: "session_start",
            timestamp: timestamp_now(),
            source: spec.to_string(),
            mode: console::value_name(&mode),
            priority: console::value_name(&priority),
            frame_skip: args.frame_skip,
            min_area: args.min_area,
            mirror: !args.no_mirror,
            static_lower: ColorBand::RED.lower,
            static_upper: ColorBand::RED.upper,
        })?;
        journal.flush()?;
    }

    Ok(Box::new(move |stop: StopToken| {
        session(&args, bands, source, journal, stop)
    }))
}

fn session(
    args: &Args,
    bands: SessionBands,
    mut source: CameraSource,
    mut journal: Option<EventJournal>,
    stop: StopToken,
) -> Result<()> {
    let (mut sink, windowed) = open_display(args);
    let trackbars = if windowed && !args.no_trackbars {
        match TrackbarBand::create(TRACKBAR_WINDOW, Arc::clone(&bands.requested)) {
            Ok(trackbars) => Some(trackbars),
            Err(err) => {
                tracing::warn!("{:#}. Tuning the ally band from the console.", err);
                None
            }
        }
    } else {
        None
    };
    let source_band: &dyn ColorBandSource = match trackbars.as_ref() {
        Some(trackbars) => trackbars,
        None => bands.requested.as_ref(),
    };

    let detector = DualBandDetector::new(ColorBand::RED, args.min_area);
    let playback = PlaybackController::new(args.frame_skip, stop);
    let mut capture_loop = CaptureLoop::new(detector, playback, !args.no_mirror)
        .with_observer(Arc::clone(&bands.active));
    let summary = capture_loop.run(&mut source, sink.as_mut(), source_band, journal.as_mut())?;

    tracing::info!(
        "frames captured={} processed={} outcome={}",
        summary.captured,
        summary.processed,
        summary.outcome
    );
    if let Some(journal) = journal.as_mut() {
        journal.write_event(&SummaryLog {
            event: "session_end",
            timestamp: timestamp_now(),
            captured: summary.captured,
            processed: summary.processed,
            outcome: summary.outcome.to_string(),
        })?;
        journal.flush()?;
    }
    Ok(())
}

fn open_display(args: &Args) -> (Box<dyn DisplaySink>, bool) {
    if args.headless {
        return (Box::new(HeadlessDisplay), false);
    }
    match HighguiDisplay::open(DISPLAY_WINDOW) {
        Ok(display) => (Box::new(display), true),
        Err(err) => {
            tracing::warn!("{:#}. Running headless.", err);
            (Box::new(HeadlessDisplay), false)
        }
    }
}
