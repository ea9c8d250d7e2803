use anyhow::Result;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Cooperative cancellation flag handed to the capture loop.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::StopRequested => "stopping",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("capture loop is already running")]
    AlreadyRunning,
    #[error("capture loop is not running")]
    NotRunning,
    #[error("failed to start capture loop: {0:#}")]
    Startup(anyhow::Error),
    #[error("failed to spawn capture thread")]
    Spawn(#[from] std::io::Error),
}

/// Body of one capture session, run on its own thread.
pub type Job = Box<dyn FnOnce(StopToken) -> Result<()> + Send + 'static>;

struct Run {
    state: RunState,
    stop: StopToken,
    worker: Option<JoinHandle<()>>,
}

/// Start/stop state machine shared by the control surface and the capture loop.
#[derive(Clone)]
pub struct ControlBridge {
    run: Arc<Mutex<Run>>,
}

impl Default for ControlBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBridge {
    pub fn new() -> Self {
        Self {
            run: Arc::new(Mutex::new(Run {
                state: RunState::Idle,
                stop: StopToken::new(),
                worker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Runs `launch` on the calling thread to acquire resources, then spawns
    /// the job it returns. A launch failure leaves the bridge idle.
    pub fn start<F>(&self, launch: F) -> Result<(), ControlError>
    where
        F: FnOnce() -> Result<Job>,
    {
        let mut run = self.lock();
        if matches!(run.state, RunState::Running | RunState::StopRequested) {
            return Err(ControlError::AlreadyRunning);
        }
        if let Some(finished) = run.worker.take() {
            let _ = finished.join();
        }
        run.state = RunState::Idle;

        let job = launch().map_err(ControlError::Startup)?;
        let stop = StopToken::new();
        let bridge = self.clone();
        let token = stop.clone();
        let handle = thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || bridge.supervise(job, token))?;

        run.stop = stop;
        run.worker = Some(handle);
        run.state = RunState::Running;
        tracing::info!("Capture loop started");
        Ok(())
    }

    fn supervise(&self, job: Job, stop: StopToken) {
        match panic::catch_unwind(AssertUnwindSafe(|| job(stop))) {
            Ok(Ok(())) => tracing::info!("Capture loop finished"),
            Ok(Err(err)) => tracing::error!("Capture loop failed: {:#}", err),
            Err(_) => tracing::error!("Capture loop panicked"),
        }
        self.lock().state = RunState::Stopped;
    }

    /// Raises the cancellation flag; the loop exits at its next poll.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut run = self.lock();
        match run.state {
            RunState::Running => {
                run.stop.cancel();
                run.state = RunState::StopRequested;
                tracing::info!("Stop requested");
                Ok(())
            }
            RunState::StopRequested => Ok(()),
            RunState::Idle | RunState::Stopped => Err(ControlError::NotRunning),
        }
    }

    /// Returns a stopped bridge to idle.
    pub fn reset(&self) -> Result<(), ControlError> {
        let mut run = self.lock();
        match run.state {
            RunState::Running | RunState::StopRequested => Err(ControlError::AlreadyRunning),
            RunState::Idle => Ok(()),
            RunState::Stopped => {
                if let Some(finished) = run.worker.take() {
                    let _ = finished.join();
                }
                run.state = RunState::Idle;
                Ok(())
            }
        }
    }

    /// Blocks until the current loop thread, if any, has exited.
    pub fn wait(&self) -> RunState {
        let worker = self.lock().worker.take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        self.state()
    }
}
