use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ghostpixel_protocol::{ColorList, ConfigPatch, ReconcileConfig, ReconcileEvent, StatusReport};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::color::{split_color_list, ColorId};
use crate::error::ColorError;
use crate::events::Emitter;
use crate::governor::{stop_channel, Governor, GovernorTuning, RunOutcome, StopHandle};
use crate::host::HostAdapter;
use crate::policy::SharedPolicy;
use crate::submit::PixelSink;

/// The control surface a UI talks to: start/stop/reconfigure plus progress events.
///
/// At most one reconciliation loop runs per controller. `start` must be called
/// from inside a tokio runtime.
pub struct Controller<H, S> {
    host: Arc<H>,
    sink: Arc<S>,
    policy: Arc<SharedPolicy>,
    tuning: GovernorTuning,
    events: Emitter,
    running: Arc<AtomicBool>,
    stop: Mutex<Option<StopHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H: HostAdapter, S: PixelSink> Controller<H, S> {
    pub fn new(
        host: Arc<H>,
        sink: Arc<S>,
        config: ReconcileConfig,
        tuning: GovernorTuning,
    ) -> Result<Self, ColorError> {
        Ok(Self {
            host,
            sink,
            policy: Arc::new(SharedPolicy::new(config)?),
            tuning,
            events: Emitter::new(256),
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the loop. Returns `false` (and does nothing) if one is already running.
    pub fn start(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("already running");
            return false;
        }

        let (handle, mut signal) = stop_channel();
        let mut governor = Governor::new(
            self.host.clone(),
            self.sink.clone(),
            self.policy.clone(),
            self.tuning.clone(),
            self.events.clone(),
        );
        let events = self.events.clone();
        let running = self.running.clone();
        events.update_status(|s| {
            s.placed = 0;
            s.fixes = 0;
            s.progress = None;
            s.last_error = None;
            s.session_start = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        });

        let task = tokio::spawn(async move {
            let _idle = IdleOnExit {
                running,
                events: events.clone(),
            };
            match governor.run(&mut signal).await {
                Ok(summary) => {
                    let verb = match summary.outcome {
                        RunOutcome::Completed => "completed",
                        RunOutcome::Stopped => "stopped",
                    };
                    info!(
                        placed = summary.placed,
                        fixes = summary.fixes,
                        elapsed_secs = summary.elapsed.as_secs(),
                        "reconciliation {verb}"
                    );
                }
                Err(e) => {
                    error!(error = %e, "reconciliation failed");
                    events.emit(ReconcileEvent::Failed {
                        message: e.to_string(),
                    });
                }
            }
        });

        *lock(&self.stop) = Some(handle);
        *lock(&self.task) = Some(task);
        true
    }

    /// Requests a stop. An in-flight submission finishes first.
    pub fn stop(&self) -> bool {
        match lock(&self.stop).take() {
            Some(handle) => {
                handle.stop();
                info!("stop requested");
                true
            }
            None => false,
        }
    }

    /// Waits for the current loop (if any) to exit.
    pub async fn wait(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "reconciliation task aborted");
            }
        }
    }

    pub fn set_ignored_colors(&self, colors: &ColorList, separator: Option<&str>) -> Result<HashSet<ColorId>, ColorError> {
        let list = match colors {
            ColorList::List(v) => v.clone(),
            ColorList::Joined(s) => split_color_list(s, separator.unwrap_or(",")),
        };
        let ids = self.policy.set_ignored_colors(&list)?;
        info!(count = ids.len(), "new ignored colors");
        Ok(ids)
    }

    /// Forces a full template rebuild on the next pass.
    pub fn reload(&self) {
        info!("template reload requested");
        self.policy.invalidate();
    }

    pub fn config(&self) -> ReconcileConfig {
        self.policy.config()
    }

    pub fn update_config(&self, patch: &ConfigPatch) -> ReconcileConfig {
        self.policy.update(patch)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        let mut s = self.events.status();
        s.running = self.is_running();
        s.mode = self.policy.config().mode;
        s
    }
}

/// Marks the controller idle when the loop task ends, including by panic.
struct IdleOnExit {
    running: Arc<AtomicBool>,
    events: Emitter,
}

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.events.emit(ReconcileEvent::Failed {
                message: "reconciliation task panicked".to_string(),
            });
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
