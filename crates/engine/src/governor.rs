//! Scheduler / energy governor: the reconciliation loop.
//!
//! Each iteration reads energy and the current diff, then either acts (sends a
//! batch sized to the available energy), waits for energy, or finishes. The
//! live diff is recomputed every few polls and always right before a batch, so
//! the tile sampling cost stays bounded while every batch is based on a fresh
//! view of the canvas.

use std::sync::Arc;
use std::time::Duration;

use ghostpixel_protocol::{Mode, Progress, ReconcileEvent};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::diff::{compute_diff, Diff};
use crate::error::{ReconcileError, Result, TemplateError};
use crate::events::Emitter;
use crate::host::{EnergyState, HostAdapter};
use crate::policy::{PolicySnapshot, SharedPolicy};
use crate::sampler::TileSampler;
use crate::submit::{submit_batch, PixelSink, SubmitOutcome};
use crate::template::{load_template, Template};

#[derive(Debug, Clone)]
pub struct GovernorTuning {
    /// How often energy is re-read while waiting.
    pub poll_interval: Duration,
    /// Recompute the live diff every this many polls.
    pub diff_every: u32,
    /// Sleep between checks once maintain mode has nothing to fix.
    pub maintain_interval: Duration,
    /// Time the host needs to apply a canvas refresh before tiles are sampled.
    pub settle_delay: Duration,
    /// Zero energy for this long means the host energy source is broken.
    pub energy_stall_timeout: Duration,
    pub max_submit_attempts: u32,
}

impl Default for GovernorTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            diff_every: 5,
            maintain_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            energy_stall_timeout: Duration::from_secs(60),
            max_submit_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send this many pixels now (never zero).
    Act(usize),
    /// Not enough energy yet.
    Wait,
    /// Build mode converged.
    Complete,
    /// Maintain mode converged; check again later.
    Idle,
}

pub fn effective_threshold(threshold: Option<u32>, max_energy: u32) -> u32 {
    threshold.unwrap_or(max_energy).min(max_energy)
}

/// Energy to accumulate before acting.
pub fn target_energy(mode: Mode, threshold: Option<u32>, max_energy: u32, remaining: usize) -> u32 {
    match mode {
        Mode::Maintain => 1,
        Mode::Build => {
            let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
            let wanted = effective_threshold(threshold, max_energy).min(remaining);
            wanted.max(1).min(max_energy)
        }
    }
}

pub fn batch_size(energy: u32, remaining: usize) -> usize {
    (energy as usize).min(remaining)
}

pub fn decide(mode: Mode, threshold: Option<u32>, energy: &EnergyState, remaining: usize) -> Decision {
    if remaining == 0 {
        return match mode {
            Mode::Build => Decision::Complete,
            Mode::Maintain => Decision::Idle,
        };
    }
    let target = target_energy(mode, threshold, energy.max, remaining);
    let n = batch_size(energy.current, remaining);
    if energy.current >= target && n > 0 {
        Decision::Act(n)
    } else {
        Decision::Wait
    }
}

/// Time until enough energy regenerates to cover what is left.
///
/// Saturates at `Duration::MAX`; a nonsensical rate never panics.
pub fn estimate_remaining(remaining: usize, energy: &EnergyState) -> Duration {
    let missing = remaining.saturating_sub(energy.current as usize);
    if missing == 0 {
        return Duration::ZERO;
    }
    let rate = if energy.rate_secs.is_nan() { 0.0 } else { energy.rate_secs.max(0.0) };
    Duration::try_from_secs_f64(missing as f64 * rate).unwrap_or(Duration::MAX)
}

/// Sender half of the stop signal.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested (or the handle is gone).
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|s| *s).await;
    }

    /// Sleeps for `d`; returns `false` if a stop cut the sleep short.
    pub async fn pause(&mut self, d: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = self.stopped() => false,
        }
    }
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(Arc::new(tx)), StopSignal(rx))
}

/// Bookkeeping for one run.
#[derive(Debug, Clone)]
pub struct ReconcileState {
    pub mode: Mode,
    pub energy_threshold: Option<u32>,
    pub energy: EnergyState,
    pub session_start: OffsetDateTime,
    pub placed: usize,
    /// Pixels repaired in maintain mode after the canvas first matched.
    pub fixes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub placed: usize,
    pub fixes: usize,
    pub elapsed: Duration,
}

enum Pass {
    Ready(Diff),
    NotReady(String),
    Stopped,
}

pub struct Governor<H, S> {
    host: Arc<H>,
    sink: Arc<S>,
    policy: Arc<SharedPolicy>,
    tuning: GovernorTuning,
    events: Emitter,
    sampler: TileSampler<H>,
    template: Option<(u64, Template)>,
    state: ReconcileState,
}

impl<H: HostAdapter, S: PixelSink> Governor<H, S> {
    pub fn new(
        host: Arc<H>,
        sink: Arc<S>,
        policy: Arc<SharedPolicy>,
        tuning: GovernorTuning,
        events: Emitter,
    ) -> Self {
        let snap = policy.snapshot();
        Self {
            sampler: TileSampler::new(host.clone()),
            host,
            sink,
            policy,
            tuning,
            events,
            template: None,
            state: ReconcileState {
                mode: snap.mode,
                energy_threshold: snap.energy_threshold,
                energy: EnergyState::EMPTY,
                session_start: OffsetDateTime::now_utc(),
                placed: 0,
                fixes: 0,
            },
        }
    }

    /// Bookkeeping of the current (or last) run.
    pub fn state(&self) -> &ReconcileState {
        &self.state
    }

    /// Runs until the template is done (build), a stop is requested, or a fatal error.
    pub async fn run(&mut self, stop: &mut StopSignal) -> Result<RunSummary> {
        let started = Instant::now();
        self.state.session_start = OffsetDateTime::now_utc();
        self.events.emit(ReconcileEvent::Started {
            mode: self.policy.snapshot().mode,
        });
        info!("reconciliation started");

        let mut diff: Option<Diff> = None;
        let mut polls_since_diff = 0u32;
        let mut zero_energy_since: Option<Instant> = None;
        let mut converged = false;

        loop {
            if stop.is_stopped() {
                return Ok(self.finish(RunOutcome::Stopped, started));
            }
            self.host.mark_page_visible();
            let policy = self.policy.snapshot();
            self.state.mode = policy.mode;
            self.state.energy_threshold = policy.energy_threshold;

            let template_stale = self
                .template
                .as_ref()
                .map_or(true, |(generation, _)| *generation != policy.generation);
            let mut fresh = false;
            if diff.is_none() || template_stale || polls_since_diff >= self.tuning.diff_every {
                match self.pass(&policy, stop).await? {
                    Pass::Ready(d) => {
                        diff = Some(d);
                        fresh = true;
                        polls_since_diff = 0;
                    }
                    Pass::NotReady(reason) => {
                        warn!(%reason, "not ready, retrying");
                        self.events.emit(ReconcileEvent::NotReady { reason });
                        diff = None;
                        if !stop.pause(self.tuning.poll_interval).await {
                            return Ok(self.finish(RunOutcome::Stopped, started));
                        }
                        continue;
                    }
                    Pass::Stopped => return Ok(self.finish(RunOutcome::Stopped, started)),
                }
            }
            let Some(current) = diff.as_ref() else {
                continue;
            };

            let energy = self.host.energy().unwrap_or(EnergyState::EMPTY);
            self.state.energy = energy;
            let remaining = current.len();
            let total = self.template.as_ref().map_or(0, |(_, t)| t.len());
            self.events.emit(ReconcileEvent::Progress(Progress {
                total,
                remaining,
                eta_secs: estimate_remaining(remaining, &energy).as_secs_f64(),
            }));

            let decision = decide(policy.mode, policy.energy_threshold, &energy, remaining);
            if decision != Decision::Complete && energy.current == 0 {
                let since = *zero_energy_since.get_or_insert_with(Instant::now);
                let waited = since.elapsed();
                if waited >= self.tuning.energy_stall_timeout {
                    return Err(ReconcileError::EnergyNeverInitialized { waited });
                }
            } else {
                zero_energy_since = None;
            }

            match decision {
                Decision::Complete => {
                    info!("all pixels are correctly placed");
                    return Ok(self.finish(RunOutcome::Completed, started));
                }
                Decision::Idle => {
                    if !converged {
                        info!("canvas matches the template, watching for drift");
                        converged = true;
                    }
                    if !stop.pause(self.tuning.maintain_interval).await {
                        return Ok(self.finish(RunOutcome::Stopped, started));
                    }
                    diff = None;
                }
                Decision::Wait => {
                    let target = target_energy(policy.mode, policy.energy_threshold, energy.max, remaining);
                    debug!(energy = energy.current, target, remaining, "waiting for energy");
                    if !stop.pause(self.tuning.poll_interval).await {
                        return Ok(self.finish(RunOutcome::Stopped, started));
                    }
                    polls_since_diff += 1;
                }
                Decision::Act(_) if !fresh => {
                    // Re-sample right before sending.
                    diff = None;
                }
                Decision::Act(n) => {
                    let batch = &current.pixels[..n];
                    info!("placing {}/{} pixels", n, remaining);
                    let outcome = submit_batch(
                        &*self.host,
                        &*self.sink,
                        batch,
                        self.tuning.max_submit_attempts,
                    )
                    .await;
                    match outcome {
                        SubmitOutcome::Placed(count) => {
                            self.state.placed += count;
                            if converged && policy.mode == Mode::Maintain {
                                self.state.fixes += count;
                            }
                            let (placed, fixes) = (self.state.placed, self.state.fixes);
                            self.events.update_status(|s| {
                                s.placed = placed;
                                s.fixes = fixes;
                            });
                            let left = remaining.saturating_sub(count);
                            self.events.emit(ReconcileEvent::BatchPlaced {
                                count,
                                remaining: left,
                            });
                            let after = EnergyState {
                                current: energy.current.saturating_sub(count as u32),
                                ..energy
                            };
                            self.events.emit(ReconcileEvent::Progress(Progress {
                                total,
                                remaining: left,
                                eta_secs: estimate_remaining(left, &after).as_secs_f64(),
                            }));
                        }
                        SubmitOutcome::Failed { status, message } => {
                            self.events.emit(ReconcileEvent::BatchFailed { status, message });
                            if !stop.pause(self.tuning.poll_interval).await {
                                return Ok(self.finish(RunOutcome::Stopped, started));
                            }
                        }
                        SubmitOutcome::SessionEnded => {
                            warn!("logged out, stopping");
                            return Err(ReconcileError::SessionEnded);
                        }
                    }
                    diff = None;
                }
            }
        }
    }

    /// Refreshes the canvas, rebuilds the template if needed, and diffs.
    async fn pass(&mut self, policy: &PolicySnapshot, stop: &mut StopSignal) -> Result<Pass> {
        debug!("synchronizing with the server");
        self.host.refresh_canvas().await;
        if !stop.pause(self.tuning.settle_delay).await {
            return Ok(Pass::Stopped);
        }

        let stale = self
            .template
            .as_ref()
            .map_or(true, |(generation, _)| *generation != policy.generation);
        if stale {
            info!("setting/reloading template pixels");
            let source = self.host.template_source();
            let available = self.host.available_colors();
            match load_template(source.as_ref(), &policy.filter, available.as_ref()) {
                Ok(t) => self.template = Some((policy.generation, t)),
                Err(TemplateError::SourceUnavailable(reason)) => {
                    self.template = None;
                    return Ok(Pass::NotReady(reason.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some((_, template)) = &self.template else {
            return Ok(Pass::NotReady("template not loaded".to_string()));
        };
        self.sampler.begin_pass();
        let diff = compute_diff(template, &mut self.sampler).await;
        info!("found {} pixels to place", diff.len());
        Ok(Pass::Ready(diff))
    }

    fn finish(&mut self, outcome: RunOutcome, started: Instant) -> RunSummary {
        match outcome {
            RunOutcome::Completed => {
                self.events.emit(ReconcileEvent::Completed {
                    placed: self.state.placed,
                });
            }
            RunOutcome::Stopped => {
                info!("reconciliation stopped");
                self.events.emit(ReconcileEvent::Stopped {
                    placed: self.state.placed,
                });
            }
        }
        RunSummary {
            outcome,
            placed: self.state.placed,
            fixes: self.state.fixes,
            elapsed: started.elapsed(),
        }
    }
}
