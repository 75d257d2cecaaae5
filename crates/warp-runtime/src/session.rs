//! A complete detector run.
//!
//! [`Session`] owns the validated configuration. [`Session::run`] maps the
//! shared state, launches the workers, drives the reporting loop in the
//! calling thread until a stop condition is hit, then stops and collects
//! every other worker.

use crate::affinity::{cpu_for_worker, online_cpus, pin_current_thread};
use crate::clock::{self, SystemClock};
use crate::detector::{Detector, StderrSink};
use crate::reporter::StatusReporter;
use crate::shared::SharedRegion;
use crate::spinlock::LockOwner;
use crate::state::SharedState;
use crate::workers::{ProcessWorkers, WorkerRole};
use nix::unistd::getpid;
use serde::Serialize;
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use warp_common::config::{DetectorConfig, WorkerMode};
use warp_common::error::{WarpError, WarpResult};
use warp_common::source::TimeSource;

/// Final per-source figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    /// Source described.
    pub source: TimeSource,
    /// Warps detected over the whole run.
    pub warps: u64,
    /// Most negative delta seen (0 if none).
    pub worst: i64,
    /// Samples taken by all workers together.
    pub samples: u64,
}

/// What a finished run observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Workers that took part, the reporter included.
    pub tasks: usize,
    /// How they were launched.
    pub worker_mode: WorkerMode,
    /// Loop iterations run by the reporter.
    pub iterations: u64,
    /// Status lines printed.
    pub reports: u64,
    /// Enabled sources, in sampling order.
    pub sources: Vec<SourceSummary>,
}

impl RunSummary {
    /// Warps across every source.
    #[must_use]
    pub fn total_warps(&self) -> u64 {
        self.sources.iter().map(|s| s.warps).sum()
    }
}

struct LoopStats {
    iterations: u64,
    reports: u64,
    reported_loops: [u64; TimeSource::COUNT],
}

impl LoopStats {
    const IDLE: Self = Self {
        iterations: 0,
        reports: 0,
        reported_loops: [0; TimeSource::COUNT],
    };
}

/// A configured detector run.
#[derive(Debug, Clone)]
pub struct Session {
    config: DetectorConfig,
    tasks: NonZeroUsize,
    cpus: usize,
}

impl Session {
    /// Validate `config`, resolve the worker count and probe every enabled
    /// source.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a source cannot
    /// be read on this host.
    pub fn new(config: DetectorConfig) -> WarpResult<Self> {
        config.validate()?;
        clock::probe(config.sources)?;

        let cpus = online_cpus();
        let tasks = config
            .tasks
            .unwrap_or_else(|| NonZeroUsize::new(cpus).unwrap_or(NonZeroUsize::MIN));

        debug!(cpus, tasks = tasks.get(), "Session configured");
        Ok(Self { config, tasks, cpus })
    }

    /// Number of workers, the reporter included.
    #[must_use]
    pub fn tasks(&self) -> usize {
        self.tasks.get()
    }

    /// Online CPUs found at startup.
    #[must_use]
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Startup text: CPU and task counts, then one line per enabled source.
    #[must_use]
    pub fn banner(&self) -> String {
        let mut banner = format!(
            "{} CPUs, running {} parallel test-tasks.\nchecking for time-warps via:\n",
            self.cpus,
            self.tasks()
        );
        for source in self.config.sources.iter() {
            banner.push_str("- ");
            banner.push_str(source.description());
            banner.push('\n');
        }
        banner.push('\n');
        banner
    }

    /// Run until `shutdown` is raised, the configured duration elapses or
    /// the reporter reaches `max_iterations`.
    ///
    /// Status lines go to `out`, each terminated by a carriage return.
    ///
    /// # Errors
    ///
    /// Returns the reporter's error, or else the first worker failure.
    /// Workers are always stopped and collected before returning.
    pub fn run<W: Write>(&self, shutdown: &AtomicBool, out: &mut W) -> WarpResult<RunSummary> {
        let state = SharedRegion::new(SharedState::new())?;

        // Nothing buffered may be inherited by forked children
        out.flush().map_err(io_error)?;

        info!(
            tasks = self.tasks(),
            mode = ?self.config.worker_mode,
            "Starting time-warp detection"
        );

        let stats = match self.config.worker_mode {
            WorkerMode::Process => self.run_processes(&state, shutdown, out),
            WorkerMode::Thread => self.run_threads(&state, shutdown, out),
        }?;

        let snapshot = state.snapshot();
        let summary = RunSummary {
            tasks: self.tasks(),
            worker_mode: self.config.worker_mode,
            iterations: stats.iterations,
            reports: stats.reports,
            sources: self
                .config
                .sources
                .iter()
                .map(|source| {
                    let counters = snapshot[source.index()];
                    SourceSummary {
                        source,
                        warps: counters.warps,
                        worst: counters.worst,
                        samples: stats.reported_loops[source.index()] + counters.loops,
                    }
                })
                .collect(),
        };

        info!(
            iterations = summary.iterations,
            reports = summary.reports,
            warps = summary.total_warps(),
            "Time-warp detection finished"
        );
        Ok(summary)
    }

    fn run_processes<W: Write>(
        &self,
        state: &SharedState,
        shutdown: &AtomicBool,
        out: &mut W,
    ) -> WarpResult<LoopStats> {
        let launcher = getpid();

        let mut workers = ProcessWorkers::spawn(self.tasks, |index| {
            let role = WorkerRole::of(getpid(), launcher);
            let mut sink = std::io::sink();
            match self.worker_loop(state, index, role, shutdown, &mut sink, || Ok(())) {
                Ok(_) => 0,
                Err(e) => {
                    error!(index, error = %e, "Worker failed");
                    1
                }
            }
        })?;

        let role = WorkerRole::of(getpid(), workers.launcher());
        let outcome = self.worker_loop(state, 0, role, shutdown, out, || {
            collect_early_exits(state, &mut workers)
        });

        state.request_stop();
        let reaped = workers.reap();
        let stats = outcome?;
        reaped?;
        Ok(stats)
    }

    fn run_threads<W: Write>(
        &self,
        state: &SharedState,
        shutdown: &AtomicBool,
        out: &mut W,
    ) -> WarpResult<LoopStats> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = (1..self.tasks())
                .map(|index| {
                    let handle = std::thread::Builder::new()
                        .name(format!("warp-worker-{index}"))
                        .spawn_scoped(scope, move || {
                            self.worker_loop(
                                state,
                                index,
                                WorkerRole::Sampler,
                                shutdown,
                                &mut std::io::sink(),
                                || Ok(()),
                            )
                        });
                    (index, handle)
                })
                .collect();

            let mut first_failure = None;
            let mut joinable = Vec::with_capacity(handles.len());
            for (index, handle) in handles {
                match handle {
                    Ok(handle) => joinable.push((index, handle)),
                    Err(e) => {
                        first_failure.get_or_insert(WarpError::Spawn(format!(
                            "thread for worker {index}: {e}"
                        )));
                    }
                }
            }

            let outcome = if first_failure.is_none() {
                self.worker_loop(state, 0, WorkerRole::Reporter, shutdown, out, || Ok(()))
            } else {
                Ok(LoopStats::IDLE)
            };

            state.request_stop();
            for (index, handle) in joinable {
                let result = match handle.join() {
                    Ok(Ok(_)) => continue,
                    Ok(Err(e)) => WarpError::Worker {
                        worker: i64::try_from(index).unwrap_or(i64::MAX),
                        reason: e.to_string(),
                    },
                    Err(_) => WarpError::Worker {
                        worker: i64::try_from(index).unwrap_or(i64::MAX),
                        reason: "panicked".into(),
                    },
                };
                error!(index, error = %result, "Worker failed");
                first_failure.get_or_insert(result);
            }

            let stats = outcome?;
            first_failure.map_or(Ok(stats), Err)
        })
    }

    /// The loop every worker runs. Only the reporter prints and checks the
    /// stop conditions; the rest run until the shared stop flag is raised.
    ///
    /// `on_report` runs after each status line; an error from it ends the
    /// loop.
    fn worker_loop<W, R>(
        &self,
        state: &SharedState,
        index: usize,
        role: WorkerRole,
        shutdown: &AtomicBool,
        out: &mut W,
        mut on_report: R,
    ) -> WarpResult<LoopStats>
    where
        W: Write,
        R: FnMut() -> WarpResult<()>,
    {
        if self.config.pin_workers {
            pin_current_thread(cpu_for_worker(index, self.cpus))?;
        }

        let mut detector = Detector::new(
            state,
            SystemClock,
            StderrSink,
            self.config.sources,
            self.config.samples_per_source,
        );
        let mut reporter = match role {
            WorkerRole::Reporter => Some(StatusReporter::new(
                self.config.sources,
                self.config.report_every,
                self.config.min_report_interval,
                clock::read_tod_us()?,
            )),
            WorkerRole::Sampler => None,
        };
        let deadline = self.config.duration.map(|d| Instant::now() + d);
        let max_iterations = self.config.max_iterations;

        debug!(index, ?role, "Worker loop started");
        let mut iterations = 0u64;

        while !state.stop_requested() {
            if reporter.is_some() {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Shutdown requested");
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Run duration elapsed");
                    break;
                }
            }

            detector.run_iteration()?;
            iterations += 1;

            if let Some(reporter) = reporter.as_mut() {
                if let Some(line) = reporter.tick(state, clock::read_tod_us)? {
                    write!(out, "{line}\r").map_err(io_error)?;
                    out.flush().map_err(io_error)?;
                    on_report()?;
                }
                if max_iterations > 0 && iterations >= max_iterations {
                    info!(iterations, "Iteration limit reached");
                    break;
                }
            }
        }

        debug!(index, iterations, "Worker loop finished");
        Ok(match reporter {
            Some(reporter) => LoopStats {
                iterations,
                reports: reporter.reports(),
                reported_loops: reporter.reported_loops(),
            },
            None => LoopStats {
                iterations,
                ..LoopStats::IDLE
            },
        })
    }
}

/// Fail on any child that exited while the run was still going, freeing
/// the table lock if it died holding it.
fn collect_early_exits(state: &SharedState, workers: &mut ProcessWorkers) -> WarpResult<()> {
    let mut first_failure = None;
    for exit in workers.try_reap() {
        if state.release_abandoned(LockOwner::process(exit.pid)) {
            warn!(pid = exit.pid.as_raw(), "Released table lock held by exited worker");
        }
        first_failure.get_or_insert(WarpError::Worker {
            worker: i64::from(exit.pid.as_raw()),
            reason: exit
                .failure
                .unwrap_or_else(|| "exited before the run ended".into()),
        });
    }
    first_failure.map_or(Ok(()), Err)
}

#[allow(clippy::needless_pass_by_value)]
fn io_error(e: std::io::Error) -> WarpError {
    WarpError::Io(e.to_string())
}
