//! Timed client invocations.
//!
//! Each invocation runs the client to completion in the foreground and
//! records its wall-clock duration from a monotonic clock. Invocations never
//! overlap.

use crate::interrupt::Interrupt;
use crate::process::{signal_group, CommandLine};
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How often a running client checks for an interrupt
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Result of one client run
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Exited with status 0
    Succeeded { elapsed: Duration },
    /// Exited non-zero or was killed by a signal (`code` is `None` then)
    Failed { elapsed: Duration, code: Option<i32> },
    /// Killed after exceeding the client timeout
    TimedOut { elapsed: Duration },
    /// Killed because the harness was interrupted; never a sample
    Interrupted { elapsed: Duration },
    /// The client could not be started at all
    SpawnFailed { reason: String },
}

impl Invocation {
    /// Wall-clock time of the run, if the client ran
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Invocation::Succeeded { elapsed }
            | Invocation::Failed { elapsed, .. }
            | Invocation::TimedOut { elapsed }
            | Invocation::Interrupted { elapsed } => Some(*elapsed),
            Invocation::SpawnFailed { .. } => None,
        }
    }

    /// Why the run counts as failed, or `None` on success
    fn failure_reason(&self) -> Option<String> {
        match self {
            Invocation::Succeeded { .. } => None,
            Invocation::Failed { code: Some(c), .. } => Some(format!("exit status {}", c)),
            Invocation::Failed { code: None, .. } => Some("terminated by signal".to_string()),
            Invocation::TimedOut { elapsed } => Some(format!("timed out after {:?}", elapsed)),
            Invocation::Interrupted { .. } => Some("interrupted".to_string()),
            Invocation::SpawnFailed { reason } => Some(format!("spawn failed: {}", reason)),
        }
    }
}

/// Something that can run the client once
pub trait ClientRunner {
    fn invoke(&mut self) -> Invocation;
}

/// What to do with the duration of a failed client run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Leave failed runs out of the sample set
    #[default]
    Exclude,
    /// Keep timed failed runs in the sample set, marked as flagged
    IncludeFlagged,
}

/// One failed invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailure {
    /// Zero-based invocation number within the condition
    pub invocation: usize,
    pub reason: String,
    /// Whether its duration went into the sample set
    pub included: bool,
}

/// Raw observations for one condition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    durations: Vec<f64>,
    failures: Vec<SampleFailure>,
}

impl SampleSet {
    /// Durations in seconds, in invocation order
    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    pub fn failures(&self) -> &[SampleFailure] {
        &self.failures
    }

    /// Samples that came from a successful run
    pub fn valid_count(&self) -> usize {
        self.durations.len() - self.flagged_count()
    }

    /// Failed runs whose duration is in the set
    pub fn flagged_count(&self) -> usize {
        self.failures.iter().filter(|f| f.included).count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

/// Runs the client `n` times and collects a [`SampleSet`]
#[derive(Debug, Clone)]
pub struct Sampler {
    policy: FailurePolicy,
    interrupt: Interrupt,
}

impl Sampler {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            interrupt: Interrupt::new(),
        }
    }

    /// Stop collecting early once `interrupt` is raised
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn collect<C: ClientRunner + ?Sized>(&self, client: &mut C, n: usize) -> SampleSet {
        let mut set = SampleSet {
            durations: Vec::with_capacity(n),
            failures: Vec::new(),
        };

        for invocation in 0..n {
            if self.interrupt.is_raised() {
                debug!(invocation, "Interrupted, no further client runs");
                break;
            }
            let outcome = client.invoke();
            if matches!(outcome, Invocation::Interrupted { .. }) {
                debug!(invocation, "Client run interrupted");
                break;
            }
            let Some(reason) = outcome.failure_reason() else {
                if let Some(elapsed) = outcome.elapsed() {
                    trace!(invocation, elapsed_ms = elapsed.as_secs_f64() * 1e3, "Client run");
                    set.durations.push(elapsed.as_secs_f64());
                }
                continue;
            };

            let kept = match (self.policy, outcome.elapsed()) {
                (FailurePolicy::IncludeFlagged, Some(elapsed)) => {
                    set.durations.push(elapsed.as_secs_f64());
                    true
                }
                _ => false,
            };
            warn!(invocation, %reason, included = kept, "Client run failed");
            set.failures.push(SampleFailure {
                invocation,
                reason,
                included: kept,
            });
        }

        debug!(
            samples = set.durations.len(),
            failed = set.failed_count(),
            "Collected samples"
        );
        set
    }
}

/// Runs the real client executable
pub struct ProcessClient {
    command: CommandLine,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    quiet: bool,
    interrupt: Interrupt,
}

impl ProcessClient {
    pub fn new(
        command: CommandLine,
        working_dir: PathBuf,
        timeout: Option<Duration>,
        quiet: bool,
    ) -> Self {
        Self {
            command,
            working_dir,
            timeout,
            quiet,
            interrupt: Interrupt::new(),
        }
    }

    /// Kill a running client once `interrupt` is raised
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Why the client was killed before it exited on its own
enum Killed {
    Timeout,
    Interrupt,
}

impl ClientRunner for ProcessClient {
    fn invoke(&mut self) -> Invocation {
        let mut cmd = self.command.command(&self.working_dir);
        cmd.process_group(0).stdin(Stdio::null());
        if self.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Invocation::SpawnFailed {
                    reason: e.to_string(),
                }
            }
        };

        // Block on a waiter thread so the timing is not quantised by polling.
        let pgid = child.id() as i32;
        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let _ = tx.send(child.wait());
        });

        let deadline = self.timeout.map(|t| start + t);
        let (result, killed) = loop {
            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(INTERRUPT_POLL),
                None => INTERRUPT_POLL,
            };
            match rx.recv_timeout(slice) {
                Ok(result) => break (Some(result), None),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let killed = if self.interrupt.is_raised() {
                        Killed::Interrupt
                    } else if deadline.is_some_and(|d| Instant::now() >= d) {
                        Killed::Timeout
                    } else {
                        continue;
                    };
                    signal_group(pgid, libc::SIGKILL);
                    break (rx.recv().ok(), Some(killed));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break (None, None),
            }
        };
        let elapsed = start.elapsed();
        let _ = waiter.join();

        match (result, killed) {
            (_, Some(Killed::Timeout)) => Invocation::TimedOut { elapsed },
            (_, Some(Killed::Interrupt)) => Invocation::Interrupted { elapsed },
            (Some(Ok(status)), None) => classify(status, elapsed),
            (Some(Err(e)), None) => Invocation::SpawnFailed {
                reason: format!("wait failed: {}", e),
            },
            (None, None) => Invocation::SpawnFailed {
                reason: "client waiter exited without a status".to_string(),
            },
        }
    }
}

fn classify(status: std::process::ExitStatus, elapsed: Duration) -> Invocation {
    if status.success() {
        Invocation::Succeeded { elapsed }
    } else {
        Invocation::Failed {
            elapsed,
            code: status.code(),
        }
    }
}
