//! Lifecycle of the program under test.
//!
//! Builds the server (and optionally the client), starts the server in its
//! own process group, and tears it down with SIGTERM followed by SIGKILL if
//! it does not exit in time. A `ServerProcess` that is dropped without being
//! stopped tears itself down, so no exit path leaves a server running.

use crate::config_store::Configuration;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a terminated server to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Delay between readiness connect attempts
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period used when a handle is dropped without an explicit stop
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A program plus its arguments, e.g. `["make", "build"]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Split a non-empty argv; returns `None` for an empty list
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Build a `Command` that runs inside `dir`.
    ///
    /// A relative program path containing a separator (`./server`) is
    /// resolved against `dir`; bare names go through `PATH`.
    pub fn command(&self, dir: &Path) -> Command {
        let program = Path::new(&self.program);
        let mut cmd = if program.is_relative() && program.components().count() > 1 {
            Command::new(dir.join(program))
        } else {
            Command::new(&self.program)
        };
        cmd.args(&self.args).current_dir(dir);
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Which build step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    Server,
    Client,
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildTarget::Server => write!(f, "server"),
            BuildTarget::Client => write!(f, "client"),
        }
    }
}

/// Build step failures. Always fatal for the run.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{target} build `{command}` could not be started: {source}")]
    Spawn {
        target: BuildTarget,
        command: String,
        source: std::io::Error,
    },
    #[error("{target} build `{command}` exited with {status}")]
    Failed {
        target: BuildTarget,
        command: String,
        status: ExitStatus,
    },
}

/// Server start failures. Recoverable per condition.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("server `{command}` could not be started: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("server exited during startup with {0}")]
    ExitedEarly(ExitStatus),
    #[error("server not accepting connections on {addr} after {waited:?}")]
    NotReady { addr: SocketAddr, waited: Duration },
    #[error("readiness address unavailable: {0}")]
    ProbeAddress(String),
}

/// How `start_server` decides the server can take clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Return as soon as the process is spawned
    None,
    /// Retry TCP connects until one succeeds or `timeout` passes
    Tcp { target: ProbeTarget, timeout: Duration },
}

/// Where the readiness probe connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// A fixed `host:port`
    Address(String),
    /// Host and port read from fields of the configuration artifact
    ConfigFields { ip_field: String, port_field: String },
}

impl ProbeTarget {
    fn resolve(&self, config: &Configuration) -> Result<SocketAddr, StartError> {
        let text = match self {
            ProbeTarget::Address(addr) => addr.clone(),
            ProbeTarget::ConfigFields {
                ip_field,
                port_field,
            } => {
                let ip = config
                    .get(ip_field)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        StartError::ProbeAddress(format!("field '{}' is not a string", ip_field))
                    })?;
                let port = config
                    .get(port_field)
                    .and_then(|v| v.as_u64())
                    .filter(|p| *p <= u16::MAX as u64)
                    .ok_or_else(|| {
                        StartError::ProbeAddress(format!("field '{}' is not a port", port_field))
                    })?;
                format!("{}:{}", ip, port)
            }
        };

        text.to_socket_addrs()
            .map_err(|e| StartError::ProbeAddress(format!("{}: {}", text, e)))?
            .next()
            .ok_or_else(|| StartError::ProbeAddress(format!("{} resolved to nothing", text)))
    }
}

/// How a server stop concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before the stop request
    AlreadyExited,
    /// Exited after SIGTERM within the timeout
    Graceful,
    /// Ignored SIGTERM and was killed
    Forced,
}

/// A running server and its process group
#[derive(Debug)]
pub struct ServerProcess {
    child: Option<Child>,
    pgid: i32,
}

impl ServerProcess {
    fn new(child: Child) -> Self {
        let pgid = child.id() as i32;
        Self {
            child: Some(child),
            pgid,
        }
    }

    /// OS process id of the server
    pub fn pid(&self) -> u32 {
        self.pgid as u32
    }

    /// SIGTERM the group, wait up to `timeout`, then SIGKILL and reap
    fn terminate(&mut self, timeout: Duration) -> StopOutcome {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return StopOutcome::AlreadyExited,
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid = self.pgid, %status, "Server already exited");
            // Helpers it forked can outlive the leader and hold its port.
            signal_group(self.pgid, libc::SIGKILL);
            self.child = None;
            return StopOutcome::AlreadyExited;
        }

        signal_group(self.pgid, libc::SIGTERM);
        let deadline = Instant::now() + timeout;
        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.pgid, %status, "Server exited");
                    break StopOutcome::Graceful;
                }
                Ok(None) if Instant::now() >= deadline => {
                    warn!(
                        pid = self.pgid,
                        timeout_ms = timeout.as_millis() as u64,
                        "Server ignored SIGTERM, sending SIGKILL"
                    );
                    signal_group(self.pgid, libc::SIGKILL);
                    let _ = child.wait();
                    break StopOutcome::Forced;
                }
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    warn!(pid = self.pgid, error = %e, "Failed to poll server, sending SIGKILL");
                    signal_group(self.pgid, libc::SIGKILL);
                    let _ = child.wait();
                    break StopOutcome::Forced;
                }
            }
        };

        // The leader is reaped; clear out anything it left in its group.
        signal_group(self.pgid, libc::SIGKILL);
        self.child = None;
        outcome
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate(DROP_SHUTDOWN_TIMEOUT);
        }
    }
}

/// Send `signal` to every process in group `pgid`
pub(crate) fn signal_group(pgid: i32, signal: libc::c_int) {
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

/// Operations the experiment runner needs from the program under test
pub trait Subject {
    type Handle;

    fn build_server(&mut self) -> Result<(), BuildError>;

    fn build_client(&mut self) -> Result<(), BuildError>;

    /// Start the server against the configuration currently on disk
    fn start_server(&mut self, config: &Configuration) -> Result<Self::Handle, StartError>;

    /// Stop the server and block until it has exited
    fn stop_server(&mut self, handle: Self::Handle) -> StopOutcome;
}

/// Process-level settings for [`ProcessController`]
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub working_dir: PathBuf,
    pub build: Option<CommandLine>,
    pub client_build: Option<CommandLine>,
    pub server: CommandLine,
    pub shutdown_timeout: Duration,
    pub readiness: Readiness,
    pub quiet_server: bool,
}

/// Builds and runs the real server executable
pub struct ProcessController {
    settings: ControllerSettings,
}

impl ProcessController {
    pub fn new(settings: ControllerSettings) -> Self {
        Self { settings }
    }

    fn run_build(&self, target: BuildTarget, line: &CommandLine) -> Result<(), BuildError> {
        info!(%target, command = %line, "Building");
        let status = line
            .command(&self.settings.working_dir)
            .status()
            .map_err(|source| BuildError::Spawn {
                target,
                command: line.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(BuildError::Failed {
                target,
                command: line.to_string(),
                status,
            });
        }
        debug!(%target, "Build succeeded");
        Ok(())
    }

    fn wait_ready(
        &self,
        server: &mut ServerProcess,
        target: &ProbeTarget,
        timeout: Duration,
        config: &Configuration,
    ) -> Result<(), StartError> {
        let addr = target.resolve(config)?;
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            if let Some(child) = server.child.as_mut() {
                // The caller drops `server`, which clears the rest of the group.
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(StartError::ExitedEarly(status));
                }
            }

            attempts += 1;
            let remaining = timeout.saturating_sub(start.elapsed());
            let connect_timeout = remaining.clamp(Duration::from_millis(1), PROBE_INTERVAL * 4);
            if TcpStream::connect_timeout(&addr, connect_timeout).is_ok() {
                debug!(%addr, attempts, waited_ms = start.elapsed().as_millis() as u64, "Server ready");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                return Err(StartError::NotReady {
                    addr,
                    waited: start.elapsed(),
                });
            }
            std::thread::sleep(PROBE_INTERVAL);
        }
    }
}

impl Subject for ProcessController {
    type Handle = ServerProcess;

    fn build_server(&mut self) -> Result<(), BuildError> {
        match &self.settings.build {
            Some(line) => self.run_build(BuildTarget::Server, line),
            None => Ok(()),
        }
    }

    fn build_client(&mut self) -> Result<(), BuildError> {
        match &self.settings.client_build {
            Some(line) => self.run_build(BuildTarget::Client, line),
            None => Ok(()),
        }
    }

    fn start_server(&mut self, config: &Configuration) -> Result<ServerProcess, StartError> {
        let line = &self.settings.server;
        let mut cmd = line.command(&self.settings.working_dir);
        cmd.process_group(0).stdin(Stdio::null());
        if self.settings.quiet_server {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|source| StartError::Spawn {
            command: line.to_string(),
            source,
        })?;
        let mut server = ServerProcess::new(child);
        info!(pid = server.pid(), command = %line, "Server started");

        if let Readiness::Tcp { target, timeout } = &self.settings.readiness {
            // A failed probe drops `server`, which tears it down.
            self.wait_ready(&mut server, target, *timeout, config)?;
        }
        Ok(server)
    }

    fn stop_server(&mut self, mut handle: ServerProcess) -> StopOutcome {
        let pid = handle.pid();
        let outcome = handle.terminate(self.settings.shutdown_timeout);
        info!(pid, ?outcome, "Server stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> CommandLine {
        let owned: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        CommandLine::from_argv(&owned).unwrap()
    }

    fn settings(dir: &Path, server: CommandLine) -> ControllerSettings {
        ControllerSettings {
            working_dir: dir.to_path_buf(),
            build: None,
            client_build: None,
            server,
            shutdown_timeout: Duration::from_millis(300),
            readiness: Readiness::None,
            quiet_server: true,
        }
    }

    fn empty_config(dir: &Path) -> Configuration {
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"server_ip": "127.0.0.1", "server_port": 1}"#).unwrap();
        ConfigStore::new(path).load().unwrap()
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    /// Like `is_alive`, but an unreaped zombie counts as gone
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    fn gone_within(pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if !is_running(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        !is_running(pid)
    }

    /// Pid written by a server that backgrounds a helper and exits
    fn helper_pid(dir: &Path) -> u32 {
        let path = dir.join("helper.pid");
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(pid) = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                return pid;
            }
            assert!(Instant::now() < deadline, "helper pid never written");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_command_line_display() {
        assert_eq!(argv(&["make", "build"]).to_string(), "make build");
        assert!(CommandLine::from_argv(&[]).is_none());
    }

    #[test]
    fn test_relative_program_resolves_in_working_dir() {
        let dir = TempDir::new().unwrap();
        let cmd = argv(&["./server"]).command(dir.path());
        assert_eq!(cmd.get_program(), dir.path().join("./server").as_os_str());
        assert_eq!(cmd.get_current_dir(), Some(dir.path()));

        let cmd = argv(&["make", "build"]).command(dir.path());
        assert_eq!(cmd.get_program().to_str(), Some("make"));
        let args: Vec<_> = cmd.get_args().filter_map(|a| a.to_str()).collect();
        assert_eq!(args, ["build"]);
    }

    #[test]
    fn test_build_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), argv(&["sleep", "1"]));
        s.build = Some(argv(&["true"]));
        s.client_build = Some(argv(&["sh", "-c", "exit 2"]));
        let mut controller = ProcessController::new(s);

        assert!(controller.build_server().is_ok());
        match controller.build_client() {
            Err(BuildError::Failed { target, status, .. }) => {
                assert_eq!(target, BuildTarget::Client);
                assert_eq!(status.code(), Some(2));
            }
            other => panic!("expected build failure, got {:?}", other),
        }
    }

    #[test]
    fn test_build_missing_program() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path(), argv(&["sleep", "1"]));
        s.build = Some(argv(&["definitely-not-a-real-build-tool"]));
        let mut controller = ProcessController::new(s);
        assert!(matches!(
            controller.build_server(),
            Err(BuildError::Spawn { .. })
        ));
    }

    #[test]
    fn test_no_build_configured_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut controller = ProcessController::new(settings(dir.path(), argv(&["sleep", "1"])));
        assert!(controller.build_server().is_ok());
        assert!(controller.build_client().is_ok());
    }

    #[test]
    fn test_graceful_stop() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let mut controller = ProcessController::new(settings(dir.path(), argv(&["sleep", "30"])));

        let server = controller.start_server(&config).unwrap();
        let pid = server.pid();
        assert!(is_alive(pid));

        assert_eq!(controller.stop_server(server), StopOutcome::Graceful);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_stop_escalates_when_sigterm_ignored() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let server_cmd = argv(&["sh", "-c", "trap '' TERM; exec sleep 30"]);
        let mut controller = ProcessController::new(settings(dir.path(), server_cmd));

        let server = controller.start_server(&config).unwrap();
        let pid = server.pid();
        // Let the shell install its trap before signalling.
        std::thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        assert_eq!(controller.stop_server(server), StopOutcome::Forced);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_stop_after_exit() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let mut controller = ProcessController::new(settings(dir.path(), argv(&["true"])));

        let server = controller.start_server(&config).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(controller.stop_server(server), StopOutcome::AlreadyExited);
    }

    #[test]
    fn test_stop_after_exit_kills_leftover_helpers() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let server_cmd = argv(&["sh", "-c", "sleep 30 & echo $! > helper.pid; exit 0"]);
        let mut controller = ProcessController::new(settings(dir.path(), server_cmd));

        let server = controller.start_server(&config).unwrap();
        let helper = helper_pid(dir.path());
        std::thread::sleep(Duration::from_millis(300));
        assert!(is_running(helper));

        assert_eq!(controller.stop_server(server), StopOutcome::AlreadyExited);
        assert!(gone_within(helper, Duration::from_secs(2)));
    }

    #[test]
    fn test_early_exit_during_readiness_kills_leftover_helpers() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let server_cmd = argv(&["sh", "-c", "sleep 30 & echo $! > helper.pid; exit 3"]);
        let mut s = settings(dir.path(), server_cmd);
        s.readiness = Readiness::Tcp {
            target: ProbeTarget::Address(addr.to_string()),
            timeout: Duration::from_secs(5),
        };
        let mut controller = ProcessController::new(s);

        match controller.start_server(&config) {
            Err(StartError::ExitedEarly(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected early exit, got {:?}", other.map(|s| s.pid())),
        }
        let helper = helper_pid(dir.path());
        assert!(gone_within(helper, Duration::from_secs(2)));
    }

    #[test]
    fn test_drop_tears_down_server() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let mut controller = ProcessController::new(settings(dir.path(), argv(&["sleep", "30"])));

        let server = controller.start_server(&config).unwrap();
        let pid = server.pid();
        drop(server);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_start_missing_server_binary() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let mut controller = ProcessController::new(settings(dir.path(), argv(&["./no-server"])));
        assert!(matches!(
            controller.start_server(&config),
            Err(StartError::Spawn { .. })
        ));
    }

    #[test]
    fn test_readiness_probe_succeeds() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut s = settings(dir.path(), argv(&["sleep", "30"]));
        s.readiness = Readiness::Tcp {
            target: ProbeTarget::Address(addr.to_string()),
            timeout: Duration::from_secs(2),
        };
        let mut controller = ProcessController::new(s);

        let server = controller.start_server(&config).unwrap();
        assert_eq!(controller.stop_server(server), StopOutcome::Graceful);
    }

    #[test]
    fn test_readiness_probe_times_out() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let mut s = settings(dir.path(), argv(&["sleep", "30"]));
        s.readiness = Readiness::Tcp {
            target: ProbeTarget::Address(addr.to_string()),
            timeout: Duration::from_millis(300),
        };
        let mut controller = ProcessController::new(s);

        assert!(matches!(
            controller.start_server(&config),
            Err(StartError::NotReady { .. })
        ));
    }

    #[test]
    fn test_readiness_detects_early_exit() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let mut s = settings(dir.path(), argv(&["sh", "-c", "exit 4"]));
        s.readiness = Readiness::Tcp {
            target: ProbeTarget::ConfigFields {
                ip_field: "server_ip".to_string(),
                port_field: "server_port".to_string(),
            },
            timeout: Duration::from_secs(5),
        };
        let mut controller = ProcessController::new(s);

        match controller.start_server(&config) {
            Err(StartError::ExitedEarly(status)) => assert_eq!(status.code(), Some(4)),
            other => panic!("expected early exit, got {:?}", other.map(|s| s.pid())),
        }
    }

    #[test]
    fn test_probe_target_from_config_fields() {
        let dir = TempDir::new().unwrap();
        let config = empty_config(dir.path());
        let target = ProbeTarget::ConfigFields {
            ip_field: "server_ip".to_string(),
            port_field: "server_port".to_string(),
        };
        assert_eq!(
            target.resolve(&config).unwrap(),
            "127.0.0.1:1".parse::<SocketAddr>().unwrap()
        );

        let missing = ProbeTarget::ConfigFields {
            ip_field: "host".to_string(),
            port_field: "server_port".to_string(),
        };
        assert!(matches!(
            missing.resolve(&config),
            Err(StartError::ProbeAddress(_))
        ));
    }
}
