//! Configuration module for the benchmark harness.
//!
//! Supports both command-line arguments and a TOML settings file.
//! CLI arguments take precedence over settings file values. Defaults
//! reproduce the packet-size sweep: field `p` over 1..=10, 50 runs each,
//! server rebuilt and restarted per value.

use crate::process::{CommandLine, ControllerSettings, ProbeTarget, Readiness};
use crate::report::ChartStyle;
use crate::runner::{ExperimentPlan, Topology};
use crate::sampler::FailurePolicy;
use crate::stats::DEFAULT_CONFIDENCE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the harness
#[derive(Parser, Debug, Default)]
#[command(name = "benchkit")]
#[command(version)]
#[command(
    about = "Sweep a config field, time a client against a server, plot mean ± CI",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Config artifact field to vary (e.g. p, num_clients)
    #[arg(short, long)]
    pub field: Option<String>,

    /// Comma-separated condition values (e.g. 1,2,3)
    #[arg(long, value_delimiter = ',')]
    pub values: Option<Vec<i64>>,

    /// Client runs per condition
    #[arg(short = 'n', long)]
    pub repetitions: Option<usize>,

    /// Confidence level for the interval (0 < c < 1)
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Restart the server per value, or keep one server for the run
    #[arg(short, long, value_enum)]
    pub topology: Option<Topology>,

    /// Output image path, relative to the current directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML settings file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `start..end` stepping by `step`, end exclusive
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_step")]
    pub step: i64,
}

impl RangeConfig {
    fn values(&self) -> Result<Vec<i64>, SettingsError> {
        if self.step <= 0 {
            return Err(SettingsError::Invalid(format!(
                "range step must be positive, got {}",
                self.step
            )));
        }
        let mut values = Vec::new();
        let mut v = self.start;
        while v < self.end {
            values.push(v);
            v = match v.checked_add(self.step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(values)
    }
}

/// Experiment-related settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Configuration artifact shared with the server and client, relative
    /// to `working_dir`
    #[serde(default = "default_artifact")]
    pub config_path: PathBuf,
    /// Directory the build, server and client commands run in
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_field")]
    pub field: String,
    /// Explicit condition list; takes precedence over `range`
    pub values: Option<Vec<i64>>,
    pub range: Option<RangeConfig>,
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub topology: Topology,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            config_path: default_artifact(),
            working_dir: default_working_dir(),
            field: default_field(),
            values: None,
            range: None,
            repetitions: default_repetitions(),
            confidence: default_confidence(),
            topology: Topology::default(),
        }
    }
}

/// External commands, each an argv list
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandsConfig {
    /// Server build; an empty list disables it
    #[serde(default = "default_build")]
    pub build: Vec<String>,
    /// Client build, run per condition in the fixed-server topology
    #[serde(default)]
    pub client_build: Vec<String>,
    #[serde(default = "default_server")]
    pub server: Vec<String>,
    #[serde(default = "default_client")]
    pub client: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            build: default_build(),
            client_build: Vec::new(),
            server: default_server(),
            client: default_client(),
        }
    }
}

/// Readiness check mode
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessMode {
    #[default]
    None,
    Tcp,
}

/// Server process settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub readiness: ReadinessMode,
    /// Probe address; if unset, read from the artifact's ip/port fields
    pub ready_addr: Option<String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_ip_field")]
    pub ip_field: String,
    #[serde(default = "default_port_field")]
    pub port_field: String,
    /// Discard server stdout/stderr
    #[serde(default)]
    pub quiet: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            readiness: ReadinessMode::default(),
            ready_addr: None,
            ready_timeout_ms: default_ready_timeout_ms(),
            ip_field: default_ip_field(),
            port_field: default_port_field(),
            quiet: false,
        }
    }
}

/// Client invocation settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Kill a client run after this long; unset means wait forever
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Discard client stdout/stderr
    #[serde(default = "default_true")]
    pub quiet: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            failure_policy: FailurePolicy::default(),
            quiet: true,
        }
    }
}

/// Report output settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Chart path, relative to `experiment.working_dir`
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Optional JSON dump of per-condition results, relative to
    /// `experiment.working_dir`
    pub results: Option<PathBuf>,
    pub title: Option<String>,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            results: None,
            title: None,
            x_label: None,
            y_label: None,
            width: default_width(),
            height: default_height(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_artifact() -> PathBuf {
    PathBuf::from("config.json")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_field() -> String {
    "p".to_string()
}

fn default_step() -> i64 {
    1
}

fn default_repetitions() -> usize {
    50
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

fn default_build() -> Vec<String> {
    vec!["make".to_string(), "build".to_string()]
}

fn default_server() -> Vec<String> {
    vec!["./server".to_string()]
}

fn default_client() -> Vec<String> {
    vec!["./client".to_string()]
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

fn default_ip_field() -> String {
    "server_ip".to_string()
}

fn default_port_field() -> String {
    "server_port".to_string()
}

fn default_true() -> bool {
    true
}

fn default_output() -> PathBuf {
    PathBuf::from("plot.png")
}

fn default_width() -> u32 {
    1000
}

fn default_height() -> u32 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub artifact: PathBuf,
    pub plan: ExperimentPlan,
    pub controller: ControllerSettings,
    pub client: CommandLine,
    pub client_timeout: Option<Duration>,
    pub quiet_client: bool,
    pub output: PathBuf,
    pub results: Option<PathBuf>,
    pub chart: ChartStyle,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, SettingsError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, SettingsError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| SettingsError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| SettingsError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml: TomlConfig) -> Result<Self, SettingsError> {
        let TomlConfig {
            experiment,
            commands,
            server,
            client,
            report,
            logging,
        } = toml;

        let conditions = match (cli.values, experiment.values, experiment.range) {
            (Some(values), _, _) | (None, Some(values), _) => values,
            (None, None, Some(range)) => range.values()?,
            (None, None, None) => (1..=10).collect(),
        };
        if conditions.is_empty() {
            return Err(SettingsError::Invalid("no condition values".to_string()));
        }

        let repetitions = cli.repetitions.unwrap_or(experiment.repetitions);
        if repetitions < 2 {
            return Err(SettingsError::Invalid(format!(
                "repetitions must be at least 2 to form a confidence interval, got {}",
                repetitions
            )));
        }

        let confidence = cli.confidence.unwrap_or(experiment.confidence);
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(SettingsError::Invalid(format!(
                "confidence must be strictly between 0 and 1, got {}",
                confidence
            )));
        }

        let field = cli.field.unwrap_or(experiment.field);
        let topology = cli.topology.unwrap_or(experiment.topology);

        let server_cmd = CommandLine::from_argv(&commands.server)
            .ok_or_else(|| SettingsError::Invalid("commands.server is empty".to_string()))?;
        let client_cmd = CommandLine::from_argv(&commands.client)
            .ok_or_else(|| SettingsError::Invalid("commands.client is empty".to_string()))?;

        let readiness = match server.readiness {
            ReadinessMode::None => Readiness::None,
            ReadinessMode::Tcp => Readiness::Tcp {
                target: match server.ready_addr {
                    Some(addr) => ProbeTarget::Address(addr),
                    None => ProbeTarget::ConfigFields {
                        ip_field: server.ip_field,
                        port_field: server.port_field,
                    },
                },
                timeout: Duration::from_millis(server.ready_timeout_ms),
            },
        };

        // Paths from the settings file are relative to the working dir.
        let working_dir = experiment.working_dir;
        let artifact = working_dir.join(&experiment.config_path);
        let output = match cli.output {
            Some(path) => path,
            None => working_dir.join(&report.output),
        };
        let results = report.results.map(|path| working_dir.join(path));

        let defaults = ChartStyle::default();
        let chart = ChartStyle {
            title: report
                .title
                .unwrap_or_else(|| format!("Completion Time vs {}", field)),
            x_label: report.x_label.unwrap_or_else(|| {
                if field == "p" {
                    defaults.x_label.clone()
                } else {
                    field.clone()
                }
            }),
            y_label: report.y_label.unwrap_or(defaults.y_label),
            width: report.width,
            height: report.height,
        };

        Ok(Config {
            artifact,
            plan: ExperimentPlan {
                field,
                conditions,
                repetitions,
                confidence,
                topology,
                failure_policy: client.failure_policy,
            },
            controller: ControllerSettings {
                working_dir: working_dir.clone(),
                build: CommandLine::from_argv(&commands.build),
                client_build: CommandLine::from_argv(&commands.client_build),
                server: server_cmd,
                shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
                readiness,
                quiet_server: server.quiet,
            },
            client: client_cmd,
            client_timeout: client.timeout_ms.map(Duration::from_millis),
            quiet_client: client.quiet,
            output,
            results,
            chart,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }
}

/// Settings loading errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}
