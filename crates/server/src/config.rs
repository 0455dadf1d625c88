use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ghostpixel_engine::{GovernorTuning, DEFAULT_ENDPOINT};
use ghostpixel_protocol::{Mode, ReconcileConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 39333;
pub const DEFAULT_HOST_ORIGIN: &str = "https://geopixels.net";

#[derive(Debug, Default, Parser)]
#[command(name = "ghostpixel-server", version, about = "Local agent that keeps a canvas in sync with a template")]
pub struct Args {
    /// Listen address (loopback by default).
    #[arg(long)]
    pub addr: Option<SocketAddr>,

    /// YAML config file. Defaults to ~/.ghostpixel/config.yaml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Placement endpoint.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Extra page origin allowed through CORS (repeatable).
    #[arg(long = "allow-origin")]
    pub allow_origin: Vec<String>,

    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<Mode>,

    /// Build-mode energy threshold.
    #[arg(long)]
    pub threshold: Option<u32>,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    match s.to_ascii_lowercase().as_str() {
        "build" => Ok(Mode::Build),
        "maintain" => Ok(Mode::Maintain),
        _ => Err(format!("unknown mode {s:?} (expected build or maintain)")),
    }
}

/// Loop timings as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub poll_interval_ms: u64,
    pub diff_every: u32,
    pub maintain_interval_secs: u64,
    pub settle_delay_ms: u64,
    pub energy_stall_timeout_secs: u64,
    pub max_submit_attempts: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        let t = GovernorTuning::default();
        Self {
            poll_interval_ms: t.poll_interval.as_millis() as u64,
            diff_every: t.diff_every,
            maintain_interval_secs: t.maintain_interval.as_secs(),
            settle_delay_ms: t.settle_delay.as_millis() as u64,
            energy_stall_timeout_secs: t.energy_stall_timeout.as_secs(),
            max_submit_attempts: t.max_submit_attempts,
        }
    }
}

impl From<&TuningConfig> for GovernorTuning {
    fn from(c: &TuningConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(c.poll_interval_ms.max(1)),
            diff_every: c.diff_every.max(1),
            maintain_interval: Duration::from_secs(c.maintain_interval_secs.max(1)),
            settle_delay: Duration::from_millis(c.settle_delay_ms.max(1)),
            energy_stall_timeout: Duration::from_secs(c.energy_stall_timeout_secs),
            max_submit_attempts: c.max_submit_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub addr: Option<SocketAddr>,
    pub endpoint: Option<String>,
    pub allowed_origins: Vec<String>,
    pub relog_timeout_secs: u64,
    pub reconcile: ReconcileConfig,
    pub tuning: TuningConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            addr: None,
            endpoint: None,
            allowed_origins: vec![DEFAULT_HOST_ORIGIN.to_string()],
            relog_timeout_secs: 60,
            reconcile: ReconcileConfig::default(),
            tuning: TuningConfig::default(),
        }
    }
}

/// Everything the server needs, after merging file and flags.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub endpoint: String,
    pub allowed_origins: Vec<String>,
    pub relog_timeout: Duration,
    pub reconcile: ReconcileConfig,
    pub tuning: GovernorTuning,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::merge(FileConfig::default(), &Args::default())
    }
}

impl Settings {
    /// Reads the config file (if any) and applies CLI overrides on top.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => read_file_config(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_file_config(&path)?,
                _ => FileConfig::default(),
            },
        };
        Ok(Self::merge(file, args))
    }

    fn merge(file: FileConfig, args: &Args) -> Self {
        let mut reconcile = file.reconcile;
        if let Some(mode) = args.mode {
            reconcile.mode = mode;
        }
        if let Some(t) = args.threshold {
            reconcile.energy_threshold = Some(t);
        }

        let mut allowed_origins = file.allowed_origins;
        for o in &args.allow_origin {
            if !allowed_origins.contains(o) {
                allowed_origins.push(o.clone());
            }
        }

        Self {
            addr: args
                .addr
                .or(file.addr)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT)),
            endpoint: args
                .endpoint
                .clone()
                .or(file.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            allowed_origins,
            relog_timeout: Duration::from_secs(file.relog_timeout_secs),
            reconcile,
            tuning: GovernorTuning::from(&file.tuning),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ghostpixel").join("config.yaml"))
}

pub fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_gaps_with_defaults() {
        let file: FileConfig = serde_yaml::from_str(
            "endpoint: http://127.0.0.1:9/PlacePixel\nreconcile:\n  mode: maintain\n  ignored_colors: ['#000']\ntuning:\n  diff_every: 3\n",
        )
        .unwrap();
        assert_eq!(file.reconcile.mode, Mode::Maintain);
        assert!(file.reconcile.include_free_colors);
        assert_eq!(file.tuning.diff_every, 3);
        assert_eq!(file.tuning.settle_delay_ms, 2000);
        assert_eq!(file.allowed_origins, vec![DEFAULT_HOST_ORIGIN]);
    }

    #[test]
    fn flags_override_the_file() {
        let file = FileConfig {
            endpoint: Some("http://file".into()),
            ..Default::default()
        };
        let args = Args::parse_from([
            "ghostpixel-server",
            "--mode",
            "MAINTAIN",
            "--threshold",
            "40",
            "--allow-origin",
            "https://example.org",
            "--allow-origin",
            DEFAULT_HOST_ORIGIN,
        ]);
        let s = Settings::merge(file, &args);
        assert_eq!(s.endpoint, "http://file");
        assert_eq!(s.reconcile.mode, Mode::Maintain);
        assert_eq!(s.reconcile.energy_threshold, Some(40));
        assert_eq!(s.allowed_origins, vec![DEFAULT_HOST_ORIGIN, "https://example.org"]);
        assert_eq!(s.addr.port(), DEFAULT_PORT);
        assert!(s.addr.ip().is_loopback());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/ghostpixel.yaml")),
            ..Default::default()
        };
        let err = Settings::load(&args).unwrap_err();
        assert!(err.to_string().contains("read config"));
    }

    #[test]
    fn zero_timings_never_spin() {
        let file: FileConfig = serde_yaml::from_str(
            "tuning:\n  poll_interval_ms: 0\n  maintain_interval_secs: 0\n  settle_delay_ms: 0\n  diff_every: 0\n",
        )
        .unwrap();
        let t = GovernorTuning::from(&file.tuning);
        assert!(!t.poll_interval.is_zero());
        assert!(!t.maintain_interval.is_zero());
        assert!(!t.settle_delay.is_zero());
        assert_eq!(t.diff_every, 1);
    }

    #[test]
    fn bad_mode_flag_is_rejected() {
        assert!(Args::try_parse_from(["ghostpixel-server", "--mode", "paint"]).is_err());
    }
}
