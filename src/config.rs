//! Startup configuration from CLI flags and environment variables
//!
//! Precedence is flag > environment > default, which clap's `env` support
//! gives us directly. Malformed durations or log levels abort startup.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// paasling - a lightweight PaaS that runs apps in containers spawned on demand
#[derive(Parser, Debug)]
#[command(name = "paasling")]
#[command(version)]
#[command(about = "Hosts registered apps in containers, starting and stopping them with demand")]
pub struct Args {
    /// Address the HTTP server listens on
    #[arg(long, env = "ADDR", default_value = "127.0.0.1:9000")]
    pub addr: String,

    /// Grace period given to a container when stopping it
    #[arg(long = "stop-timeout", env = "DOCKER_STOP_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub stop_timeout: Duration,

    /// How long a cold start may take before the request fails
    #[arg(long = "start-timeout", env = "CONTAINER_START_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub start_timeout: Duration,

    /// Docker network that app containers are connected to
    #[arg(long, env = "DOCKER_NETWORK", default_value = "paasling")]
    pub network: String,

    /// Publish apps through an nginx ingress instead of the /app/ routes alone
    #[arg(long)]
    pub nginx: bool,

    /// Directory nginx server-block fragments are written to
    #[arg(long = "nginx-dir", env = "NGINX_APP_DIR", default_value = "/etc/nginx/apps")]
    pub nginx_dir: PathBuf,

    /// Log level: 0 info, 1 warn, 2 error, 3 off
    #[arg(long = "log", env = "LOG_LEVEL", default_value_t = 0, value_parser = parse_log_level)]
    pub log: u8,
}

/// Immutable configuration record shared by every component
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub network: String,
    pub nginx: bool,
    pub nginx_dir: PathBuf,
    pub log_level: LogLevel,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            addr: args.addr,
            stop_timeout: args.stop_timeout,
            start_timeout: args.start_timeout,
            network: args.network,
            nginx: args.nginx,
            nginx_dir: args.nginx_dir,
            log_level: LogLevel::from_number(args.log),
        }
    }
}

impl Config {
    pub fn parse() -> Self {
        Args::parse().into()
    }
}

/// Severity floor for the logger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    fn from_number(n: u8) -> Self {
        match n {
            0 => LogLevel::Info,
            1 => LogLevel::Warn,
            2 => LogLevel::Error,
            _ => LogLevel::Off,
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn parse_log_level(s: &str) -> Result<u8, String> {
    let n: u8 = s
        .parse()
        .map_err(|_| format!("invalid log level '{}': expected 0-3", s))?;
    if n > 3 {
        return Err(format!("invalid log level '{}': expected 0-3", n));
    }
    Ok(n)
}
