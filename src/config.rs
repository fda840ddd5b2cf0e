//! Recording configuration resolved from the command line

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::{Parser, ValueEnum};

/// Video container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Container {
    #[default]
    Mkv,
    Mp4,
}

impl Container {
    /// Get file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }

    /// Get GStreamer muxer element name
    pub fn muxer_element(&self) -> &'static str {
        match self {
            Container::Mkv => "matroskamux",
            Container::Mp4 => "mp4mux",
        }
    }
}

/// Record your desktop from PipeWire
#[derive(Debug, Parser)]
#[command(name = "pwrec", version, about)]
pub struct Args {
    /// x264 quantizer (lower is higher quality)
    #[arg(short, long, default_value_t = 18, env = "PWREC_QUALITY")]
    pub quality: u32,

    /// Maximum encoder bitrate in kbps
    #[arg(long = "max-bitrate", default_value_t = 10000, env = "PWREC_MAX_BITRATE")]
    pub max_bitrate: u32,

    /// Output file (defaults to a timestamped file in the home directory)
    #[arg(short, long, env = "PWREC_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Container format
    #[arg(long, value_enum, default_value_t = Container::Mkv, env = "PWREC_CONTAINER")]
    pub container: Container,

    /// Seconds to wait for the pipeline to flush after a stop request
    #[arg(long = "drain-timeout", default_value = "1", value_parser = parse_seconds, env = "PWREC_DRAIN_TIMEOUT")]
    pub drain_timeout: Duration,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

/// Settings for one recording run
#[derive(Debug, Clone, PartialEq)]
pub struct RecordConfig {
    /// Encoder quantizer
    pub quality: u32,
    /// Encoder bitrate ceiling in kbps
    pub max_bitrate_kbps: u32,
    pub output: PathBuf,
    pub container: Container,
    /// Upper bound on shutdown latency once draining starts
    pub drain_timeout: Duration,
}

impl Default for RecordConfig {
    fn default() -> Self {
        let container = Container::default();
        Self {
            quality: 18,
            max_bitrate_kbps: 10000,
            output: default_output_path(container, Local::now()),
            container,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl From<Args> for RecordConfig {
    fn from(args: Args) -> Self {
        let output = args
            .output
            .unwrap_or_else(|| default_output_path(args.container, Local::now()));
        Self {
            quality: args.quality,
            max_bitrate_kbps: args.max_bitrate,
            output,
            container: args.container,
            drain_timeout: args.drain_timeout,
        }
    }
}

impl RecordConfig {
    /// Output file for the stream at `index`
    ///
    /// The first stream writes to `output`; later ones get a `-<index>` suffix.
    pub fn output_for_stream(&self, index: usize) -> PathBuf {
        if index == 0 {
            return self.output.clone();
        }

        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = match self.output.extension() {
            Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
            None => format!("{}-{}", stem, index),
        };
        self.output.with_file_name(file_name)
    }

    /// Warn when the output directory is missing
    pub fn check_output_dir(&self) -> bool {
        match output_dir(&self.output) {
            Some(parent) if !parent.exists() => {
                log::warn!(
                    "Selected output directory {} does not exist",
                    parent.display()
                );
                false
            }
            _ => true,
        }
    }
}

/// `~/<timestamp>.<ext>`, falling back to the working directory without a home
pub fn default_output_path(container: Container, now: DateTime<Local>) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(timestamped_file_name(container, now))
}

fn timestamped_file_name(container: Container, now: DateTime<Local>) -> String {
    format!("{}.{}", now.format("%Y-%m-%d_%H:%M:%S"), container.extension())
}

/// Parent directory of `path`, if it has one
pub fn output_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}
