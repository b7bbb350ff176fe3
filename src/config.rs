use std::{
	collections::HashSet,
	fs,
	io::Read,
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::{Path, PathBuf},
	time::Duration,
};

use clap::{error::ErrorKind, Parser};
use prometheus_exporter_base::prelude::{Authorization, ServerOptions, TlsOptions};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::key_filter::{InvalidPattern, KeyFilter};

const DEFAULT_CONFIG_PATH: &str = "/etc/prometheus/upsc_exporter_config.yaml";

#[derive(Parser, Debug)]
#[command(name = "prometheus_upsc_exporter", version, about = "Exports NUT UPS variables read through upsc as Prometheus gauges")]
pub struct Cli {
	/// UPS to sample, as passed to upsc (repeatable)
	#[arg(short = 'u', long = "ups")]
	pub ups: Vec<String>,
	/// Do not export this key (repeatable)
	#[arg(short = 'e', long = "exclude")]
	pub exclude: Vec<String>,
	/// Do not export keys matching this regex (repeatable)
	#[arg(short = 'E', long = "exclude-regex")]
	pub exclude_regex: Vec<String>,
	/// Path to the upsc executable [default: upsc]
	#[arg(short = 'b', long = "binary")]
	pub binary: Option<PathBuf>,
	/// Port to serve metrics on [default: 8081]
	#[arg(short = 'p', long = "port")]
	pub port: Option<u16>,
	/// IP address to serve metrics on, host names are not resolved [default: 127.0.0.1]
	#[arg(short = 'H', long = "host")]
	pub host: Option<IpAddr>,
	/// Seconds between two samples of the same UPS [default: 5]
	#[arg(short = 'i', long = "interval", value_parser = clap::value_parser!(u64).range(1..))]
	pub interval: Option<u64>,
	/// YAML configuration file, overridden by the flags above
	#[arg(short = 'c', long = "config", env = "CONFIG_PATH")]
	pub config: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ExporterOptions {
	pub host: IpAddr,
	pub port: u16,
	pub ups: Vec<String>,
	pub exclude: Vec<String>,
	pub exclude_regex: Vec<String>,
	pub binary: PathBuf,
	pub interval: u64,
	pub authorization: Authorization,
	pub tls_options: Option<TlsOptions>,
}

impl Default for ExporterOptions {
	fn default() -> Self {
		Self {
			host: IpAddr::V4(Ipv4Addr::LOCALHOST),
			port: 8081,
			ups: vec![],
			exclude: vec![],
			exclude_regex: vec![],
			binary: "upsc".into(),
			interval: 5,
			authorization: Default::default(),
			tls_options: Default::default(),
		}
	}
}

/// Everything the samplers and the HTTP server need, validated.
pub struct ExporterConfig {
	pub devices: Vec<String>,
	pub filter: KeyFilter,
	pub binary: PathBuf,
	pub interval: Duration,
	pub server: ServerOptions,
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("error reading {path}: {source}")]
	Read { path: String, source: std::io::Error },
	#[error("error parsing {path}: {source}")]
	Parse { path: String, source: serde_yaml::Error },
	#[error("no UPS to sample, give at least one with --ups")]
	NoDevices,
	#[error("interval must be at least one second")]
	ZeroInterval,
	#[error(transparent)]
	Pattern(#[from] InvalidPattern),
}

impl ConfigError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ConfigError::Read { .. } => ErrorKind::Io,
			ConfigError::Parse { .. } => ErrorKind::InvalidValue,
			ConfigError::NoDevices => ErrorKind::MissingRequiredArgument,
			ConfigError::ZeroInterval | ConfigError::Pattern(_) => ErrorKind::ValueValidation,
		}
	}
}

/// Reads the configuration file (if any), applies the flags on top and validates the result.
pub fn load(cli: Cli) -> Result<ExporterConfig, ConfigError> {
	let options = match &cli.config {
		Some(path) => ExporterOptions::load(path)?,
		None if Path::new(DEFAULT_CONFIG_PATH).exists() => ExporterOptions::load(Path::new(DEFAULT_CONFIG_PATH))?,
		None => ExporterOptions::default(),
	};
	options.merge(cli).resolve()
}

impl ExporterOptions {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let file = fs::File::open(path).map_err(|source| ConfigError::Read {
			path: path.display().to_string(),
			source,
		})?;
		Self::from_reader(file).map_err(|source| ConfigError::Parse {
			path: path.display().to_string(),
			source,
		})
	}

	pub fn from_reader(reader: impl Read) -> Result<Self, serde_yaml::Error> {
		serde_ignored::deserialize(serde_yaml::Deserializer::from_reader(reader), |path| {
			warn!(key = %path, "ignoring unknown configuration key")
		})
	}

	/// Flags given on the command line win; repeatable flags extend the file's lists.
	pub fn merge(mut self, cli: Cli) -> Self {
		self.ups.extend(cli.ups);
		self.exclude.extend(cli.exclude);
		self.exclude_regex.extend(cli.exclude_regex);
		if let Some(binary) = cli.binary {
			self.binary = binary;
		}
		if let Some(port) = cli.port {
			self.port = port;
		}
		if let Some(host) = cli.host {
			self.host = host;
		}
		if let Some(interval) = cli.interval {
			self.interval = interval;
		}
		self
	}

	pub fn resolve(self) -> Result<ExporterConfig, ConfigError> {
		if self.interval == 0 {
			return Err(ConfigError::ZeroInterval);
		}
		let mut seen = HashSet::new();
		let devices: Vec<String> = self.ups.into_iter().filter(|d| seen.insert(d.clone())).collect();
		if devices.is_empty() {
			return Err(ConfigError::NoDevices);
		}
		Ok(ExporterConfig {
			devices,
			filter: KeyFilter::new(self.exclude, self.exclude_regex)?,
			binary: self.binary,
			interval: Duration::from_secs(self.interval),
			server: ServerOptions {
				addr: SocketAddr::new(self.host, self.port),
				authorization: self.authorization,
				tls_options: self.tls_options,
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use std::{
		net::{Ipv4Addr, SocketAddr},
		path::PathBuf,
		time::Duration,
	};

	use clap::{error::ErrorKind, CommandFactory, Parser};

	use super::{Cli, ConfigError, ExporterOptions};

	fn cli(args: &[&str]) -> Cli {
		Cli::try_parse_from(std::iter::once("prometheus_upsc_exporter").chain(args.iter().copied())).unwrap()
	}

	#[test]
	fn flags_with_defaults() {
		let config = ExporterOptions::default().merge(cli(&["-u", "ups1", "--ups", "ups2", "-e", "driver.version", "-E", r"^battery\."])).resolve().unwrap();
		assert_eq!(config.devices, ["ups1", "ups2"]);
		assert_eq!(config.binary, PathBuf::from("upsc"));
		assert_eq!(config.interval, Duration::from_secs(5));
		assert_eq!(config.server.addr, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 8081));
		assert!(config.filter.is_excluded("driver.version"));
		assert!(config.filter.is_excluded("battery.charge"));
		assert!(!config.filter.is_excluded("ups.status"));
	}

	#[test]
	fn scalar_flags_override_defaults() {
		let config = ExporterOptions::default()
			.merge(cli(&["-u", "ups1", "-b", "/usr/bin/upsc", "-p", "9000", "-H", "0.0.0.0", "-i", "30"]))
			.resolve()
			.unwrap();
		assert_eq!(config.binary, PathBuf::from("/usr/bin/upsc"));
		assert_eq!(config.interval, Duration::from_secs(30));
		assert_eq!(config.server.addr, SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 9000));
	}

	#[test]
	fn host_must_be_an_ip_address() {
		let err = Cli::try_parse_from(["prometheus_upsc_exporter", "-u", "ups1", "-H", "localhost"]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::ValueValidation);
		let help = Cli::command().render_long_help().to_string();
		assert!(help.contains("IP address to serve metrics on"), "{help}");
	}

	#[test]
	fn duplicate_devices_collapse() {
		let config = ExporterOptions::default().merge(cli(&["-u", "ups1", "-u", "ups2", "-u", "ups1"])).resolve().unwrap();
		assert_eq!(config.devices, ["ups1", "ups2"]);
	}

	#[test]
	fn file_then_flags() {
		let yaml = "ups: [ups1]\nexclude: [driver.version]\nport: 9100\ninterval: 10\nnot_a_key: true\n";
		let options = ExporterOptions::from_reader(yaml.as_bytes()).unwrap();
		let config = options.merge(cli(&["-u", "ups2", "-p", "9200"])).resolve().unwrap();
		assert_eq!(config.devices, ["ups1", "ups2"]);
		assert_eq!(config.interval, Duration::from_secs(10));
		assert_eq!(config.server.addr.port(), 9200);
		assert!(config.filter.is_excluded("driver.version"));
	}

	#[test]
	fn missing_devices_is_fatal() {
		let err = ExporterOptions::default().merge(cli(&["-e", "driver.version"])).resolve().err().unwrap();
		assert!(matches!(err, ConfigError::NoDevices));
		assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
	}

	#[test]
	fn malformed_regex_is_fatal() {
		let err = ExporterOptions::default().merge(cli(&["-u", "ups1", "-E", "("])).resolve().err().unwrap();
		assert!(matches!(err, ConfigError::Pattern(_)));
		assert_eq!(err.kind(), ErrorKind::ValueValidation);
	}

	#[test]
	fn zero_interval_is_rejected() {
		assert!(Cli::try_parse_from(["prometheus_upsc_exporter", "-u", "ups1", "-i", "0"]).is_err());
		let options = ExporterOptions::from_reader("ups: [ups1]\ninterval: 0\n".as_bytes()).unwrap();
		assert!(matches!(options.resolve().err().unwrap(), ConfigError::ZeroInterval));
	}

	#[test]
	fn missing_config_file_is_reported() {
		let err = ExporterOptions::load(&PathBuf::from("/nonexistent/upsc_exporter.yaml")).err().unwrap();
		assert_eq!(err.kind(), ErrorKind::Io);
	}
}
