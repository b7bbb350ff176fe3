//! Per-device polling loop.
//!
//! Each cycle runs `<binary> <device>`, feeds its output through the key
//! filter and line parser, and writes the values into the registry under the
//! device's label. A device whose tool cannot be started is abandoned for the
//! rest of the process lifetime.

use std::{path::PathBuf, process::Stdio, str, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, BufReader},
	process::{Child, Command},
	sync::watch,
	time::sleep,
};
use tracing::{debug, error, warn};

use crate::{
	key_filter::KeyFilter,
	line_parser::{split_line, Parsed},
	registry::{DeviceId, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
	Starting,
	Streaming,
	Draining,
	Idle,
	Abandoned,
}

#[derive(Error, Debug)]
pub enum SpawnError {
	#[error("error executing {binary}: {source}")]
	Spawn {
		binary: String,
		#[source]
		source: std::io::Error,
	},
	#[error("error piping stdout of {binary}")]
	MissingStdout { binary: String },
}

/// Terminal outcome of [`Sampler::run`].
#[derive(Debug)]
pub struct Abandoned {
	pub device: String,
	pub error: SpawnError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
	pub updated: usize,
	pub excluded: usize,
	pub dropped: usize,
}

pub struct Sampler {
	device: DeviceId,
	name: String,
	binary: PathBuf,
	interval: Duration,
	filter: Arc<KeyFilter>,
	registry: Registry,
	state: watch::Sender<SamplerState>,
}

impl Sampler {
	pub fn new(device: DeviceId, name: String, binary: PathBuf, interval: Duration, filter: Arc<KeyFilter>, registry: Registry) -> Self {
		Self {
			device,
			name,
			binary,
			interval,
			filter,
			registry,
			state: watch::Sender::new(SamplerState::Starting),
		}
	}

	pub fn subscribe(&self) -> watch::Receiver<SamplerState> {
		self.state.subscribe()
	}

	/// Polls forever; only returns once the tool can no longer be started.
	pub async fn run(self) -> Abandoned {
		loop {
			match self.cycle().await {
				Ok(summary) => debug!(
					ups = %self.name,
					updated = summary.updated,
					excluded = summary.excluded,
					dropped = summary.dropped,
					"poll cycle finished"
				),
				Err(error) => {
					self.state.send_replace(SamplerState::Abandoned);
					error!(ups = %self.name, %error, "{} will now be ignored", self.name);
					return Abandoned { device: self.name, error };
				},
			}
			self.state.send_replace(SamplerState::Idle);
			sleep(self.interval).await;
		}
	}

	/// One Starting → Streaming → Draining pass.
	pub async fn cycle(&self) -> Result<CycleSummary, SpawnError> {
		self.state.send_replace(SamplerState::Starting);
		let mut child = self.spawn()?;
		let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingStdout {
			binary: self.binary.display().to_string(),
		})?;

		self.state.send_replace(SamplerState::Streaming);
		let summary = self.stream(BufReader::new(stdout)).await;

		self.state.send_replace(SamplerState::Draining);
		self.drain(child).await;
		Ok(summary)
	}

	fn spawn(&self) -> Result<Child, SpawnError> {
		Command::new(&self.binary)
			.arg(&self.name)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.map_err(|source| SpawnError::Spawn {
				binary: self.binary.display().to_string(),
				source,
			})
	}

	/// Applies every line until end of stream or the first read error.
	/// Lines that are not valid UTF-8 are dropped like any other malformed line.
	pub async fn stream<R: AsyncBufRead + Unpin>(&self, reader: R) -> CycleSummary {
		let mut summary = CycleSummary::default();
		let mut lines = reader.split(b'\n');
		loop {
			match lines.next_segment().await {
				Ok(Some(bytes)) => match str::from_utf8(bytes.strip_suffix(b"\r").unwrap_or(&bytes)) {
					Ok(line) => self.apply(line, &mut summary).await,
					Err(e) => {
						debug!(ups = %self.name, error = %e, "dropping line that is not valid UTF-8");
						summary.dropped += 1;
					},
				},
				Ok(None) => break,
				Err(e) => {
					warn!(ups = %self.name, error = %e, "error scanning command output");
					break;
				},
			}
		}
		summary
	}

	async fn apply(&self, line: &str, summary: &mut CycleSummary) {
		let Some(sample) = split_line(line) else {
			summary.dropped += 1;
			return;
		};
		if self.filter.is_excluded(sample.field) {
			debug!(ups = %self.name, key = sample.field, "the key is ignored");
			summary.excluded += 1;
			return;
		}
		let Parsed::Value(value) = sample.parse() else {
			summary.dropped += 1;
			return;
		};
		match self.registry.get_or_create(sample.field).await {
			Ok(gauge) => {
				gauge.set(self.device, value);
				summary.updated += 1;
			},
			Err(e) => warn!(ups = %self.name, key = sample.field, error = %e, "dropping value"),
		}
	}

	async fn drain(&self, mut child: Child) {
		// Closing our end first lets a child blocked on a full pipe exit.
		drop(child.stdout.take());
		match child.wait().await {
			Ok(status) if !status.success() => debug!(ups = %self.name, %status, "upsc exited unsuccessfully"),
			Ok(_) => {},
			Err(e) => warn!(ups = %self.name, error = %e, "error waiting for upsc"),
		}
	}
}
