//! Gauge registry shared by every device sampler.
//!
//! Lookups go straight to the shared map. Creation is funneled through a
//! request channel drained by a single writer task, so a metric name is
//! registered at most once no matter how many devices report it at the same
//! time. Values are per-device atomics inside each gauge and never take the
//! map lock.

use std::{
	borrow::Borrow,
	collections::BTreeMap,
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
};

use prometheus_exporter_base::{MetricType, PrometheusInstance, PrometheusMetric};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

const METRIC_PREFIX: &str = "upsc_";
const DEVICE_LABEL: &str = "ups";

/// Normalized metric name: `upsc_` followed by the field with `.` replaced by `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricName(String);

impl MetricName {
	pub fn from_field(field: &str) -> Self {
		Self(format!("{METRIC_PREFIX}{}", field.replace('.', "_")))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for MetricName {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MetricName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Index of a configured device; its label value lives in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

#[derive(Default)]
struct Slot {
	present: AtomicBool,
	bits: AtomicU64,
}

/// A gauge with one value slot per configured device.
pub struct Gauge {
	name: MetricName,
	field: String,
	slots: Box<[Slot]>,
}

impl Gauge {
	fn new(name: MetricName, field: String, devices: usize) -> Self {
		Self {
			name,
			field,
			slots: (0..devices).map(|_| Slot::default()).collect(),
		}
	}

	pub fn set(&self, device: DeviceId, value: f64) {
		if let Some(slot) = self.slots.get(device.0) {
			slot.bits.store(value.to_bits(), Ordering::Relaxed);
			slot.present.store(true, Ordering::Release);
		}
	}

	pub fn get(&self, device: DeviceId) -> Option<f64> {
		let slot = self.slots.get(device.0)?;
		slot.present.load(Ordering::Acquire).then(|| f64::from_bits(slot.bits.load(Ordering::Relaxed)))
	}
}

impl fmt::Debug for Gauge {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Gauge").field("name", &self.name).field("field", &self.field).finish_non_exhaustive()
	}
}

#[derive(Error, Debug)]
pub enum RegistryError {
	#[error("registry writer has stopped")]
	WriterClosed,
}

struct CreateRequest {
	name: MetricName,
	field: String,
	reply: oneshot::Sender<Arc<Gauge>>,
}

type GaugeMap = Arc<RwLock<BTreeMap<MetricName, Arc<Gauge>>>>;

#[derive(Clone)]
pub struct Registry {
	devices: Arc<[String]>,
	gauges: GaugeMap,
	requests: mpsc::UnboundedSender<CreateRequest>,
}

impl Registry {
	/// Builds the registry and spawns its writer task on the current runtime.
	pub fn start(devices: Vec<String>) -> Self {
		let devices: Arc<[String]> = devices.into();
		let gauges = GaugeMap::default();
		let (requests, receiver) = mpsc::unbounded_channel();
		tokio::spawn(run_writer(receiver, gauges.clone(), devices.len()));
		Self { devices, gauges, requests }
	}

	pub fn devices(&self) -> impl Iterator<Item = (DeviceId, &str)> {
		self.devices.iter().enumerate().map(|(i, name)| (DeviceId(i), name.as_str()))
	}

	pub async fn get_existing(&self, name: &str) -> Option<Arc<Gauge>> {
		self.gauges.read().await.get(name).cloned()
	}

	/// Asks the writer to create the gauge for `field`. Answers with the
	/// existing gauge if another request got there first.
	pub async fn ensure_created(&self, field: &str) -> Result<Arc<Gauge>, RegistryError> {
		let (reply, response) = oneshot::channel();
		self.requests
			.send(CreateRequest {
				name: MetricName::from_field(field),
				field: field.to_owned(),
				reply,
			})
			.map_err(|_| RegistryError::WriterClosed)?;
		response.await.map_err(|_| RegistryError::WriterClosed)
	}

	pub async fn get_or_create(&self, field: &str) -> Result<Arc<Gauge>, RegistryError> {
		match self.get_existing(MetricName::from_field(field).as_str()).await {
			Some(gauge) => Ok(gauge),
			None => self.ensure_created(field).await,
		}
	}

	pub async fn series_count(&self) -> usize {
		self.gauges.read().await.len()
	}

	/// Renders every gauge that has at least one device value.
	pub async fn render(&self) -> String {
		let gauges: Vec<_> = self.gauges.read().await.values().cloned().collect();
		let mut rendered = String::new();
		for gauge in gauges {
			let values: Vec<_> = self.devices().filter_map(|(id, device)| gauge.get(id).map(|v| (device, v))).collect();
			if values.is_empty() {
				continue;
			}
			let help = format!("Value of {} reported by upsc.", gauge.field);
			let mut metric = PrometheusMetric::build()
				.with_name(gauge.name.as_str())
				.with_help(help.as_str())
				.with_metric_type(MetricType::Gauge)
				.build();
			for (device, value) in values {
				metric.render_and_append_instance(&PrometheusInstance::new().with_label(DEVICE_LABEL, device).with_value(value));
			}
			rendered += &metric.render();
		}
		rendered
	}
}

async fn run_writer(mut requests: mpsc::UnboundedReceiver<CreateRequest>, gauges: GaugeMap, devices: usize) {
	while let Some(CreateRequest { name, field, reply }) = requests.recv().await {
		let gauge = {
			let mut gauges = gauges.write().await;
			gauges
				.entry(name)
				.or_insert_with_key(|name| {
					info!(metric = %name, %field, "creating metric");
					Arc::new(Gauge::new(name.clone(), field, devices))
				})
				.clone()
		};
		// The requester may have gone away; the gauge stays registered regardless.
		let _ = reply.send(gauge);
	}
}
