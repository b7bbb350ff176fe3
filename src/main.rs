use std::sync::Arc;

use clap::{CommandFactory, Parser};
use futures::{stream::FuturesUnordered, StreamExt};
use prometheus_exporter_base::render_prometheus;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
	config::Cli,
	registry::Registry,
	sampler::{Sampler, SamplerState},
};

mod config;
mod key_filter;
mod line_parser;
mod nut_status;
mod registry;
mod sampler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let config = config::load(Cli::parse()).unwrap_or_else(|e| Cli::command().error(e.kind(), e).exit());
	let filter = Arc::new(config.filter);

	info!(address = %config.server.addr, "starting webserver");
	info!(ups = ?config.devices, "giving metrics for");
	info!(
		keys = ?filter.exact().collect::<Vec<_>>(),
		regexes = ?filter.patterns().collect::<Vec<_>>(),
		"ignoring keys"
	);

	let registry = Registry::start(config.devices);
	let mut states = Vec::new();
	let mut samplers: FuturesUnordered<_> = registry
		.devices()
		.map(|(id, name)| {
			let sampler = Sampler::new(id, name.to_owned(), config.binary.clone(), config.interval, filter.clone(), registry.clone());
			states.push(sampler.subscribe());
			tokio::spawn(sampler.run())
		})
		.collect();

	let stale = registry.clone();
	tokio::spawn(async move {
		while let Some(outcome) = samplers.next().await {
			match outcome {
				Ok(abandoned) => debug!(ups = %abandoned.device, error = %abandoned.error, "sampler stopped"),
				Err(e) => error!(error = %e, "sampler task failed"),
			}
			let sampling = states.iter().filter(|s| *s.borrow() != SamplerState::Abandoned).count();
			info!(sampling, "UPS still being sampled");
		}
		warn!(series = stale.series_count().await, "no UPS left to sample, serving last known values");
	});

	render_prometheus(config.server, (), move |_request, _| async move { Ok(registry.render().await) }).await;

	Ok(())
}
