// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, filter, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

/// Initializes the global `tracing` subscriber from `LOG_LEVEL`/`LOG_FORMAT`.
/// Must be called exactly once, as early in `main` as possible, before any
/// other component logs or reads its own configuration.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let use_json = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()) == "json";
	let filter = default_filter();
	let (filter, reload) = reload::Layer::new(filter);
	LOG_HANDLE
		.set(reload)
		.unwrap_or_else(|_| panic!("setup_logging must only be called once"));

	let registry = tracing_subscriber::registry().with(filter);
	if use_json {
		registry.with(tracing_subscriber::fmt::layer().json()).init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

fn default_filter() -> filter::Targets {
	let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&level).unwrap_or_else(|_| {
		eprintln!("invalid LOG_LEVEL {level:?}, falling back to info");
		filter::Targets::new().with_default(tracing::Level::INFO)
	})
}

type FilteredLayer = filter::Targets;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Dynamically updates the running log level, e.g. from an admin endpoint.
pub fn set_level(directive: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	let new_filter = filter::Targets::from_str(directive)?;
	Ok(handle.modify(|f| *f = new_filter)?)
}

pub fn get_current_loglevel() -> Result<String, Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	Ok(handle.with_current(|f| f.to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}
