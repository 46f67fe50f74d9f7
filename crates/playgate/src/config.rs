use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Immutable process configuration, loaded once from the environment at
/// startup (see `Config::load`). Every field has a default; see the
/// `EXTERNAL INTERFACES` table for the env var name and stock default.
#[derive(Debug, Clone)]
pub struct Config {
	pub server_host: IpAddr,
	pub server_port: u16,
	pub debug_mode: bool,
	pub static_files_dir: PathBuf,
	pub max_requests_per_minute: u32,
	pub max_code_length: usize,
	pub max_output_length: usize,
	pub execution_timeout: Duration,
	pub allowed_origins: AllowedOrigins,
	pub go_executable_path: PathBuf,
	pub temp_dir: PathBuf,
	pub cleanup_interval: Duration,
	pub max_cache_size: usize,
	pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub enum AllowedOrigins {
	Any,
	List(Vec<String>),
}

impl Config {
	/// Loads configuration from the process environment, clamping
	/// out-of-floor values to safe minimums (and warning about the clamp)
	/// rather than failing the process. A value that fails to parse as its
	/// target type (e.g. non-numeric `MAX_CODE_LENGTH`) is a hard error.
	pub fn load() -> anyhow::Result<Config> {
		let max_requests_per_minute = clamp_floor(
			"MAX_REQUESTS_PER_MINUTE",
			parse_default("MAX_REQUESTS_PER_MINUTE", 30u32)?,
			1,
		);
		let max_code_length = clamp_floor(
			"MAX_CODE_LENGTH",
			parse_default("MAX_CODE_LENGTH", 10_000usize)?,
			100,
		);
		let execution_timeout = {
			let secs = clamp_floor(
				"EXECUTION_TIMEOUT_SECONDS",
				parse_default("EXECUTION_TIMEOUT_SECONDS", 10u64)?,
				1,
			);
			Duration::from_secs(secs)
		};

		let temp_dir = resolve_temp_dir(parse::<PathBuf>("TEMP_DIR")?);
		let go_executable_path =
			parse_default("GO_EXECUTABLE_PATH", PathBuf::from("/usr/local/go/bin/go"))?;
		if let Err(e) = std::fs::metadata(&go_executable_path) {
			warn!(
				path = %go_executable_path.display(),
				error = %e,
				"compiler/runner binary not found at configured path; runs will fail until this is fixed"
			);
		}

		let config = Config {
			server_host: parse_default("SERVER_HOST", IpAddr::from([0, 0, 0, 0]))?,
			server_port: parse_default("SERVER_PORT", 8080u16)?,
			debug_mode: parse_default("DEBUG_MODE", false)?,
			static_files_dir: parse_default("STATIC_FILES_DIR", PathBuf::from("/app/build"))?,
			max_requests_per_minute,
			max_code_length,
			max_output_length: parse_default("MAX_OUTPUT_LENGTH", 10_000usize)?,
			execution_timeout,
			allowed_origins: parse_allowed_origins(),
			go_executable_path,
			temp_dir,
			cleanup_interval: Duration::from_secs(
				clamp_floor(
					"CLEANUP_INTERVAL_MINUTES",
					parse_default("CLEANUP_INTERVAL_MINUTES", 60u64)?,
					1,
				) * 60,
			),
			max_cache_size: parse_default("MAX_CACHE_SIZE", 100usize)?,
			cache_ttl: Duration::from_secs(
				clamp_floor(
					"CACHE_TTL_MINUTES",
					parse_default("CACHE_TTL_MINUTES", 30u64)?,
					1,
				) * 60,
			),
		};
		Ok(config)
	}
}

fn resolve_temp_dir(configured: Option<PathBuf>) -> PathBuf {
	let dir = configured.unwrap_or_else(std::env::temp_dir);
	match std::fs::create_dir_all(&dir) {
		Ok(()) => dir,
		Err(e) => {
			warn!(
				path = %dir.display(),
				error = %e,
				"configured TEMP_DIR does not exist and could not be created; falling back to OS temp dir"
			);
			std::env::temp_dir()
		},
	}
}

fn parse_allowed_origins() -> AllowedOrigins {
	let raw = env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string());
	if raw.trim() == "*" {
		return AllowedOrigins::Any;
	}
	AllowedOrigins::List(
		raw
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect(),
	)
}

/// Clamps `value` up to `floor`, logging a warning if a clamp was applied.
/// A misconfigured-but-parseable value (e.g. `MAX_REQUESTS_PER_MINUTE=0`)
/// must never produce a process that can admit zero requests or accept zero
/// bytes of source.
fn clamp_floor<T: PartialOrd + std::fmt::Display>(name: &str, value: T, floor: T) -> T {
	if value < floor {
		warn!(
			"{name}={value} is below the configured floor ({floor}); clamping to the floor"
		);
		floor
	} else {
		value
	}
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {env}={val} ({e})")),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	parse(env).map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	// Config::load reads the real process environment, so tests that set env
	// vars must not run concurrently with each other.
	static ENV_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn defaults_when_unset() {
		let _g = ENV_LOCK.lock().unwrap();
		for var in [
			"MAX_REQUESTS_PER_MINUTE",
			"MAX_CODE_LENGTH",
			"EXECUTION_TIMEOUT_SECONDS",
			"MAX_CACHE_SIZE",
		] {
			unsafe { env::remove_var(var) };
		}
		let cfg = Config::load().unwrap();
		assert_eq!(cfg.max_requests_per_minute, 30);
		assert_eq!(cfg.max_code_length, 10_000);
		assert_eq!(cfg.execution_timeout, Duration::from_secs(10));
		assert_eq!(cfg.max_cache_size, 100);
	}

	#[test]
	fn clamps_below_floor_instead_of_failing() {
		let _g = ENV_LOCK.lock().unwrap();
		unsafe { env::set_var("MAX_REQUESTS_PER_MINUTE", "0") };
		let cfg = Config::load().unwrap();
		assert_eq!(cfg.max_requests_per_minute, 1);
		unsafe { env::remove_var("MAX_REQUESTS_PER_MINUTE") };
	}

	#[test]
	fn unparsable_value_is_a_hard_error() {
		let _g = ENV_LOCK.lock().unwrap();
		unsafe { env::set_var("MAX_CODE_LENGTH", "not-a-number") };
		assert!(Config::load().is_err());
		unsafe { env::remove_var("MAX_CODE_LENGTH") };
	}

	#[test]
	fn wildcard_allowed_origins() {
		let _g = ENV_LOCK.lock().unwrap();
		unsafe { env::set_var("ALLOWED_ORIGINS", "*") };
		assert!(matches!(parse_allowed_origins(), AllowedOrigins::Any));
		unsafe { env::remove_var("ALLOWED_ORIGINS") };
	}

	#[test]
	fn comma_separated_allowed_origins() {
		let _g = ENV_LOCK.lock().unwrap();
		unsafe { env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example") };
		match parse_allowed_origins() {
			AllowedOrigins::List(list) => {
				assert_eq!(list, vec!["https://a.example", "https://b.example"]);
			},
			AllowedOrigins::Any => panic!("expected a list"),
		}
		unsafe { env::remove_var("ALLOWED_ORIGINS") };
	}
}
