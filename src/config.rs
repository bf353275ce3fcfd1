use std::{
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::Path,
	str::FromStr,
};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEFAULT_SERVER_PORT: u16 = 4280;
const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
const DEFAULT_WORKER_NAME: &str = "worker";
const DEFAULT_STORAGE_QUOTA: u64 = 1024 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserServerConfig {
	pub host: Option<IpAddr>,
	pub port: Option<u16>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserWorkerConfig {
	/// Prefix for the worker queue names in logs.
	pub name: Option<String>,

	/// Bytes of draft storage per connection.
	pub storage_quota: Option<u64>,
}

/// The configuration file as written by the user. Every field is optional.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
	pub server: Option<UserServerConfig>,

	/// `error`, `warn`, `info`, `debug` or `trace`;
	/// `RUST_LOG` still wins when set.
	pub log_level: Option<String>,

	pub worker: Option<UserWorkerConfig>,
}

impl UserConfig {
	/// Reads a `.json`, `.json5` or `.jsonc` file.
	pub fn read(path: &Path) -> eyre::Result<Self> {
		let config_string = std::fs::read_to_string(path)
			.wrap_err_with(|| format!("reading {}", path.display()))?;

		json5::from_str(&config_string)
			.wrap_err_with(|| format!("parsing {}", path.display()))
	}
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
	pub addr: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
	pub name: String,
	pub storage_quota: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub server: ServerConfig,
	pub log_level: log::LevelFilter,
	pub worker: WorkerConfig,
}

impl Config {
	pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
		let user_config = path.map(UserConfig::read).transpose()?;
		Self::resolve(user_config.unwrap_or_default())
	}

	/// Fills in defaults.
	pub fn resolve(user_config: UserConfig) -> eyre::Result<Self> {
		let server = user_config.server.unwrap_or_default();
		let worker = user_config.worker.unwrap_or_default();

		let log_level = match user_config.log_level {
			Some(level) => log::LevelFilter::from_str(&level)
				.map_err(|_| eyre::eyre!("invalid log level `{}`", level))?,
			None => DEFAULT_LOG_LEVEL,
		};

		Ok(Self {
			server: ServerConfig {
				addr: SocketAddr::new(
					server.host.unwrap_or(DEFAULT_SERVER_HOST),
					server.port.unwrap_or(DEFAULT_SERVER_PORT),
				),
			},
			log_level,
			worker: WorkerConfig {
				name: worker.name.unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string()),
				storage_quota: worker.storage_quota.unwrap_or(DEFAULT_STORAGE_QUOTA),
			},
		})
	}
}
