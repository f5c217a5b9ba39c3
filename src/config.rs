use crate::db::SqlDialect;
use crate::types::AE;
use serde::Deserialize;

/// The application configuration, loaded once at startup and passed into each
/// component. There is no ambient global configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub logging: LoggingConfig,
	pub server: ServerConfig,
	pub database: DatabaseConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional
	/// `config.json` next to the working directory and `MWL_*` environment
	/// variables, in increasing order of precedence.
	pub fn new() -> Result<Self, config::ConfigError> {
		let settings = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.json"),
				config::FileFormat::Json,
			))
			.add_source(config::File::with_name("config").required(false))
			.add_source(environment())
			.build()?;

		settings.try_deserialize()
	}
}

/// Environment overrides. Path segments are separated by `__` so that field
/// names containing underscores stay addressable: `MWL_SERVER__CLIENT_AET`
/// maps to `server.client_aet`, not `server.client.aet`.
fn environment() -> config::Environment {
	config::Environment::with_prefix("MWL")
		.prefix_separator("_")
		.separator("__")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
	/// Log level directive. Also configurable via the RUST_LOG env var.
	pub level: String,
}

/// Settings for the worklist SCP itself.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	/// The application entity title announced by this SCP.
	pub aet: AE,
	/// The interface the SCP will be listening on.
	pub host: String,
	/// The port for incoming DICOM associations.
	pub port: u16,
	/// The AE title reported as Scheduled Station AE Title in worklist items.
	pub client_aet: AE,
}

/// Settings for the relational backend that holds the scheduled procedures.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
	#[serde(rename = "type")]
	pub dialect: SqlDialect,
	pub user: String,
	pub password: String,
	/// For Oracle this is handed to the driver verbatim.
	/// For Postgres and MySQL it must parse as `HOST:PORT/DBNAME`.
	pub dsn: String,
	/// The worklist query. It must produce exactly 17 columns in the
	/// documented order; column names are ignored entirely.
	pub query: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(json: &str) -> AppConfig {
		config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.json"),
				config::FileFormat::Json,
			))
			.add_source(config::File::from_str(json, config::FileFormat::Json))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap()
	}

	#[test]
	fn defaults_deserialize() {
		let config = parse("{}");
		assert_eq!(config.server.aet, "MWL-BRIDGE");
		assert_eq!(config.server.port, 104);
		assert_eq!(config.server.client_aet, "ANY");
		assert_eq!(config.database.dialect, SqlDialect::Oracle);
	}

	#[test]
	fn dialect_accepts_both_postgres_spellings() {
		let config = parse(r#"{"database": {"type": "postgres"}}"#);
		assert_eq!(config.database.dialect, SqlDialect::Postgres);

		let config = parse(r#"{"database": {"type": "postgresql"}}"#);
		assert_eq!(config.database.dialect, SqlDialect::Postgres);
	}

	#[test]
	fn env_overrides_reach_fields_with_underscores() {
		let vars = config::Map::from([
			(
				String::from("MWL_SERVER__CLIENT_AET"),
				String::from("CR01"),
			),
			(String::from("MWL_DATABASE__TYPE"), String::from("mysql")),
		]);
		let config: AppConfig = config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.json"),
				config::FileFormat::Json,
			))
			.add_source(environment().source(Some(vars)))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap();

		assert_eq!(config.server.client_aet, "CR01");
		assert_eq!(config.database.dialect, SqlDialect::MySql);
	}

	#[test]
	fn dialect_accepts_mysql() {
		let config = parse(r#"{"database": {"type": "mysql"}}"#);
		assert_eq!(config.database.dialect, SqlDialect::MySql);
	}
}
