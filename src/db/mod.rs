//! The worklist data source.
//!
//! Owns a single database connection that is established lazily on first use
//! and reused across queries. The configured worklist query is executed as-is
//! (after dialect translation) and its result rows are mapped **positionally**
//! into [`RawRow`]; column names reported by the database are ignored
//! entirely, as deployed query templates rely on a fixed column order.

mod dialect;
#[cfg(feature = "oracle")]
mod oracle;

pub use dialect::SqlDialect;

use crate::config::DatabaseConfig;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, MySqlConnection, PgConnection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Number of columns the worklist query must produce.
pub const WORKLIST_COLUMNS: usize = 17;

/// One result row of the worklist query, mapped by column position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawRow {
	pub patient_name: String,
	pub patient_id: String,
	pub birth_date: String,
	pub sex: String,
	pub exam_description: String,
	pub exam_id: String,
	pub exam_date: String,
	pub exam_time: String,
	pub physician: String,
	pub modality: String,
	pub priority: String,
	pub care_type: String,
	pub care_type_id: String,
	pub unit: String,
	pub code_value: String,
	pub code_meaning: String,
	pub code_scheme: String,
}

impl RawRow {
	/// Maps a list of column values into a row.
	/// Returns `None` unless exactly [`WORKLIST_COLUMNS`] values are given.
	pub fn from_columns(columns: Vec<String>) -> Option<Self> {
		if columns.len() != WORKLIST_COLUMNS {
			return None;
		}
		let mut columns = columns.into_iter();
		let mut next = || columns.next().unwrap_or_default();
		Some(Self {
			patient_name: next(),
			patient_id: next(),
			birth_date: next(),
			sex: next(),
			exam_description: next(),
			exam_id: next(),
			exam_date: next(),
			exam_time: next(),
			physician: next(),
			modality: next(),
			priority: next(),
			care_type: next(),
			care_type_id: next(),
			unit: next(),
			code_value: next(),
			code_meaning: next(),
			code_scheme: next(),
		})
	}
}

#[derive(Debug, Error)]
pub enum DataSourceError {
	#[error("database configuration is incomplete (user, dsn and query are required)")]
	ConfigIncomplete,
	#[error("the {0} driver is not available in this build")]
	DriverMissing(&'static str),
	#[error("invalid DSN for {0}: expected HOST:PORT/DBNAME")]
	DsnInvalid(SqlDialect),
	#[error("failed to connect to the {dialect} database: {source}")]
	Connect {
		dialect: SqlDialect,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("failed to execute the worklist query: {0}")]
	Query(#[source] Box<dyn std::error::Error + Send + Sync>),
}

enum DbClient {
	#[cfg(feature = "oracle")]
	Oracle(oracle::Client),
	Postgres(PgConnection),
	MySql(MySqlConnection),
}

/// Owns the database connection and executes the configured worklist query.
///
/// The connection is the serialization point between in-flight queries: the
/// internal mutex guarantees that two queries never touch it concurrently.
pub struct WorklistDataSource {
	config: DatabaseConfig,
	client: Mutex<Option<DbClient>>,
}

impl WorklistDataSource {
	pub fn new(config: DatabaseConfig) -> Self {
		Self {
			config,
			client: Mutex::new(None),
		}
	}

	/// Establishes the connection eagerly. Used at startup so that broken
	/// configuration aborts the server instead of failing every query.
	pub async fn connect(&self) -> Result<(), DataSourceError> {
		let mut guard = self.client.lock().await;
		if guard.is_none() {
			*guard = Some(self.establish().await?);
		}
		Ok(())
	}

	/// Runs the worklist query and maps its rows positionally.
	///
	/// Rows with an unexpected column count are logged and skipped. A query
	/// that succeeds with zero rows yields an empty list, not an error. After
	/// an execution failure the cached connection is dropped so the next
	/// query starts from a fresh connect.
	pub async fn fetch_rows(&self) -> Result<Vec<RawRow>, DataSourceError> {
		let mut guard = self.client.lock().await;
		if guard.is_none() {
			*guard = Some(self.establish().await?);
		}
		let Some(client) = guard.as_mut() else {
			unreachable!("client was just established");
		};

		let sql = self.config.dialect.translate(&self.config.query);
		let result = match client {
			#[cfg(feature = "oracle")]
			DbClient::Oracle(connection) => oracle::fetch_worklist_rows(connection, &sql),
			DbClient::Postgres(connection) => sqlx::query(&sql)
				.fetch_all(&mut *connection)
				.await
				.map(|rows| collect_rows(&rows))
				.map_err(|err| DataSourceError::Query(Box::new(err))),
			DbClient::MySql(connection) => sqlx::query(&sql)
				.fetch_all(&mut *connection)
				.await
				.map(|rows| collect_rows(&rows))
				.map_err(|err| DataSourceError::Query(Box::new(err))),
		};

		match result {
			Ok(rows) => {
				info!("worklist query returned {} usable rows", rows.len());
				Ok(rows)
			}
			Err(err) => {
				// The statement may have failed because the connection is
				// gone; drop it so the next query re-establishes it.
				*guard = None;
				Err(err)
			}
		}
	}

	async fn establish(&self) -> Result<DbClient, DataSourceError> {
		let config = &self.config;
		if config.user.trim().is_empty()
			|| config.dsn.trim().is_empty()
			|| config.query.trim().is_empty()
		{
			return Err(DataSourceError::ConfigIncomplete);
		}

		let dialect = config.dialect;
		let client = match dialect {
			#[cfg(feature = "oracle")]
			SqlDialect::Oracle => DbClient::Oracle(oracle::connect(
				&config.user,
				&config.password,
				&config.dsn,
			)?),
			#[cfg(not(feature = "oracle"))]
			SqlDialect::Oracle => return Err(DataSourceError::DriverMissing("Oracle")),
			SqlDialect::Postgres => {
				let (host, port, dbname) = parse_dsn(&config.dsn, dialect.default_port())
					.ok_or(DataSourceError::DsnInvalid(dialect))?;
				let options = PgConnectOptions::new()
					.host(&host)
					.port(port)
					.database(&dbname)
					.username(&config.user)
					.password(&config.password);
				let connection = PgConnection::connect_with(&options).await.map_err(|err| {
					DataSourceError::Connect {
						dialect,
						source: Box::new(err),
					}
				})?;
				DbClient::Postgres(connection)
			}
			SqlDialect::MySql => {
				let (host, port, dbname) = parse_dsn(&config.dsn, dialect.default_port())
					.ok_or(DataSourceError::DsnInvalid(dialect))?;
				let options = MySqlConnectOptions::new()
					.host(&host)
					.port(port)
					.database(&dbname)
					.username(&config.user)
					.password(&config.password);
				let connection = MySqlConnection::connect_with(&options)
					.await
					.map_err(|err| DataSourceError::Connect {
						dialect,
						source: Box::new(err),
					})?;
				DbClient::MySql(connection)
			}
		};

		info!(%dialect, "connected to the worklist database");
		Ok(client)
	}
}

/// Parses a `HOST:PORT/DBNAME` connection string. The port may be omitted.
fn parse_dsn(dsn: &str, default_port: u16) -> Option<(String, u16, String)> {
	let (host_part, dbname) = dsn.split_once('/')?;
	let (host, port) = match host_part.split_once(':') {
		Some((host, port)) => (host, port.trim().parse().ok()?),
		None => (host_part, default_port),
	};
	let host = host.trim();
	let dbname = dbname.trim();
	if host.is_empty() || dbname.is_empty() {
		return None;
	}
	Some((host.to_owned(), port, dbname.to_owned()))
}

/// Maps decoded column sets into rows. A set with the wrong column count is
/// logged and skipped; the remaining sets are still processed.
fn map_rows(column_sets: impl IntoIterator<Item = Vec<String>>) -> Vec<RawRow> {
	let mut mapped = Vec::new();
	for (index, columns) in column_sets.into_iter().enumerate() {
		let count = columns.len();
		match RawRow::from_columns(columns) {
			Some(raw) => mapped.push(raw),
			None => warn!(
				"query returned {count} columns, expected {WORKLIST_COLUMNS}; row {} skipped",
				index + 1
			),
		}
	}
	mapped
}

fn collect_rows<R>(rows: &[R]) -> Vec<RawRow>
where
	R: Row,
	usize: sqlx::ColumnIndex<R>,
	for<'r> String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> f64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveDateTime: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveDate: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveTime: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
	map_rows(rows.iter().map(|row| {
		(0..row.len())
			.map(|column| decode_column(row, column))
			.collect()
	}))
}

/// Renders one column as a string, whatever its SQL type.
///
/// Deployed templates format dates and times in SQL, but a template that
/// returns native types should still produce usable DICOM strings.
fn decode_column<R>(row: &R, index: usize) -> String
where
	R: Row,
	usize: sqlx::ColumnIndex<R>,
	for<'r> String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> f64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveDateTime: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveDate: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
	for<'r> NaiveTime: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
	if let Ok(value) = row.try_get::<Option<String>, _>(index) {
		return value.unwrap_or_default();
	}
	if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
		return value.map(|v| v.to_string()).unwrap_or_default();
	}
	if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
		return value.map(|v| v.to_string()).unwrap_or_default();
	}
	if let Ok(value) = row.try_get::<Option<NaiveDateTime>, _>(index) {
		return value
			.map(|v| v.format("%Y%m%d%H%M%S").to_string())
			.unwrap_or_default();
	}
	if let Ok(value) = row.try_get::<Option<NaiveDate>, _>(index) {
		return value
			.map(|v| v.format("%Y%m%d").to_string())
			.unwrap_or_default();
	}
	if let Ok(value) = row.try_get::<Option<NaiveTime>, _>(index) {
		return value
			.map(|v| v.format("%H%M%S").to_string())
			.unwrap_or_default();
	}
	warn!("column {index} has an unsupported SQL type; substituting an empty string");
	String::new()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn columns(count: usize) -> Vec<String> {
		(0..count).map(|i| format!("col{i}")).collect()
	}

	#[test]
	fn rows_map_by_position_only() {
		let row = RawRow::from_columns(columns(17)).unwrap();
		assert_eq!(row.patient_name, "col0");
		assert_eq!(row.exam_id, "col5");
		assert_eq!(row.code_scheme, "col16");
	}

	#[test]
	fn short_and_long_rows_are_rejected() {
		assert_eq!(RawRow::from_columns(columns(16)), None);
		assert_eq!(RawRow::from_columns(columns(18)), None);
		assert_eq!(RawRow::from_columns(Vec::new()), None);
	}

	#[test]
	fn malformed_rows_are_skipped_without_aborting_the_batch() {
		let rows = map_rows(vec![columns(17), columns(16), columns(17), columns(18)]);
		assert_eq!(rows.len(), 2, "both well-formed rows survive");
		assert_eq!(rows[0].patient_name, "col0");
		assert_eq!(rows[1].code_scheme, "col16");
	}

	#[test]
	fn dsn_parses_host_port_and_database() {
		assert_eq!(
			parse_dsn("10.0.0.5:5433/ris", 5432),
			Some((String::from("10.0.0.5"), 5433, String::from("ris")))
		);
	}

	#[test]
	fn dsn_port_defaults_per_dialect() {
		assert_eq!(
			parse_dsn("db.example.org/worklist", 3306),
			Some((String::from("db.example.org"), 3306, String::from("worklist")))
		);
	}

	#[test]
	fn invalid_dsn_is_rejected() {
		assert_eq!(parse_dsn("just-a-host", 5432), None);
		assert_eq!(parse_dsn("host:port/db", 5432), None);
		assert_eq!(parse_dsn("/db", 5432), None);
		assert_eq!(parse_dsn("host:1521/", 5432), None);
	}

	#[tokio::test]
	async fn incomplete_configuration_is_rejected_before_connecting() {
		let source = WorklistDataSource::new(crate::config::DatabaseConfig {
			dialect: SqlDialect::Postgres,
			user: String::new(),
			password: String::new(),
			dsn: String::from("localhost/ris"),
			query: String::from("SELECT 1"),
		});
		assert!(matches!(
			source.connect().await,
			Err(DataSourceError::ConfigIncomplete)
		));
	}

	#[cfg(not(feature = "oracle"))]
	#[tokio::test]
	async fn oracle_without_driver_reports_driver_missing() {
		let source = WorklistDataSource::new(crate::config::DatabaseConfig {
			dialect: SqlDialect::Oracle,
			user: String::from("ris"),
			password: String::from("secret"),
			dsn: String::from("localhost:1521/XE"),
			query: String::from("SELECT 1 FROM dual"),
		});
		assert!(matches!(
			source.connect().await,
			Err(DataSourceError::DriverMissing("Oracle"))
		));
	}
}
