//! Oracle backend, available behind the `oracle` cargo feature.
//!
//! The driver links against the Oracle client libraries, so it is opt-in the
//! same way the object-storage backend would be in other deployments.

use crate::db::{map_rows, DataSourceError, RawRow, SqlDialect};

pub(super) type Client = oracle::Connection;

pub(super) fn connect(user: &str, password: &str, dsn: &str) -> Result<Client, DataSourceError> {
	oracle::Connection::connect(user, password, dsn).map_err(|err| DataSourceError::Connect {
		dialect: SqlDialect::Oracle,
		source: Box::new(err),
	})
}

pub(super) fn fetch_worklist_rows(
	connection: &Client,
	sql: &str,
) -> Result<Vec<RawRow>, DataSourceError> {
	let rows = connection
		.query(sql, &[])
		.map_err(|err| DataSourceError::Query(Box::new(err)))?;

	let mut column_sets = Vec::new();
	for row in rows {
		let row = row.map_err(|err| DataSourceError::Query(Box::new(err)))?;
		let columns = row
			.sql_values()
			.iter()
			.map(|value| {
				value
					.get::<Option<String>>()
					.ok()
					.flatten()
					.unwrap_or_default()
			})
			.collect();
		column_sets.push(columns);
	}
	Ok(map_rows(column_sets))
}
