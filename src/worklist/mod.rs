//! The worklist query engine.
//!
//! One call to [`WorklistEngine::query`] consumes one incoming filter set and
//! produces a finite, non-restartable sequence of response items terminated
//! by a single success marker. The engine keeps no state between invocations
//! beyond the data source's open connection.

mod builder;
mod filter;

pub use builder::{build_item, group_by_order, procedure_codes, OrderGroup, ProcedureCode};
pub use filter::{matches, FilterSet};

use crate::db::{DataSourceError, WorklistDataSource};
use crate::dimse::StatusType;
use crate::types::AE;
use dicom::object::InMemDicomObject;
use tracing::{debug, warn};

pub struct WorklistEngine {
	source: WorklistDataSource,
	client_aet: AE,
}

impl WorklistEngine {
	pub const fn new(source: WorklistDataSource, client_aet: AE) -> Self {
		Self { source, client_aet }
	}

	/// Eagerly connects the data source, surfacing configuration and
	/// connection problems to the operator at startup.
	pub async fn connect(&self) -> Result<(), DataSourceError> {
		self.source.connect().await
	}

	/// Answers one worklist query.
	///
	/// A fetch failure is final for this invocation and degrades to an empty
	/// result set: the returned stream still terminates with its success
	/// marker, as the protocol layer expects an always-terminated sequence.
	pub async fn query(&self, filters: FilterSet) -> WorklistResponse {
		let rows = match self.source.fetch_rows().await {
			Ok(rows) => rows,
			Err(err) => {
				warn!("worklist unavailable, answering with an empty result set: {err}");
				Vec::new()
			}
		};
		WorklistResponse::new(rows, filters, self.client_aet.clone())
	}
}

/// The response stream for a single query.
///
/// Yields `(Pending, Some(item))` for every order that passes all filters,
/// then exactly one `(Success, None)`, then ends. The terminal marker is
/// produced even when no order matched.
pub struct WorklistResponse {
	groups: std::vec::IntoIter<OrderGroup>,
	filters: FilterSet,
	client_aet: AE,
	complete: bool,
}

impl WorklistResponse {
	fn new(rows: Vec<crate::db::RawRow>, filters: FilterSet, client_aet: AE) -> Self {
		Self {
			groups: group_by_order(rows).into_iter(),
			filters,
			client_aet,
			complete: false,
		}
	}
}

impl Iterator for WorklistResponse {
	type Item = (StatusType, Option<InMemDicomObject>);

	fn next(&mut self) -> Option<Self::Item> {
		if self.complete {
			return None;
		}
		for group in self.groups.by_ref() {
			if self.filters.accepts(group.canonical()) {
				let item = build_item(&group, &self.client_aet);
				return Some((StatusType::Pending, Some(item)));
			}
			debug!(order_id = %group.order_id, "order rejected by the query filters");
		}
		self.complete = true;
		Some((StatusType::Success, None))
	}
}
