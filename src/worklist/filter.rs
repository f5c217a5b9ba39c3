//! DICOM attribute matching for incoming C-FIND identifiers.
//!
//! Patient name, patient id, modality and accession number are matched with
//! DICOM wildcards (`*`, `?`); sex, birth date, scheduled date and scheduled
//! time are matched by plain equality. This split follows the matching keys
//! modalities actually send and must not be generalized.

use crate::db::RawRow;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use regex::Regex;
use tracing::debug;

/// The optional matching keys extracted from a C-FIND identifier.
///
/// A key is unset when it is absent or empty after trimming. The universal
/// wildcard `"*"` is kept as a real pattern, not folded into "unset".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterSet {
	pub patient_name: Option<String>,
	pub patient_id: Option<String>,
	pub sex: Option<String>,
	pub birth_date: Option<String>,
	pub modality: Option<String>,
	pub accession_number: Option<String>,
	pub scheduled_date: Option<String>,
	pub scheduled_time: Option<String>,
}

impl FilterSet {
	pub fn from_identifier(identifier: &InMemDicomObject) -> Self {
		Self {
			patient_name: string_filter(identifier, tags::PATIENT_NAME),
			patient_id: string_filter(identifier, tags::PATIENT_ID),
			sex: string_filter(identifier, tags::PATIENT_SEX),
			birth_date: string_filter(identifier, tags::PATIENT_BIRTH_DATE),
			modality: string_filter(identifier, tags::MODALITY),
			accession_number: string_filter(identifier, tags::ACCESSION_NUMBER),
			scheduled_date: string_filter(
				identifier,
				tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
			),
			scheduled_time: string_filter(
				identifier,
				tags::SCHEDULED_PROCEDURE_STEP_START_TIME,
			),
		}
	}

	/// Whether the canonical row of an order passes every present key.
	/// All keys must match for the order to be returned.
	pub fn accepts(&self, row: &RawRow) -> bool {
		if !matches(&row.patient_name, self.patient_name.as_deref()) {
			debug!("patient name {:?} rejected by filter", row.patient_name);
			return false;
		}
		if !matches(&row.patient_id, self.patient_id.as_deref()) {
			return false;
		}
		if let Some(sex) = &self.sex {
			if !row.sex.trim().eq_ignore_ascii_case(sex) {
				return false;
			}
		}
		if let Some(birth_date) = &self.birth_date {
			if row.birth_date.trim() != birth_date {
				return false;
			}
		}
		if !matches(&row.modality, self.modality.as_deref()) {
			return false;
		}
		if !matches(&row.exam_id, self.accession_number.as_deref()) {
			return false;
		}
		if let Some(scheduled_date) = &self.scheduled_date {
			if row.exam_date.trim() != scheduled_date {
				return false;
			}
		}
		if let Some(scheduled_time) = &self.scheduled_time {
			if row.exam_time.trim() != scheduled_time {
				return false;
			}
		}
		true
	}
}

fn string_filter(identifier: &InMemDicomObject, tag: Tag) -> Option<String> {
	identifier
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

/// Evaluates a DICOM wildcard pattern against a candidate string.
///
/// `*` matches any run of characters, `?` matches exactly one; everything
/// else, regex metacharacters included, matches literally. The comparison is
/// case-insensitive and anchored to the full string. A pattern that cannot be
/// compiled matches nothing instead of propagating an error.
pub fn matches(candidate: &str, pattern: Option<&str>) -> bool {
	let Some(pattern) = pattern else {
		return true;
	};
	let candidate = candidate.trim().to_uppercase();
	let pattern = pattern.trim().to_uppercase();

	if pattern == "*" {
		return true;
	}

	let anchored = format!(
		"^{}$",
		regex::escape(&pattern).replace(r"\*", ".*").replace(r"\?", ".")
	);
	match Regex::new(&anchored) {
		Ok(expression) => expression.is_match(&candidate),
		Err(err) => {
			debug!("pattern {pattern:?} does not compile, matching nothing: {err}");
			false
		}
	}
}
