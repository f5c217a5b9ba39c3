//! Groups raw query rows into orders and assembles worklist items.

use crate::db::RawRow;
use crate::types::{generate_uid, UI};
use chrono::Local;
use dicom::core::{DataElement, VR};
use dicom::core::value::DataSetSequence;
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use tracing::trace;

/// All rows sharing one order id. Never empty: groups are derived from
/// existing rows. The first row is the canonical source for patient and
/// order level fields; later rows only contribute procedure codes.
#[derive(Debug, Clone)]
pub struct OrderGroup {
	pub order_id: String,
	pub rows: Vec<RawRow>,
}

impl OrderGroup {
	pub fn canonical(&self) -> &RawRow {
		&self.rows[0]
	}
}

/// Partitions rows by trimmed order id, preserving the first-seen order of
/// the ids. Response ordering follows row ordering, stable run to run.
pub fn group_by_order(rows: Vec<RawRow>) -> Vec<OrderGroup> {
	let mut groups: Vec<OrderGroup> = Vec::new();
	let mut index: HashMap<String, usize> = HashMap::new();

	for row in rows {
		let order_id = row.exam_id.trim().to_owned();
		match index.get(&order_id) {
			Some(&position) => groups[position].rows.push(row),
			None => {
				index.insert(order_id.clone(), groups.len());
				groups.push(OrderGroup {
					order_id,
					rows: vec![row],
				});
			}
		}
	}
	groups
}

/// A procedure code triple. Identity is the triple itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureCode {
	pub value: String,
	pub scheme: String,
	pub meaning: String,
}

/// Collects the distinct procedure codes of a group in first-seen order.
/// Rows without a code meaning fall back to the sanitized exam description;
/// rows with no code data at all contribute nothing.
pub fn procedure_codes(group: &OrderGroup) -> Vec<ProcedureCode> {
	let mut codes: Vec<ProcedureCode> = Vec::new();
	for row in &group.rows {
		let meaning = row.code_meaning.trim();
		let code = ProcedureCode {
			value: row.code_value.trim().to_owned(),
			scheme: row.code_scheme.trim().to_owned(),
			meaning: if meaning.is_empty() {
				sanitize(&row.exam_description)
			} else {
				meaning.to_owned()
			},
		};
		if code.value.is_empty() && code.scheme.is_empty() && code.meaning.is_empty() {
			continue;
		}
		if !codes.contains(&code) {
			codes.push(code);
		}
	}
	codes
}

/// Collapses a free-text value to plain uppercase ASCII with single spaces.
pub fn sanitize(text: &str) -> String {
	deunicode::deunicode(text.trim())
		.split_whitespace()
		.collect::<Vec<_>>()
		.join(" ")
		.to_uppercase()
}

/// Formats a person name: sanitized, with the DICOM component separator in
/// place of spaces. An empty name becomes a single separator, never "".
fn person_name(text: &str) -> String {
	let name = sanitize(text).replace(' ', "^");
	if name.is_empty() {
		String::from("^")
	} else {
		name
	}
}

fn sex_code(sex: &str) -> &'static str {
	match sex.trim() {
		"F" => "F",
		"M" => "M",
		_ => "O",
	}
}

/// The identifiers generated for one worklist item. A fresh suite is
/// generated per item and never reused.
struct ItemUids {
	study: UI,
	requested_procedure: UI,
	sop_instance: UI,
	scheduled_step: UI,
}

impl ItemUids {
	fn generate() -> Self {
		Self {
			study: generate_uid(),
			requested_procedure: generate_uid(),
			sop_instance: generate_uid(),
			scheduled_step: generate_uid(),
		}
	}
}

fn code_item(code: &ProcedureCode) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::CODE_VALUE, VR::SH, dicom_value!(Str, code.value.clone())),
		DataElement::new(
			tags::CODING_SCHEME_DESIGNATOR,
			VR::SH,
			dicom_value!(Str, code.scheme.clone()),
		),
		DataElement::new(
			tags::CODE_MEANING,
			VR::LO,
			dicom_value!(Str, code.meaning.clone()),
		),
	])
}

/// Assembles the response item for one order group.
///
/// Patient and order level fields come from the canonical row. The single
/// Scheduled Procedure Step repeats the order id as both the requested
/// procedure id and the scheduled step id, and the deduplicated code list is
/// attached under both the scheduled protocol and the requested procedure
/// roles; consoles disagree on which one they read.
pub fn build_item(group: &OrderGroup, client_aet: &str) -> InMemDicomObject {
	let canonical = group.canonical();
	let code_items: Vec<InMemDicomObject> =
		procedure_codes(group).iter().map(code_item).collect();
	let uids = ItemUids::generate();
	let now = Local::now();

	trace!(
		order_id = %group.order_id,
		study_uid = %uids.study,
		requested_procedure_uid = %uids.requested_procedure,
		sop_instance_uid = %uids.sop_instance,
		scheduled_step_uid = %uids.scheduled_step,
		"assigned worklist item identifiers"
	);

	let modality = {
		let modality = canonical.modality.trim();
		if modality.is_empty() { "CR" } else { modality }.to_owned()
	};
	let description = sanitize(&canonical.exam_description);
	let scheduled_date = canonical.exam_date.trim().to_owned();
	let scheduled_time = canonical.exam_time.trim().to_owned();

	let mut item = InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::SPECIFIC_CHARACTER_SET,
			VR::CS,
			dicom_value!(Str, "ISO_IR 192"),
		),
		DataElement::new(
			tags::INSTANCE_CREATION_DATE,
			VR::DA,
			dicom_value!(Str, now.format("%Y%m%d").to_string()),
		),
		DataElement::new(
			tags::INSTANCE_CREATION_TIME,
			VR::TM,
			dicom_value!(Str, now.format("%H%M%S").to_string()),
		),
		DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, uids.sop_instance.clone()),
		),
		DataElement::new(
			tags::PATIENT_NAME,
			VR::PN,
			dicom_value!(Str, person_name(&canonical.patient_name)),
		),
		DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			dicom_value!(Str, canonical.patient_id.trim().to_owned()),
		),
		DataElement::new(
			tags::PATIENT_BIRTH_DATE,
			VR::DA,
			dicom_value!(Str, canonical.birth_date.trim().to_owned()),
		),
		DataElement::new(
			tags::PATIENT_SEX,
			VR::CS,
			dicom_value!(Str, sex_code(&canonical.sex)),
		),
		DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, uids.study.clone()),
		),
		DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			dicom_value!(Str, group.order_id.clone()),
		),
		DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, modality.clone())),
		DataElement::new(
			tags::REQUESTED_PROCEDURE_DESCRIPTION,
			VR::LO,
			dicom_value!(Str, description.clone()),
		),
		DataElement::new(
			tags::REQUESTED_PROCEDURE_ID,
			VR::SH,
			dicom_value!(Str, group.order_id.clone()),
		),
	]);

	if !code_items.is_empty() {
		item.put(DataElement::new(
			tags::REQUESTED_PROCEDURE_CODE_SEQUENCE,
			VR::SQ,
			DataSetSequence::from(code_items.clone()),
		));
	}

	let mut step = InMemDicomObject::from_element_iter([
		DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, modality)),
		DataElement::new(
			tags::REQUESTED_PROCEDURE_ID,
			VR::SH,
			dicom_value!(Str, group.order_id.clone()),
		),
		DataElement::new(
			tags::SCHEDULED_PROCEDURE_STEP_ID,
			VR::SH,
			dicom_value!(Str, group.order_id.clone()),
		),
		DataElement::new(
			tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION,
			VR::LO,
			dicom_value!(Str, description),
		),
		DataElement::new(
			tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
			VR::DA,
			dicom_value!(Str, scheduled_date),
		),
		DataElement::new(
			tags::SCHEDULED_PROCEDURE_STEP_START_TIME,
			VR::TM,
			dicom_value!(Str, scheduled_time),
		),
		DataElement::new(
			tags::SCHEDULED_STATION_AE_TITLE,
			VR::AE,
			dicom_value!(Str, client_aet),
		),
		DataElement::new(
			tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME,
			VR::PN,
			dicom_value!(Str, person_name(&canonical.physician)),
		),
	]);

	if !code_items.is_empty() {
		step.put(DataElement::new(
			tags::SCHEDULED_PROTOCOL_CODE_SEQUENCE,
			VR::SQ,
			DataSetSequence::from(code_items.clone()),
		));
		step.put(DataElement::new(
			tags::REQUESTED_PROCEDURE_CODE_SEQUENCE,
			VR::SQ,
			DataSetSequence::from(code_items),
		));
	}

	item.put(DataElement::new(
		tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE,
		VR::SQ,
		DataSetSequence::from(vec![step]),
	));

	item
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	fn row(order_id: &str, code: &str) -> RawRow {
		RawRow {
			patient_name: String::from("Benjamin Vieira"),
			patient_id: String::from("P001"),
			birth_date: String::from("19850412"),
			sex: String::from("M"),
			exam_description: String::from("Torax PA"),
			exam_id: String::from(order_id),
			exam_date: String::from("20260310"),
			exam_time: String::from("083000"),
			physician: String::from("Dr Joao Souza"),
			modality: String::from("CR"),
			code_value: String::from(code),
			code_meaning: String::from("TORAX PA"),
			code_scheme: String::from("FCR"),
			..RawRow::default()
		}
	}

	fn element_str(item: &InMemDicomObject, tag: dicom::core::Tag) -> String {
		item.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.to_string())
			.unwrap_or_default()
	}

	#[test]
	fn grouping_is_a_partition_in_first_seen_order() {
		let rows = vec![
			row("EX002", "C1"),
			row("EX001", "C1"),
			row("EX002", "C2"),
			row(" EX001 ", "C2"),
		];
		let groups = group_by_order(rows);

		assert_eq!(groups.len(), 2);
		assert_eq!(groups[0].order_id, "EX002");
		assert_eq!(groups[1].order_id, "EX001");
		assert_eq!(groups[0].rows.len(), 2);
		assert_eq!(groups[1].rows.len(), 2);
		assert_eq!(
			groups.iter().map(|g| g.rows.len()).sum::<usize>(),
			4,
			"every row belongs to exactly one group"
		);
	}

	#[test]
	fn procedure_codes_deduplicate_by_triple() {
		let group = &group_by_order(vec![
			row("EX001", "C1"),
			row("EX001", "C1"),
			row("EX001", "C2"),
		])[0];
		let codes = procedure_codes(group);
		assert_eq!(codes.len(), 2);
		assert_eq!(codes[0].value, "C1");
		assert_eq!(codes[1].value, "C2");
	}

	#[test]
	fn code_deduplication_is_idempotent() {
		let group = &group_by_order(vec![row("EX001", "C1"), row("EX001", "C2")])[0];
		assert_eq!(procedure_codes(group), procedure_codes(group));
	}

	#[test]
	fn missing_code_meaning_falls_back_to_the_description() {
		let mut first = row("EX001", "C1");
		first.code_meaning = String::new();
		let group = &group_by_order(vec![first])[0];
		assert_eq!(procedure_codes(group)[0].meaning, "TORAX PA");
	}

	#[test]
	fn sanitize_collapses_whitespace_and_strips_accents() {
		assert_eq!(sanitize("  José   da\tSilva  "), "JOSE DA SILVA");
		assert_eq!(sanitize("ção"), "CAO");
		assert_eq!(sanitize(""), "");
	}

	#[test]
	fn person_names_use_caret_separators() {
		assert_eq!(person_name("Benjamin Vieira"), "BENJAMIN^VIEIRA");
		assert_eq!(person_name("   "), "^");
		assert_eq!(person_name(""), "^");
	}

	#[test]
	fn sex_maps_to_the_closed_code_set() {
		assert_eq!(sex_code("F"), "F");
		assert_eq!(sex_code("M"), "M");
		assert_eq!(sex_code("x"), "O");
		assert_eq!(sex_code(""), "O");
		// Lowercase is outside the mapping, as deployed.
		assert_eq!(sex_code("f"), "O");
	}

	#[test]
	fn item_carries_patient_and_order_fields() {
		let group = &group_by_order(vec![row("EX001", "C1")])[0];
		let item = build_item(group, "CRSTATION");

		assert_eq!(element_str(&item, tags::PATIENT_NAME), "BENJAMIN^VIEIRA");
		assert_eq!(element_str(&item, tags::PATIENT_ID), "P001");
		assert_eq!(element_str(&item, tags::PATIENT_SEX), "M");
		assert_eq!(element_str(&item, tags::ACCESSION_NUMBER), "EX001");
		assert_eq!(element_str(&item, tags::MODALITY), "CR");
		assert_eq!(
			element_str(&item, tags::REQUESTED_PROCEDURE_DESCRIPTION),
			"TORAX PA"
		);
		assert!(!element_str(&item, tags::STUDY_INSTANCE_UID).is_empty());
		assert!(!element_str(&item, tags::SOP_INSTANCE_UID).is_empty());
	}

	#[test]
	fn step_repeats_order_fields_and_both_code_roles() {
		let group = &group_by_order(vec![row("EX001", "C1"), row("EX001", "C1")])[0];
		let item = build_item(group, "CRSTATION");

		let steps = item
			.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
			.and_then(|element| element.items())
			.expect("exactly one scheduled procedure step");
		assert_eq!(steps.len(), 1);
		let step = &steps[0];

		assert_eq!(element_str(step, tags::SCHEDULED_PROCEDURE_STEP_ID), "EX001");
		assert_eq!(element_str(step, tags::REQUESTED_PROCEDURE_ID), "EX001");
		assert_eq!(
			element_str(step, tags::SCHEDULED_PROCEDURE_STEP_START_DATE),
			"20260310"
		);
		assert_eq!(element_str(step, tags::SCHEDULED_STATION_AE_TITLE), "CRSTATION");
		assert_eq!(
			element_str(step, tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME),
			"DR^JOAO^SOUZA"
		);

		// Identical (value, scheme, meaning) rows collapse to one entry,
		// present under both roles.
		let protocol = step
			.get(tags::SCHEDULED_PROTOCOL_CODE_SEQUENCE)
			.and_then(|element| element.items())
			.expect("protocol codes");
		let requested = step
			.get(tags::REQUESTED_PROCEDURE_CODE_SEQUENCE)
			.and_then(|element| element.items())
			.expect("requested procedure codes");
		assert_eq!(protocol.len(), 1);
		assert_eq!(requested.len(), 1);
		assert_eq!(element_str(&protocol[0], tags::CODE_VALUE), "C1");
		assert_eq!(element_str(&requested[0], tags::CODE_MEANING), "TORAX PA");

		// Both step roles and the item level sequence carry the same entries.
		let order_level = item
			.get(tags::REQUESTED_PROCEDURE_CODE_SEQUENCE)
			.and_then(|element| element.items())
			.expect("order level codes");
		assert_eq!(protocol, requested);
		assert_eq!(protocol, order_level);
	}

	#[test]
	fn group_without_codes_omits_the_code_sequences() {
		let mut bare = row("EX001", "");
		bare.code_meaning = String::new();
		bare.code_scheme = String::new();
		bare.exam_description = String::new();
		let group = &group_by_order(vec![bare])[0];
		assert!(procedure_codes(group).is_empty());

		let item = build_item(group, "CRSTATION");
		assert!(item.get(tags::REQUESTED_PROCEDURE_CODE_SEQUENCE).is_none());

		let steps = item
			.get(tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
			.and_then(|element| element.items())
			.expect("the step is still emitted");
		assert!(steps[0].get(tags::SCHEDULED_PROTOCOL_CODE_SEQUENCE).is_none());
	}

	#[test]
	fn uids_differ_between_items_of_the_same_response() {
		let groups = group_by_order(vec![row("EX001", "C1"), row("EX002", "C1")]);
		let first = build_item(&groups[0], "CRSTATION");
		let second = build_item(&groups[1], "CRSTATION");

		assert_ne!(
			element_str(&first, tags::STUDY_INSTANCE_UID),
			element_str(&second, tags::STUDY_INSTANCE_UID)
		);
		assert_ne!(
			element_str(&first, tags::SOP_INSTANCE_UID),
			element_str(&second, tags::SOP_INSTANCE_UID)
		);
	}

	#[test]
	fn empty_modality_falls_back_to_cr() {
		let mut bare = row("EX001", "C1");
		bare.modality = String::from("  ");
		let group = &group_by_order(vec![bare])[0];
		let item = build_item(group, "CRSTATION");
		assert_eq!(element_str(&item, tags::MODALITY), "CR");
	}
}
