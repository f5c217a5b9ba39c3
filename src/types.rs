use uuid::Uuid;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Generates a new DICOM unique identifier.
///
/// The UID is a randomly generated UUID represented as a single integer value
/// under the 2.25 root, which requires no registered org root.
pub fn generate_uid() -> UI {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}
