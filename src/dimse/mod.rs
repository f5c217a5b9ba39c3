//! DIMSE message plumbing for the worklist SCP.
//!
//! Association negotiation and PDU framing come from the `dicom-ul` crate;
//! this module only assembles DICOM messages (command set plus optional data
//! set) out of PData fragments and builds the C-FIND/C-ECHO responses the
//! SCP sends back. Reads and writes are blocking because `dicom-rs` does not
//! use non-blocking IO; each association runs on its own blocking task.

pub mod scp;

use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{Pdu, ServerAssociation};
use std::fmt::{Debug, Formatter};
use std::net::TcpStream;
use thiserror::Error;
use tracing::trace;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;
pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// For reading DICOM messages, prefer checking (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl StatusType {
	/// The status code written into a response command set.
	pub const fn code(self) -> US {
		match self {
			Self::Success => 0x0000,
			Self::Warning => 0x0001,
			Self::Failure => 0xC000,
			Self::Cancel => 0xFE00,
			Self::Pending => 0xFF00,
		}
	}
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, u16> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] dicom::ul::association::Error),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Peer requested release of the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] dicom::ul::association::Error),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Reads one complete DICOM message from the association, reassembling
/// PData fragments. Blocks until the message is complete or the peer
/// releases or aborts the association.
pub fn read_message(
	association: &mut ServerAssociation<TcpStream>,
) -> Result<DicomMessage, ReadError> {
	let mut command_fragments = Vec::new();
	let mut data_fragments = Vec::new();
	let mut message_command: Option<InMemDicomObject> = None;

	loop {
		let pdu = association.receive()?;
		let data = match pdu {
			Pdu::PData { data } => data,
			Pdu::ReleaseRQ => return Err(ReadError::Released),
			Pdu::AbortRQ { .. } => return Err(ReadError::Aborted),
			unexpected => return Err(ReadError::UnexpectedPdu(unexpected)),
		};

		for mut pdv in data {
			match pdv.value_type {
				PDataValueType::Command => {
					trace!("Received command fragment (last={})", pdv.is_last);
					if message_command.is_some() {
						// Already received the full command set.
						// Receiving another command fragment is not expected.
						return Err(ReadError::OutOfOrder);
					}
					command_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let command = InMemDicomObject::read_dataset_with_ts(
							command_fragments.as_slice(),
							&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
						)?;
						let has_data_set = command
							.get(tags::COMMAND_DATA_SET_TYPE)
							.map(InMemElement::to_int::<US>)
							.and_then(Result::ok)
							.is_some_and(|value| value != DATA_SET_MISSING);

						if has_data_set {
							message_command = Some(command);
						} else {
							return Ok(DicomMessage {
								command,
								data: None,
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
				PDataValueType::Data => {
					trace!("Received data fragment (last={})", pdv.is_last);
					data_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let Some(command) = message_command else {
							// Cannot handle data fragments before the entire
							// command set is received.
							return Err(ReadError::OutOfOrder);
						};
						let transfer_syntax =
							negotiated_transfer_syntax(association, pdv.presentation_context_id)?;
						let transfer_syntax = TransferSyntaxRegistry
							.get(&transfer_syntax)
							.ok_or(NegotiationError::UnknownTransferSyntax(transfer_syntax))?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;

						return Ok(DicomMessage {
							command,
							data: Some(data),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}

/// Writes one DICOM message to the association: the command set in Implicit
/// VR LE, then the data set (if any) in the negotiated transfer syntax.
pub fn write_message(
	association: &mut ServerAssociation<TcpStream>,
	message: impl Into<DicomMessage>,
	presentation_context_id: Option<u8>,
) -> Result<(), WriteError> {
	let message: DicomMessage = message.into();

	let presentation_context = match presentation_context_id {
		None => association.presentation_contexts().first(),
		Some(presentation_context_id) => association
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == presentation_context_id),
	}
	.ok_or(NegotiationError::NoPresentationContext)?;
	let presentation_context_id = presentation_context.id;
	let transfer_syntax_uid = presentation_context.transfer_syntax.clone();

	let mut command_buf = Vec::new();
	message
		.command
		.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

	let command_pdu = Pdu::PData {
		data: vec![PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id,
			is_last: true,
			data: command_buf,
		}],
	};
	association.send(&command_pdu)?;

	if let Some(data) = message.data {
		let transfer_syntax = TransferSyntaxRegistry
			.get(&transfer_syntax_uid)
			.ok_or(NegotiationError::UnknownTransferSyntax(transfer_syntax_uid))?;
		let mut data_buf = Vec::new();
		data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

		let data_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id,
				is_last: true,
				data: data_buf,
			}],
		};
		association.send(&data_pdu)?;
	}

	Ok(())
}

fn negotiated_transfer_syntax(
	association: &ServerAssociation<TcpStream>,
	presentation_context_id: u8,
) -> Result<UI, NegotiationError> {
	association
		.presentation_contexts()
		.iter()
		.find(|pctx| pctx.id == presentation_context_id)
		.map(|pctx| pctx.transfer_syntax.clone())
		.ok_or(NegotiationError::NoPresentationContext)
}

/// C-FIND-RSP for a worklist query.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.2.2.html>
#[derive(Debug)]
pub struct WorklistFindResponse {
	pub message_id: US,
	pub status: StatusType,
	pub identifier: Option<InMemDicomObject>,
}

impl From<WorklistFindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: WorklistFindResponse) -> Self {
		let data_set_type = if response.identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status.code()])),
		]);

		Self {
			command,
			data: response.identifier,
			presentation_context_id: None,
		}
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct EchoResponse {
	pub message_id: US,
}

impl From<EchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: EchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [StatusType::Success.code()])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
