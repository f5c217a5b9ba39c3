//! The worklist service class provider.
//!
//! Accepts associations for the Modality Worklist Information Model (FIND)
//! and the Verification SOP class. Each association is served on a blocking
//! task because `dicom-rs` uses blocking reads/writes; queries against the
//! async worklist engine are bridged with [`Handle::block_on`].

use crate::config::ServerConfig;
use crate::dimse::{
	read_message, write_message, EchoResponse, ReadError, StatusType, WorklistFindResponse,
	COMMAND_FIELD_COMPOSITE_ECHO_REQUEST, COMMAND_FIELD_COMPOSITE_FIND_REQUEST,
};
use crate::types::US;
use crate::worklist::{FilterSet, WorklistEngine};
use anyhow::Context;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::ul::{Pdu, ServerAssociation};
use std::net::TcpStream;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{debug, error, info, info_span, warn};

pub struct WorklistServiceClassProvider {
	engine: Arc<WorklistEngine>,
	config: ServerConfig,
}

impl WorklistServiceClassProvider {
	pub const fn new(engine: Arc<WorklistEngine>, config: ServerConfig) -> Self {
		Self { engine, config }
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = format!("{}:{}", self.config.host, self.config.port);
		let listener = TcpListener::bind(&address).await?;
		info!(aet = &self.config.aet, "Started Worklist Service Class Provider on {address}");
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span =
						info_span!("MWL-SCP", aet = &self.config.aet, peer = peer.to_string());
					info!("Accepted incoming connection from {peer}");

					let tcp_stream = match stream.into_std() {
						Ok(tcp_stream) => tcp_stream,
						Err(err) => {
							error!("Failed to take ownership of the TCP stream: {err}");
							continue;
						}
					};

					let engine = Arc::clone(&self.engine);
					let aet = self.config.aet.clone();
					let handle = Handle::current();
					tokio::task::spawn_blocking(move || {
						let _enter = span.enter();
						if let Err(err) = Self::process(tcp_stream, &engine, &aet, &handle) {
							error!("{err:#}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	fn process(
		tcp_stream: TcpStream,
		engine: &WorklistEngine,
		aet: &str,
		handle: &Handle,
	) -> anyhow::Result<()> {
		// `dicom-rs` does not use non-blocking reads/writes.
		tcp_stream.set_nonblocking(false)?;

		let options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(aet)
			.with_abstract_syntax(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)
			.with_abstract_syntax(uids::VERIFICATION)
			.with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
			.with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN);
		let mut association = options.establish(tcp_stream)?;
		info!(
			calling_aet = association.client_ae_title(),
			"Established new server association"
		);

		loop {
			let message = match read_message(&mut association) {
				Ok(message) => message,
				Err(ReadError::Released) => {
					debug!("Peer released the association");
					association.send(&Pdu::ReleaseRP)?;
					return Ok(());
				}
				Err(ReadError::Aborted) => {
					debug!("Peer aborted the association");
					return Ok(());
				}
				Err(err) => return Err(err.into()),
			};

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok)
				.context("Missing tag COMMAND_FIELD (0000,0100)")?;
			let message_id = message
				.command
				.get(tags::MESSAGE_ID)
				.map(InMemElement::to_int)
				.and_then(Result::ok)
				.unwrap_or(0);

			match command_field {
				COMMAND_FIELD_COMPOSITE_FIND_REQUEST => {
					let Some(identifier) = message.data else {
						warn!("C-FIND-RQ without an identifier data set");
						let response = WorklistFindResponse {
							message_id,
							status: StatusType::Failure,
							identifier: None,
						};
						write_message(&mut association, response, message.presentation_context_id)?;
						continue;
					};
					Self::handle_find(
						&mut association,
						engine,
						handle,
						message_id,
						&identifier,
						message.presentation_context_id,
					)?;
				}
				COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
					debug!("Responding to C-ECHO-RQ");
					write_message(
						&mut association,
						EchoResponse { message_id },
						message.presentation_context_id,
					)?;
				}
				unsupported => {
					return Err(anyhow::anyhow!(
						"Unsupported Command Field {unsupported:#06X}. \
						 Only C-FIND-RQ and C-ECHO-RQ are supported."
					));
				}
			}
		}
	}

	fn handle_find(
		association: &mut ServerAssociation<TcpStream>,
		engine: &WorklistEngine,
		handle: &Handle,
		message_id: US,
		identifier: &dicom::object::InMemDicomObject,
		presentation_context_id: Option<u8>,
	) -> anyhow::Result<()> {
		let filters = FilterSet::from_identifier(identifier);
		info!("Received C-FIND-RQ with filters {filters:?}");

		let mut pending = 0_usize;
		for (status, item) in handle.block_on(engine.query(filters)) {
			if status == StatusType::Pending {
				pending += 1;
			}
			let response = WorklistFindResponse {
				message_id,
				status,
				identifier: item,
			};
			write_message(&mut *association, response, presentation_context_id)?;
		}
		info!("Answered C-FIND-RQ with {pending} matching worklist items");
		Ok(())
	}
}
