//! The worker side of the demo: facade implementations and the command
//! table the worker's queue serves. Everything is built from an explicit
//! [Backend]; nothing is looked up from process-wide state.

use std::{
	collections::BTreeMap,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use worker_rpc::{
	CallError, CommandTable, ErrorKind, Notifier, RemoteError, Request, expose_local,
	notify::InfoMessage,
};

use crate::config::WorkerConfig;

worker_rpc::facade! {
	/// Drafting and sending mail.
	pub trait MailFacade as "mail" {
		client = MailClient;
		dispatch = MailDispatch;

		fn create_draft(subject: String, body: String, recipients: Vec<String>) -> Draft;
		fn update_draft(draft_id: String, subject: String, body: String) -> Draft;

		/// Delivers to every recipient, reporting progress along the way.
		fn send_draft(draft_id: String) -> Draft;

		fn list_drafts() -> Vec<Draft>;
	}
}

worker_rpc::facade! {
	/// Account-wide storage accounting.
	pub trait CustomerFacade as "customer" {
		client = CustomerClient;
		dispatch = CustomerDispatch;

		fn read_used_customer_storage() -> u64;
		fn read_available_customer_storage() -> u64;
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
	pub id: String,
	pub subject: String,
	pub body: String,
	pub recipients: Vec<String>,
	pub sent: bool,
}

impl Draft {
	fn size(&self) -> u64 {
		(self.subject.len() + self.body.len()) as u64
	}
}

fn push_failed(e: CallError) -> RemoteError {
	RemoteError::new(ErrorKind::Connection, format!("push to main failed: {e}"))
}

pub struct MailBackend {
	notifier: Notifier,
	next_id: AtomicU64,
	drafts: Mutex<BTreeMap<String, Draft>>,
}

impl MailBackend {
	fn new(notifier: Notifier) -> Self {
		Self {
			notifier,
			next_id: AtomicU64::new(1),
			drafts: Mutex::new(BTreeMap::new()),
		}
	}

	fn get(&self, draft_id: &str) -> Result<Draft, RemoteError> {
		self.drafts.lock().get(draft_id).cloned().ok_or_else(|| {
			RemoteError::invalid_arguments(format!("no draft `{draft_id}`"))
		})
	}

	fn used_storage(&self) -> u64 {
		self.drafts.lock().values().map(Draft::size).sum()
	}
}

impl MailFacade for MailBackend {
	async fn create_draft(
		&self,
		subject: String,
		body: String,
		recipients: Vec<String>,
	) -> Result<Draft, RemoteError> {
		let id = format!("draft-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

		let draft = Draft {
			id: id.clone(),
			subject,
			body,
			recipients,
			sent: false,
		};

		log::debug!("Created {}", id);
		self.drafts.lock().insert(id, draft.clone());

		Ok(draft)
	}

	async fn update_draft(
		&self,
		draft_id: String,
		subject: String,
		body: String,
	) -> Result<Draft, RemoteError> {
		let mut drafts = self.drafts.lock();

		let draft = drafts.get_mut(&draft_id).ok_or_else(|| {
			RemoteError::invalid_arguments(format!("no draft `{draft_id}`"))
		})?;

		if draft.sent {
			return Err(RemoteError::programming(format!(
				"draft `{draft_id}` was already sent"
			)));
		}

		draft.subject = subject;
		draft.body = body;

		Ok(draft.clone())
	}

	async fn send_draft(&self, draft_id: String) -> Result<Draft, RemoteError> {
		let draft = self.get(&draft_id)?;

		if draft.sent {
			return Err(RemoteError::programming(format!(
				"draft `{draft_id}` was already sent"
			)));
		}

		if draft.recipients.is_empty() {
			return Err(RemoteError::invalid_arguments(format!(
				"draft `{draft_id}` has no recipients"
			)));
		}

		let total = draft.recipients.len() as u64;
		let monitor = self
			.notifier
			.create_progress_monitor(total)
			.await
			.map_err(push_failed)?;

		for (done, recipient) in draft.recipients.iter().enumerate() {
			log::debug!("Delivering {} to {}", draft_id, recipient);

			self.notifier
				.progress_work_done(monitor, 1)
				.await
				.map_err(push_failed)?;

			let percentage = ((done as u64 + 1) * 100 / total) as u8;
			self.notifier
				.send_progress(percentage)
				.await
				.map_err(push_failed)?;
		}

		let sent = {
			let mut drafts = self.drafts.lock();
			let draft = drafts.get_mut(&draft_id).ok_or_else(|| {
				RemoteError::invalid_arguments(format!("no draft `{draft_id}`"))
			})?;

			draft.sent = true;
			draft.clone()
		};

		self.notifier
			.info_message(&InfoMessage {
				translation_key: "mailSent_msg".to_string(),
				args: [("draftId".to_string(), json!(draft_id))].into(),
			})
			.await
			.map_err(push_failed)?;

		Ok(sent)
	}

	async fn list_drafts(&self) -> Result<Vec<Draft>, RemoteError> {
		Ok(self.drafts.lock().values().cloned().collect())
	}
}

pub struct CustomerBackend {
	mail: Arc<MailBackend>,
	storage_quota: u64,
}

impl CustomerFacade for CustomerBackend {
	async fn read_used_customer_storage(&self) -> Result<u64, RemoteError> {
		Ok(self.mail.used_storage())
	}

	async fn read_available_customer_storage(&self) -> Result<u64, RemoteError> {
		Ok(self.storage_quota.saturating_sub(self.mail.used_storage()))
	}
}

/// Every facade the worker exposes.
pub struct Backend {
	pub mail: Arc<MailBackend>,
	pub customer: Arc<CustomerBackend>,
}

impl Backend {
	pub fn new(notifier: Notifier, config: &WorkerConfig) -> Self {
		let mail = Arc::new(MailBackend::new(notifier));
		let customer = Arc::new(CustomerBackend {
			mail: mail.clone(),
			storage_quota: config.storage_quota,
		});

		Self { mail, customer }
	}

	pub fn commands(&self) -> CommandTable {
		expose_local([
			MailDispatch::shared(self.mail.clone()).into_local(),
			CustomerDispatch::shared(self.customer.clone()).into_local(),
		])
		.into_commands()
		.merge(test_commands())
	}
}

/// Protocol smoke tests, answered without touching any facade.
fn test_commands() -> CommandTable {
	#[derive(Deserialize)]
	struct Echo {
		msg: String,
	}

	#[derive(Deserialize)]
	#[serde(rename_all = "camelCase")]
	struct ErrorRequest {
		error_type: String,
	}

	CommandTable::new()
		.with("testEcho", |request: Request| async move {
			let echo: Echo = request.arg(0)?;
			Ok(json!({ "msg": format!(">>> {}", echo.msg) }))
		})
		.with("testError", |request: Request| async move {
			let ErrorRequest { error_type } = request.arg(0)?;

			let kind = match error_type.as_str() {
				"ProgrammingError" => ErrorKind::Programming,
				"CryptoError" => ErrorKind::Crypto,
				"NotAuthenticatedError" => ErrorKind::NotAuthenticated,
				_ => {
					return Err(RemoteError::invalid_arguments(format!(
						"unsupported error type `{error_type}`"
					)));
				}
			};

			Err(RemoteError::new(kind, format!("wtf: {error_type}")))
		})
}
