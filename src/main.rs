use std::{path::PathBuf, sync::Arc};

use clap::Parser as _;
use config::Config;
use frontend::Frontend;
use serde_json::Value;

mod backend;
mod config;
mod frontend;
mod logger;
mod server;

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to configuration file (`.json`, `.json5` or `.jsonc`).
	#[arg(long, short, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
	/// Run the worker, serving every connection its own backend.
	Serve,

	/// Call a facade method on a running worker and print the result.
	Call {
		facade: String,
		method: String,

		/// Positional arguments as a JSON5 array.
		#[arg(default_value = "[]")]
		args: String,
	},

	/// Round-trip a message through `testEcho`.
	Echo { message: String },

	/// Create and send a draft, printing pushes as they arrive.
	Demo {
		#[arg(long, default_value = "someone@example.org")]
		to: Vec<String>,
	},
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let args = Args::parse();
	let config = Arc::new(Config::load(args.config.as_deref())?);

	let _logger = logger::setup_logger(config.log_level)?;
	log::debug!("{:?}", args);
	log::debug!("{:?}", config);

	match args.command {
		Command::Serve => serve(config).await,

		command => {
			let frontend = Frontend::connect(config.server.addr).await?;
			let result = run_client(&frontend, command).await;
			frontend.close().await?;
			result
		}
	}
}

async fn serve(config: Arc<Config>) -> eyre::Result<()> {
	let shutdown_token = tokio_util::sync::CancellationToken::new();

	let shutdown_token_clone = shutdown_token.clone();
	tokio::spawn(async move {
		if let Err(e) = tokio::signal::ctrl_c().await {
			log::error!("Failed to listen for Ctrl-C: {}", e);
			return;
		}

		log::info!("🛑 Sending shutdown signal (PID {})", std::process::id());
		shutdown_token_clone.cancel();
	});

	let tracker = tokio_util::task::TaskTracker::new();

	let shutdown_token_clone = shutdown_token.clone();
	let server_handle = tracker.spawn(async move {
		if let Err(e) = server::run(config, shutdown_token_clone.child_token()).await {
			log::error!("{:?}", e);
			shutdown_token_clone.cancel();
		}
	});

	tracker.close();

	match server_handle.await {
		Ok(()) => log::debug!("✨ Clean exit"),
		Err(e) => {
			log::error!("{}", e);
			shutdown_token.cancel();
		}
	}

	tracker.wait().await;

	Ok(())
}

async fn run_client(frontend: &Frontend, command: Command) -> eyre::Result<()> {
	match command {
		Command::Serve => eyre::bail!("`serve` runs the worker, not a client"),

		Command::Call {
			facade,
			method,
			args,
		} => {
			let args: Vec<Value> = json5::from_str(&args)?;
			let value = frontend.call(&facade, &method, args).await?;
			println!("{}", serde_json::to_string_pretty(&value)?);
		}

		Command::Echo { message } => println!("{}", frontend.echo(&message).await?),
		Command::Demo { to } => demo(frontend, to).await?,
	}

	Ok(())
}

async fn demo(frontend: &Frontend, to: Vec<String>) -> eyre::Result<()> {
	let mail = backend::MailClient::new(frontend.queue().clone());
	let customer = backend::CustomerClient::new(frontend.queue().clone());

	let draft = mail
		.create_draft(
			"Hello from the main context".to_string(),
			"Sent through the worker queue.".to_string(),
			to,
		)
		.await?;
	log::info!("📝 Created {}", draft.id);

	let sent = mail.send_draft(draft.id).await?;
	log::info!("📨 Sent {} to {} recipient(s)", sent.id, sent.recipients.len());

	println!(
		"{}",
		serde_json::to_string_pretty(&serde_json::json!({
			"draft": sent,
			"usedStorage": customer.read_used_customer_storage().await?,
			"availableStorage": customer.read_available_customer_storage().await?,
			"completedMonitors": frontend.handler().completed_monitors(),
		}))?
	);

	Ok(())
}
