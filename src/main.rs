use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use courier_gateway::delivery::{DeliveryQueue, Job, MessageSender, Outcome};
use courier_gateway::telegram::{InputFile, ParseMode, SendMessage, SendPhoto};
use courier_gateway::{Config, Daemon, daemon};

/// Courier - Telegram delivery gateway
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "COURIER_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and delivery workers (default)
    Serve,
    /// Register the configured webhook URL with Telegram
    SetWebhook {
        /// Override `TELEGRAM_WEBHOOK_URL`
        #[arg(long)]
        url: Option<String>,
        /// Discard updates Telegram is still holding
        #[arg(long)]
        drop_pending_updates: bool,
    },
    /// Remove the webhook
    DeleteWebhook {
        /// Discard updates Telegram is still holding
        #[arg(long)]
        drop_pending_updates: bool,
    },
    /// Show webhook status as Telegram sees it
    WebhookInfo,
    /// Check the bot token with getMe
    TestConnection,
    /// Send one message through the delivery queue
    Send {
        /// Target chat id
        #[arg(long)]
        chat: i64,
        /// Message text, or photo caption with --photo
        text: String,
        /// Photo URL, `file_id`, or local file path
        #[arg(long)]
        photo: Option<String>,
        /// Parse text as HTML
        #[arg(long)]
        html: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,courier_gateway=info",
        1 => "info,courier_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(
                port = config.server.port,
                queue = %config.delivery.name,
                workers = config.delivery.workers,
                "starting courier gateway"
            );
            Daemon::new(config).run().await?;
        }
        Command::SetWebhook {
            url,
            drop_pending_updates,
        } => set_webhook(config, url, drop_pending_updates).await?,
        Command::DeleteWebhook {
            drop_pending_updates,
        } => {
            let api = daemon::bot_api(&config)?;
            api.delete_webhook(drop_pending_updates).await?;
            println!("Webhook deleted");
        }
        Command::WebhookInfo => webhook_info(&config).await?,
        Command::TestConnection => {
            let api = daemon::bot_api(&config)?;
            let me = api.get_me().await?;
            println!(
                "Connected as {} (@{}, id {})",
                me.first_name,
                me.username.as_deref().unwrap_or("-"),
                me.id
            );
        }
        Command::Send {
            chat,
            text,
            photo,
            html,
        } => send(&config, chat, text, photo, html).await?,
    }

    Ok(())
}

async fn set_webhook(
    mut config: Config,
    url: Option<String>,
    drop_pending_updates: bool,
) -> anyhow::Result<()> {
    if url.is_some() {
        config.telegram.webhook_url = url;
    }

    let mut webhook = config.webhook_config()?;
    if drop_pending_updates {
        webhook.drop_pending_updates = Some(true);
    }

    let api = daemon::bot_api(&config)?;
    api.set_webhook(&webhook).await?;
    println!("Webhook set to {}", webhook.url);
    Ok(())
}

async fn webhook_info(config: &Config) -> anyhow::Result<()> {
    let api = daemon::bot_api(config)?;
    let info = api.get_webhook_info().await?;

    if info.url.is_empty() {
        println!("No webhook registered");
    } else {
        println!("URL:              {}", info.url);
    }
    println!("Pending updates:  {}", info.pending_update_count);
    if let Some(max) = info.max_connections {
        println!("Max connections:  {max}");
    }
    if let Some(updates) = &info.allowed_updates {
        println!("Allowed updates:  {}", updates.join(", "));
    }
    if let Some(message) = &info.last_error_message {
        let at = info
            .last_error_date
            .map_or_else(|| "unknown time".to_string(), |d| d.to_rfc3339());
        println!("Last error:       {message} ({at})");
    }
    Ok(())
}

async fn send(
    config: &Config,
    chat: i64,
    text: String,
    photo: Option<String>,
    html: bool,
) -> anyhow::Result<()> {
    let api = Arc::new(daemon::bot_api(config)?);
    let parse_mode = html.then_some(ParseMode::Html);

    let job = match photo {
        Some(source) => {
            let mut request = SendPhoto::new(chat, input_file(source)?).caption(text);
            request.parse_mode = parse_mode;
            Job::Photo(request)
        }
        None => {
            let mut request = SendMessage::new(chat, text);
            request.parse_mode = parse_mode;
            Job::Message(request)
        }
    };

    let queue = Arc::new(DeliveryQueue::new(config.delivery.clone()));
    let mut reports = queue.subscribe();
    let workers = queue.start(api as Arc<dyn MessageSender>);
    queue.enqueue(job)?;

    let report = reports.recv().await?;
    workers.shutdown().await;

    match report.outcome {
        Outcome::Sent => {
            println!("Sent to chat {chat} after {} attempt(s)", report.attempts);
            Ok(())
        }
        Outcome::Failed { error } => {
            anyhow::bail!("delivery failed after {} attempt(s): {error}", report.attempts)
        }
    }
}

/// Interpret a photo argument as URL, local file, or Telegram `file_id`
fn input_file(source: String) -> anyhow::Result<InputFile> {
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(InputFile::Url(source));
    }

    let path = PathBuf::from(&source);
    if path.is_file() {
        let bytes = std::fs::read(&path)?;
        let file_name = path
            .file_name()
            .map_or_else(|| "photo.jpg".to_string(), |n| n.to_string_lossy().into_owned());
        return Ok(InputFile::Upload { file_name, bytes });
    }

    Ok(InputFile::FileId(source))
}
