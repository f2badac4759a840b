use std::path::{Path, PathBuf};
use std::sync::Arc;

use challenge_chat::api::{ApiClient, RefreshingToken, StaticToken, TokenProvider};
use challenge_chat::config::ChatConfig;
use challenge_chat::engine::{FetchOutcome, MessageEngine, UnreadAggregator, UpdateCoordinator};
use challenge_chat::error::ChatError;
use challenge_chat::realtime::FirebaseChannel;
use challenge_chat::store::{ChallengeSource, ChallengeStore, FileBackend, Identity, LastSeenStore};
use challenge_chat::types::{ChatMessage, ImageAttachment, UserProfile};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("live updates need FIREBASE_DATABASE_URL")]
    NoLiveChannel,
    #[error("cannot read image {path}: {source}")]
    Image { path: PathBuf, source: std::io::Error },
}

#[derive(Parser, Debug)]
#[command(name = "challenge-chat", about = "Challenge chat client")]
struct Cli {
    /// Signed-in user id; required to send and to count unread messages.
    #[arg(long, env = "CHAT_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "CHAT_USER_NAME")]
    user_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List ongoing challenges.
    Challenges,
    /// Print a challenge's messages, oldest first.
    Messages {
        challenge_id: String,
        /// Load pages 1 through N.
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Send a message with optional image.
    Send {
        challenge_id: String,
        #[arg(default_value = "")]
        text: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Follow live updates and print unread totals until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ChatConfig::from_env()?;
    let identity = Identity::new(cli.user_id.map(|id| UserProfile {
        id,
        first_name: cli.user_name,
        last_name: None,
        avatar_url: None,
    }));
    let api = Arc::new(ApiClient::new(&config.api_base_url, token_provider(&config)?, config.timeouts)?);
    let last_seen = LastSeenStore::open(Box::new(FileBackend::new(&config.last_seen_path)));

    match cli.command {
        Command::Challenges => {
            let store = ChallengeStore::new(api, config.challenge_cache_ttl());
            for challenge in store.fetch_challenges(false).await? {
                println!("{}\t{}", challenge.id, challenge.title);
            }
            Ok(())
        }
        Command::Messages { challenge_id, page } => {
            let engine = MessageEngine::new(api, identity, last_seen, config.page_size);
            run_messages(&engine, &challenge_id, page).await
        }
        Command::Send { challenge_id, text, image } => {
            let engine = MessageEngine::new(api, identity, last_seen, config.page_size);
            run_send(&engine, &challenge_id, &text, image.as_deref()).await
        }
        Command::Watch => run_watch(&config, api, identity, last_seen).await,
    }
}

fn token_provider(config: &ChatConfig) -> Result<Arc<dyn TokenProvider>, ChatError> {
    Ok(match &config.refresh_token {
        Some(refresh) => Arc::new(RefreshingToken::new(
            &config.api_base_url,
            config.api_token.clone(),
            refresh.clone(),
            config.timeouts,
        )?),
        None => Arc::new(StaticToken::new(config.api_token.clone())),
    })
}

async fn run_messages(engine: &MessageEngine, challenge_id: &str, pages: u32) -> Result<(), CliError> {
    engine.open(challenge_id).await?;
    for _ in 1..pages {
        if !matches!(engine.fetch_more().await?, FetchOutcome::Applied { .. }) {
            break;
        }
    }

    let state = engine.snapshot();
    for message in state.messages.iter().rev() {
        println!("{}", format_message(message));
    }
    if state.has_more {
        println!("-- more available: --page {}", state.page + 1);
    }
    Ok(())
}

async fn run_send(engine: &MessageEngine, challenge_id: &str, text: &str, image: Option<&Path>) -> Result<(), CliError> {
    let image = match image {
        Some(path) => Some(read_image(path).await?),
        None => None,
    };
    engine.open(challenge_id).await?;
    if let Some(message) = engine.send(text, image).await? {
        println!("{}", format_message(&message));
    }
    Ok(())
}

async fn run_watch(
    config: &ChatConfig,
    api: Arc<ApiClient>,
    identity: Identity,
    last_seen: LastSeenStore,
) -> Result<(), CliError> {
    let firebase = config.firebase.clone().ok_or(CliError::NoLiveChannel)?;
    let channel = Arc::new(FirebaseChannel::new(firebase, config.timeouts)?);
    let store = Arc::new(ChallengeStore::new(api, config.challenge_cache_ttl()));

    let coordinator = UpdateCoordinator::new(channel.clone(), store.clone(), config.update_debounce());
    let aggregator = UnreadAggregator::spawn(channel, last_seen);
    coordinator.watch_ongoing(store.ongoing());
    aggregator.follow(identity.subscribe(), store.ongoing());

    let challenges = store.fetch_challenges(true).await?;
    tracing::info!(count = challenges.len(), "watching ongoing challenges");

    let mut counts = aggregator.counts();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = counts.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = counts.borrow_and_update().clone();
                let detail: Vec<String> = current
                    .per_challenge
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(id, n)| format!("{id}={n}"))
                    .collect();
                println!("unread {} [{}]", current.total, detail.join(" "));
            }
        }
    }

    coordinator.close();
    aggregator.close();
    tracing::info!(refreshes = coordinator.refresh_count(), "stopped watching");
    Ok(())
}

async fn read_image(path: &Path) -> Result<ImageAttachment, CliError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CliError::Image { path: path.to_path_buf(), source })?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
    let mime_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    };
    let file_name = path
        .file_name()
        .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(ImageAttachment { file_name, mime_type: mime_type.to_string(), bytes })
}

fn format_message(message: &ChatMessage) -> String {
    let sender = message
        .sender
        .as_ref()
        .and_then(|s| s.first_name.clone())
        .unwrap_or_else(|| message.sender_id.clone());
    let body = match (&message.content, &message.image_url) {
        (Some(text), Some(url)) => format!("{text} [{url}]"),
        (Some(text), None) => text.clone(),
        (None, Some(url)) => format!("[{url}]"),
        (None, None) => String::new(),
    };
    format!("{} {sender}: {body}", message.created_at)
}
