use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error};

use visage::client::{AvatarChat, FailureKind, TurnError};
use visage::dialog::{DialogClient, DialogConfig, DialogError};
use visage::session::SessionStore;
use visage::signaling::{AvatarConfig, SignalingClient, SignalingError};
use visage::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use visage::transcribe::{TranscribeConfig, TranscribeError, TranscriptionClient};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let mut cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, "logging configured");

    let command = cli.command.take();
    match command {
        Some(Command::Chat) | None => handle_chat(&cli).await,
        Some(Command::Talk(args)) => handle_talk(&cli, args).await,
        Some(Command::Transcribe(args)) => handle_transcribe(&cli, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "visage",
    about = "Drive a streaming talking-avatar session from the terminal",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "VISAGE_AVATAR_API",
        default_value = "https://api.d-id.com/talks",
        help = "Base URL of the avatar streaming API"
    )]
    avatar_api: String,

    #[arg(
        long,
        global = true,
        env = "VISAGE_AVATAR_KEY",
        hide_env_values = true,
        default_value = "",
        help = "Avatar API key (Basic auth; user:pass form is encoded automatically)"
    )]
    avatar_key: String,

    #[arg(
        long,
        global = true,
        env = "VISAGE_SOURCE_URL",
        default_value = "https://clips-presenters.d-id.com/alyssa/fIa7P15FTv/PWEobsgYC8/thumbnail.png",
        help = "Portrait image the avatar is rendered from"
    )]
    source_url: String,

    #[arg(
        long,
        global = true,
        env = "VISAGE_VOICE_PROVIDER",
        default_value = "microsoft",
        help = "Text-to-speech provider for talk scripts"
    )]
    voice_provider: String,

    #[arg(
        long,
        global = true,
        env = "VISAGE_VOICE_ID",
        default_value = "en-US-JennyNeural",
        help = "Voice id for talk scripts"
    )]
    voice_id: String,

    #[arg(
        long,
        global = true,
        env = "VISAGE_STREAM_WARMUP",
        help = "Ask the provider to warm the stream up before first talk"
    )]
    stream_warmup: bool,

    #[arg(
        long,
        global = true,
        env = "VISAGE_DIALOG_API",
        help = "Base URL of the dialogue-management API (omit to talk directly)"
    )]
    dialog_api: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VISAGE_DIALOG_KEY",
        hide_env_values = true,
        help = "Dialogue-management API key"
    )]
    dialog_key: Option<String>,

    #[arg(
        long,
        global = true,
        env = "VISAGE_ASR_API",
        help = "Base URL of the speech-to-text proxy"
    )]
    asr_api: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "VISAGE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "VISAGE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat: each line is routed through the dialogue service
    /// (or spoken directly when none is configured).
    Chat,
    /// Initialize the stream and speak a single line of text.
    Talk(TalkArgs),
    /// Transcribe a recorded audio file through the speech-to-text proxy.
    Transcribe(TranscribeArgs),
}

#[derive(Args, Debug)]
struct TalkArgs {
    #[arg(long, help = "Text for the avatar to speak")]
    text: String,
}

#[derive(Args, Debug)]
struct TranscribeArgs {
    #[arg(long, value_name = "PATH", help = "Audio file to transcribe")]
    audio: PathBuf,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("{0}")]
    StreamInit(&'static str),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Transcribe(#[from] TranscribeError),
    #[error("--asr-api (or VISAGE_ASR_API) is required for transcription")]
    MissingAsrEndpoint,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn build_chat(cli: &Cli) -> Result<AvatarChat, CliError> {
    let config = AvatarConfig::new(&cli.avatar_api, cli.avatar_key.clone())?
        .with_voice(cli.voice_provider.clone(), cli.voice_id.clone())
        .with_stream_warmup(cli.stream_warmup);
    let signaling = Arc::new(SignalingClient::new(config)?);
    let store = Arc::new(SessionStore::new());
    let mut chat = AvatarChat::new(signaling, store);

    if let Some(dialog_api) = &cli.dialog_api {
        let key = cli.dialog_key.clone().unwrap_or_default();
        let dialog = DialogClient::new(DialogConfig::new(dialog_api, key)?)?;
        chat = chat.with_dialog(dialog);
    }
    Ok(chat)
}

async fn initialize_or_report(chat: &AvatarChat, source_url: &str) -> Result<(), CliError> {
    if let Err(err) = chat.initialize(source_url).await {
        let kind = FailureKind::classify(&err);
        error!(error = %err, ?kind, "stream initialization failed");
        return Err(CliError::StreamInit(kind.user_message()));
    }
    Ok(())
}

async fn handle_chat(cli: &Cli) -> Result<(), CliError> {
    let chat = build_chat(cli)?;
    initialize_or_report(&chat, &cli.source_url).await?;
    println!("connected; type a message, or /quit to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }
        match chat.send_turn(text).await {
            Ok(reply) => println!("avatar> {reply}"),
            Err(TurnError::NoDialogRoute) => {
                // No dialogue service: speak the line verbatim.
                chat.say(text).await?;
                println!("avatar> (speaking)");
            }
            Err(err) => {
                error!(error = %err, "turn failed");
                eprintln!("turn failed: {err}");
            }
        }
    }

    chat.shutdown().await;
    Ok(())
}

async fn handle_talk(cli: &Cli, args: TalkArgs) -> Result<(), CliError> {
    let chat = build_chat(cli)?;
    initialize_or_report(&chat, &cli.source_url).await?;
    chat.say(&args.text).await?;
    println!("talk request accepted");
    chat.shutdown().await;
    Ok(())
}

async fn handle_transcribe(cli: &Cli, args: TranscribeArgs) -> Result<(), CliError> {
    let asr_api = cli.asr_api.as_ref().ok_or(CliError::MissingAsrEndpoint)?;
    let client = TranscriptionClient::new(TranscribeConfig::new(asr_api)?)?;
    let audio = std::fs::read(&args.audio)?;
    let file_name = args
        .audio
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio.mp3".to_string());
    let text = client.transcribe(audio, &file_name).await?;
    println!("{text}");
    Ok(())
}
