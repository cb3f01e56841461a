use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sochat::net::api::{ApiClient, ApiError, DEFAULT_HISTORY_LIMIT};
use sochat::net::chat_client::{ChatClient, ChatConfig, ChatEvent, ClientError};
use sochat::state::session::{SessionError, SessionStore};
use sochat::{ChatMessage, Target};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("not logged in; run `sochat-cli login <login>` first")]
    NotLoggedIn,
    #[error("api request failed: {0}")]
    Api(#[from] ApiError),
    #[error("chat connection failed: {0}")]
    Client(#[from] ClientError),
    #[error("session store error: {0}")]
    Session(#[from] SessionError),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Parser, Debug)]
#[command(name = "sochat-cli", about = "Social network chat CLI")]
struct Cli {
    #[arg(long, env = "SOCHAT_BASE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    #[arg(long, env = "SOCHAT_SESSION_FILE", default_value = ".sochat-session.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the bearer token for later commands.
    Login {
        login: String,
        #[arg(long)]
        password: String,
    },
    /// Invalidate the server session and erase stored credentials.
    Logout,
    /// Open an interactive direct conversation with a user.
    Direct { peer_id: String },
    /// Open an interactive group conversation.
    Group { group_id: i64 },
    /// Print one page of group history and exit.
    History {
        group_id: i64,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let session = SessionStore::open(cli.session_file.clone())?;

    match cli.command {
        Command::Login { ref login, ref password } => {
            run_login(&cli, session, login, password).await
        }
        Command::Logout => run_logout(&cli, session).await,
        Command::Direct { ref peer_id } => {
            let target = Target::Direct { peer_id: peer_id.clone() };
            run_chat(&cli, session, target).await
        }
        Command::Group { group_id } => run_chat(&cli, session, Target::Group { group_id }).await,
        Command::History { group_id, limit } => run_history(&cli, session, group_id, limit).await,
    }
}

async fn run_login(
    cli: &Cli,
    mut session: SessionStore,
    login: &str,
    password: &str,
) -> Result<(), CliError> {
    let api = ApiClient::new(&cli.base_url);
    let outcome = api.login(login, password).await?;
    session.save(&outcome.token, &outcome.user_id)?;
    if outcome.nickname.is_empty() {
        println!("logged in as user {}", outcome.user_id);
    } else {
        println!("logged in as {} (user {})", outcome.nickname, outcome.user_id);
    }
    Ok(())
}

async fn run_logout(cli: &Cli, mut session: SessionStore) -> Result<(), CliError> {
    if let Some(bearer) = session.bearer() {
        let api = ApiClient::new(&cli.base_url);
        // Erase local credentials even when the server call fails.
        if let Err(error) = api.logout(&bearer).await {
            eprintln!("server logout failed: {error}");
        }
    }
    session.clear()?;
    println!("logged out");
    Ok(())
}

async fn run_history(
    cli: &Cli,
    mut session: SessionStore,
    group_id: i64,
    limit: u32,
) -> Result<(), CliError> {
    let Some(bearer) = session.bearer() else {
        return Err(CliError::NotLoggedIn);
    };
    let api = ApiClient::new(&cli.base_url);
    match api.group_history(&bearer, group_id, limit).await {
        Ok(messages) => {
            for message in &messages {
                print_message(message);
            }
            Ok(())
        }
        Err(ApiError::Unauthorized) => {
            session.clear()?;
            Err(CliError::NotLoggedIn)
        }
        Err(error) => Err(CliError::Api(error)),
    }
}

async fn run_chat(cli: &Cli, session: SessionStore, target: Target) -> Result<(), CliError> {
    if !session.is_logged_in() {
        return Err(CliError::NotLoggedIn);
    }

    let config = ChatConfig::new(&cli.base_url, target);
    let (client, handle, mut events) = ChatClient::new(config, session);
    let run_task = tokio::spawn(client.run());

    let input_handle = handle.clone();
    let input_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !input_handle.send(line) {
                break;
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::History(batch) => {
                for message in &batch {
                    print_message(message);
                }
            }
            ChatEvent::Message(message) => print_message(&message),
            ChatEvent::Status(Some(status)) => eprintln!("* {status}"),
            ChatEvent::Status(None) => {}
            ChatEvent::AuthRequired(reason) => {
                eprintln!("* session expired ({reason}); log in again");
                break;
            }
            ChatEvent::Closed(message) => {
                eprintln!("* {message}");
                break;
            }
        }
    }

    handle.shutdown();
    input_task.abort();
    run_task.await??;
    Ok(())
}

fn print_message(message: &ChatMessage) {
    if message.timestamp.is_empty() {
        println!("{}: {}", message.sender, message.content);
    } else {
        println!("[{}] {}: {}", message.timestamp, message.sender, message.content);
    }
}
