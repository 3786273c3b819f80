/// MatchChat terminal client - main entry point
use matchchat_core::{ChatError, ChatSession, Config, HttpBackend, LocalId, UserId};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let backend = Arc::new(HttpBackend::from_config(&config)?);
    info!("Starting chat for user {}", config.user_id);
    info!("   API: {}", config.api_base);
    info!("   Transport: {}", config.ws_url);

    let session = ChatSession::start(config, backend)
        .await
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;

    // Session events go to stdout as JSON lines
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command(session: &ChatSession, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/select" => match arg.trim().parse::<UserId>() {
            Ok(counterpart) => {
                session.select(counterpart).await;
            }
            Err(_) => eprintln!("Usage: /select <user_id>"),
        },
        "/retry" => match arg.trim().parse::<LocalId>() {
            Ok(local_id) => report(session.retry(local_id).await),
            Err(_) => eprintln!("Usage: /retry <local_id>"),
        },
        "/older" => match session.load_older().await {
            Ok(count) => eprintln!("Loaded {} older messages", count),
            Err(e) => eprintln!("{}", e),
        },
        "/roster" => {
            let size = session.reload_roster().await;
            eprintln!("{} connections", size);
        }
        "/view" => match serde_json::to_string_pretty(&session.view().await) {
            Ok(view) => println!("{}", view),
            Err(e) => eprintln!("{}", e),
        },
        _ => report(session.send_message(line).await),
    }
    true
}

fn report<T>(result: Result<T, ChatError>) {
    if let Err(e) = result {
        eprintln!("{}", e);
    }
}
