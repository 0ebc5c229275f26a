//! PairChat terminal client: one conversation, history plus live updates
use colored::Colorize;
use pairchat_core::{
    conversation_id, ChatError, Config, DirectoryIndex, Message, MessageStore, SyncSession,
    UserDirectory, UserRef,
};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let me = UserRef::new(config.user_id.clone(), config.display_name.clone());
    let conversation = conversation_id(&me.id, &config.peer_id)?;

    let users = UserDirectory::open(&config.data_dir)?;
    users.register(&me)?;
    let peer_name = users
        .get(&config.peer_id)?
        .map(|e| e.display_name)
        .unwrap_or_else(|| config.peer_id.clone());
    let directory = DirectoryIndex::new(Arc::new(users));

    let store = MessageStore::open(&config)?;
    info!("Chatting as {} in {}", me.id, conversation);

    let my_id = me.id.clone();
    let mut shown = 0usize;
    let session = SyncSession::open(&store, conversation.clone(), move |messages: &[Message]| {
        for message in &messages[shown.min(messages.len())..] {
            print_message(message, &my_id);
        }
        shown = messages.len();
    })
    .await?;

    println!(
        "{} {} {}",
        "Chat with".bold(),
        peer_name.cyan().bold(),
        "(/users [query], /peer <text>, /quit)".dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input == "/quit" {
            break;
        }
        if input == "/users" || input.starts_with("/users ") {
            let query = input.trim_start_matches("/users").trim();
            let entries = directory.list(&me.id)?;
            for entry in DirectoryIndex::filter(&entries, query) {
                println!("  {} {}", entry.display_name.cyan(), entry.id.dimmed());
            }
            continue;
        }

        // `/peer <text>` writes as the other side, so one terminal can play both
        let result = match input.strip_prefix("/peer ") {
            Some(text) => store.append(&conversation, &config.peer_id, &me.id, text).await,
            None => store.append(&conversation, &me.id, &config.peer_id, &line).await,
        };
        match result {
            Ok(_) | Err(ChatError::EmptyMessage) => {}
            Err(e) => eprintln!("{} {}", "send failed:".red(), e),
        }
    }

    session.close().await;
    Ok(())
}

fn print_message(message: &Message, my_id: &str) {
    let who = if message.is_from(my_id) {
        "you".green().bold()
    } else {
        message.sender_id.as_str().cyan().bold()
    };
    println!(
        "{} {}: {}",
        message.time_label().dimmed(),
        who,
        message.body
    );
}
