//! Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_DATA_DIR: &str = ".pairchat";

/// Chat client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Our own user id (from the identity provider)
    pub user_id: String,

    /// Name shown to other users in the directory
    pub display_name: String,

    /// Who we are talking to
    pub peer_id: String,

    /// Where message history and the user directory live
    pub data_dir: PathBuf,

    /// fsync every append before reporting success
    pub flush_on_append: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            display_name: String::new(),
            peer_id: String::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            flush_on_append: true,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <user-id> <peer-id> [--name <display name>] [--data-dir <path>] [--no-flush]",
                args.first().map(String::as_str).unwrap_or("pairchat")
            )));
        }

        let user_id = args[1].clone();
        let peer_id = args[2].clone();
        let mut display_name: Option<String> = None;
        let mut data_dir: Option<PathBuf> = None;
        let mut flush_on_append = true;

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--name" => {
                    let name = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--name requires a value".to_string())
                    })?;
                    display_name = Some(name.clone());
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--no-flush" => {
                    flush_on_append = false;
                    i += 1;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("PAIRCHAT_DATA_DIR") {
            if !dir.is_empty() {
                data_dir = Some(PathBuf::from(dir));
            }
        }
        if std::env::var("PAIRCHAT_NO_FLUSH").is_ok() {
            flush_on_append = false;
        }

        Ok(Self {
            display_name: display_name.unwrap_or_else(|| user_id.clone()),
            user_id,
            peer_id,
            data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            flush_on_append,
        })
    }
}
