//! Append-only action log with an optional CSV file sink.
//!
//! Every broadcast the router performs is recorded here. The in-memory
//! sequence is what [`ActionLog::query`] searches; the file is a write-only
//! audit trail and is best-effort: if it cannot be opened or written, the
//! log keeps going in memory and says so once.
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// `message`, `enter`, `leave`, `connect`, `disconnect`.
    pub command: String,
    pub content: String,
    pub username: String,
    #[serde(rename = "ip")]
    pub remote_address: String,
    pub timestamp: String,
}

impl Action {
    /// Build an action stamped with the current UTC time.
    pub fn now(
        command: impl Into<String>,
        content: impl Into<String>,
        username: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            content: content.into(),
            username: username.into(),
            remote_address: remote_address.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// One row of the file log, newline included.
    ///
    /// Column order is user, command, content, timestamp, address. Empty
    /// content is written as `N/A`.
    pub fn to_csv_row(&self) -> String {
        let content = if self.content.is_empty() {
            "N/A"
        } else {
            &self.content
        };
        format!(
            "\"{}\", \"{}\", \"{}\", \"{}\", \"{}\"\n",
            csv_escape(&self.username),
            csv_escape(&self.command),
            csv_escape(content),
            csv_escape(&self.timestamp),
            csv_escape(&self.remote_address),
        )
    }
}

/// Double embedded quotes.
pub fn csv_escape(value: &str) -> String {
    value.replace('"', "\"\"")
}

/// Conjunctive filter over the log. Absent or empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActionFilter {
    /// Exact command name.
    #[serde(rename = "type", default)]
    pub command: Option<String>,
    /// Substring of the content.
    #[serde(default)]
    pub search: Option<String>,
    /// Exact username.
    #[serde(default)]
    pub username: Option<String>,
}

impl ActionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn matches(&self, action: &Action) -> bool {
        if let Some(command) = non_empty(&self.command) {
            if action.command != command {
                return false;
            }
        }
        if let Some(search) = non_empty(&self.search) {
            if !action.content.contains(search) {
                return false;
            }
        }
        if let Some(username) = non_empty(&self.username) {
            if action.username != username {
                return false;
            }
        }
        true
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

#[derive(Debug)]
struct FileSink {
    path: PathBuf,
    file: File,
}

/// In-memory action sequence plus optional file sink.
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: RwLock<Vec<Action>>,
    /// Also serialises appends, so file order matches memory order.
    sink: Mutex<Option<FileSink>>,
}

impl ActionLog {
    /// A log that only keeps actions in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A log that also appends to `path`, creating it if absent.
    ///
    /// Falls back to memory only if the file cannot be opened.
    pub async fn with_file(path: &Path) -> Self {
        let sink = match open_append(path).await {
            Ok(file) => {
                info!(path = %path.display(), "action log file opened");
                Some(FileSink {
                    path: path.to_owned(),
                    file,
                })
            }
            Err(e) => {
                warn!(path = %path.display(), "cannot open action log file, logging in memory only: {e}");
                None
            }
        };
        Self {
            entries: RwLock::new(Vec::new()),
            sink: Mutex::new(sink),
        }
    }

    /// Open from an optional configured path.
    pub async fn open(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::with_file(path).await,
            None => Self::in_memory(),
        }
    }

    /// Append one action.
    pub async fn record(&self, action: Action) {
        let mut sink = self.sink.lock().await;

        let mut failed = false;
        if let Some(fs) = sink.as_mut() {
            debug!(
                command = %action.command,
                username = %action.username,
                "logging action to file"
            );
            let row = action.to_csv_row();
            let written = match fs.file.write_all(row.as_bytes()).await {
                Ok(()) => fs.file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(path = %fs.path.display(), "action log write failed, logging in memory only: {e}");
                failed = true;
            }
        }
        if failed {
            *sink = None;
        }

        self.entries.write().await.push(action);
    }

    /// Every action matching `filter`, in log order.
    pub async fn query(&self, filter: &ActionFilter) -> Vec<Action> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Whether actions are still being written to a file.
    pub async fn has_file(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
