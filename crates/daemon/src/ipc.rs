//! Line-delimited JSON between the daemon and its host process.
//!
//! Requests arrive on stdin tagged by `event`. Replies and library events
//! leave on stdout as `{"channel": ..., "payload": ...}` objects.

use std::time::Duration;

use library::{EventReceiver, LibraryEvent, LibraryStore, LocalLibrary};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::watch::FolderWatcher;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Request {
    GetMetas,
    #[serde(rename = "get-localfolders")]
    GetLocalFolders,
    #[serde(rename = "set-localfolders")]
    SetLocalFolders { paths: Vec<String> },
    #[serde(rename = "remove-localfolder")]
    RemoveLocalFolder { path: String },
    #[serde(rename = "refresh-localfolders")]
    RefreshLocalFolders,
    QueueDrop { paths: Vec<String> },
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::GetMetas => "get-metas",
            Request::GetLocalFolders => "get-localfolders",
            Request::SetLocalFolders { .. } => "set-localfolders",
            Request::RemoveLocalFolder { .. } => "remove-localfolder",
            Request::RefreshLocalFolders => "refresh-localfolders",
            Request::QueueDrop { .. } => "queue-drop",
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Outbound {
    pub channel: String,
    pub payload: Value,
}

impl Outbound {
    pub fn reply(channel: &str, payload: Value) -> Self {
        Self {
            channel: channel.to_string(),
            payload,
        }
    }

    pub fn from_event(event: &LibraryEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: event.channel().to_string(),
            payload: event.payload()?,
        })
    }

    fn error(message: impl std::fmt::Display) -> Self {
        Self::reply("local-files-error", json!({ "message": message.to_string() }))
    }
}

pub type ReplySender = mpsc::Sender<Outbound>;

/// Reads requests until EOF. Each request runs on its own task so a long
/// scan does not hold up the next line.
pub async fn serve<R, S>(
    input: R,
    library: LocalLibrary<S>,
    watcher: FolderWatcher,
    replies: ReplySender,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    S: LibraryStore,
{
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                warn!("Ignoring malformed request: {}", err);
                let _ = replies
                    .send(Outbound::reply(
                        "ipc-error",
                        json!({ "message": err.to_string() }),
                    ))
                    .await;
                continue;
            }
        };
        debug!("Request {}", request.name());
        let library = library.clone();
        let watcher = watcher.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle(request, &library, &watcher).await {
                let _ = replies.send(reply).await;
            }
        });
    }
    info!("Host closed stdin");
    Ok(())
}

pub async fn handle<S: LibraryStore>(
    request: Request,
    library: &LocalLibrary<S>,
    watcher: &FolderWatcher,
) -> Option<Outbound> {
    let channel = request.name();
    match request {
        Request::GetMetas => Some(match library.get_metas().await {
            Ok(tracks) => Outbound::reply(channel, to_value(&tracks)),
            Err(err) => Outbound::error(err),
        }),
        Request::GetLocalFolders => Some(match library.get_local_folders().await {
            Ok(folders) => Outbound::reply(channel, to_value(&folders)),
            Err(err) => Outbound::error(err),
        }),
        Request::SetLocalFolders { paths } => {
            let result = library.set_folders(paths).await;
            rewatch(library, watcher).await;
            match result {
                Ok(summary) => Some(Outbound::reply(channel, to_value(&summary))),
                Err(err) if err.is_cancelled() => {
                    info!("Folder scan superseded by a newer scan");
                    None
                }
                Err(err) => {
                    warn!("Adding folders failed: {}", err);
                    Some(Outbound::error(err))
                }
            }
        }
        Request::RemoveLocalFolder { path } => {
            let result = library.remove_folder(&path).await;
            rewatch(library, watcher).await;
            Some(match result {
                Ok(removed) => Outbound::reply(channel, json!({ "removed": removed.len() })),
                Err(err) => {
                    warn!("Removing {} failed: {}", path, err);
                    Outbound::error(err)
                }
            })
        }
        Request::RefreshLocalFolders => {
            let summary = library.refresh_all().await;
            Some(Outbound::reply(channel, to_value(&summary)))
        }
        Request::QueueDrop { paths } => match library.import_single_files(paths).await {
            Ok(_) => None,
            Err(err) => Some(Outbound::error(err)),
        },
    }
}

async fn rewatch<S: LibraryStore>(library: &LocalLibrary<S>, watcher: &FolderWatcher) {
    match library.get_local_folders().await {
        Ok(folders) => watcher.configure(&folders),
        Err(err) => warn!("Failed to read folders for watcher: {}", err),
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Drains library events and request replies onto `output`, one JSON object
/// per line. Returns once both sources are closed.
pub async fn write_outbound<W>(
    mut output: W,
    mut events: EventReceiver,
    mut replies: mpsc::Receiver<Outbound>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut events_open = true;
    let mut replies_open = true;
    while events_open || replies_open {
        let message = tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => match Outbound::from_event(&event) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("Failed to encode {} event: {}", event.channel(), err);
                        continue;
                    }
                },
                None => {
                    events_open = false;
                    continue;
                }
            },
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => reply,
                None => {
                    replies_open = false;
                    continue;
                }
            },
        };
        let mut line = serde_json::to_vec(&message).map_err(std::io::Error::from)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

/// Lets the writer flush what request tasks still have in flight. The
/// writer ends on its own once every library handle and reply sender is
/// gone; past `timeout` it is aborted. Returns whether it finished.
pub async fn drain_writer(
    mut writer: JoinHandle<std::io::Result<()>>,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, &mut writer).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(err))) => {
            warn!("Failed writing to host: {}", err);
            false
        }
        Ok(Err(err)) => {
            warn!("Writer task failed: {}", err);
            false
        }
        Err(_) => {
            warn!("Timed out flushing host events");
            writer.abort();
            false
        }
    }
}
