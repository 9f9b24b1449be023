use std::{collections::HashMap, path::Path, process::Stdio, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bridge_api::{DialogInfo, Envelope, Hello, Kind, SourceEvent, SourceMessage};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    process::{Child, Command},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ArchiveError;
use crate::source::MessageSource;

const EVENT_TOPICS: [&str; 4] = [
    "message.new",
    "message.edited",
    "message.read",
    "message.deleted",
];

/// Read a single line-delimited JSON envelope from the reader.
pub async fn read_envelope<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        anyhow::bail!("bridge closed pipe");
    }
    let env = serde_json::from_str(line.trim())?;
    Ok(env)
}

/// Write a single envelope as line-delimited JSON to the writer.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, env: &Envelope) -> Result<()> {
    let s = serde_json::to_string(env)?;
    writer.write_all(s.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Waiting callers by request id; `None` once the bridge has gone away.
type Pending = Arc<Mutex<Option<HashMap<String, oneshot::Sender<Envelope>>>>>;
type EventSink = Arc<Mutex<Option<UnboundedSender<SourceEvent>>>>;
type BoxWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// One live request/response channel to the bridge process.
///
/// A reader task routes responses to their waiting callers and forwards
/// events into the current subscription. When the bridge's output ends,
/// pending callers fail and the subscription closes.
pub struct BridgeLink {
    writer: BoxWriter,
    pending: Pending,
    events: EventSink,
    reader: JoinHandle<()>,
}

impl BridgeLink {
    pub fn start<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let events: EventSink = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(route(BufReader::new(reader), pending.clone(), events.clone()));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: BufWriter::new(writer),
            pending,
            events,
            reader,
        }
    }

    /// Whether the bridge's output has ended.
    pub fn is_closed(&self) -> bool {
        self.pending.lock().is_none()
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let env = Envelope::request(id.clone(), method, params);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(waiting) => waiting.insert(id.clone(), tx),
            None => return Err(ArchiveError::Disconnected.into()),
        };
        if let Err(err) = write_envelope(&mut self.writer, &env).await {
            if let Some(waiting) = self.pending.lock().as_mut() {
                waiting.remove(&id);
            }
            return Err(err.context(ArchiveError::Disconnected));
        }
        let resp = rx.await.map_err(|_| ArchiveError::Disconnected)?;
        if let Some(err) = resp.error {
            return Err(ArchiveError::Bridge {
                code: err.code,
                message: err.message,
            }
            .into());
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    async fn call_as<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> Result<T> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).with_context(|| format!("decoding {method} response"))
    }

    /// Route subsequent events into a fresh channel. Any earlier
    /// subscription is closed.
    pub fn attach_events(&self) -> UnboundedReceiver<SourceEvent> {
        let (tx, rx) = unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route<R: AsyncBufRead + Unpin>(mut reader: R, pending: Pending, events: EventSink) {
    loop {
        match read_envelope(&mut reader).await {
            Ok(env) => match env.kind {
                Kind::Response => {
                    if let Some(id) = env.id.clone() {
                        let waiter = pending.lock().as_mut().and_then(|w| w.remove(&id));
                        if let Some(tx) = waiter {
                            let _ = tx.send(env);
                        } else {
                            debug!(%id, "response without a waiting request");
                        }
                    }
                }
                Kind::Event => {
                    let topic = env.topic.unwrap_or_default();
                    let payload = env.payload.unwrap_or(Value::Null);
                    match serde_json::from_value::<SourceEvent>(payload) {
                        Ok(event) => {
                            if let Some(tx) = events.lock().as_ref() {
                                let _ = tx.send(event);
                            }
                        }
                        Err(err) => warn!(%topic, "undecodable event: {err}"),
                    }
                }
                Kind::Request => {
                    debug!(method = ?env.method, "ignoring request from bridge");
                }
            },
            Err(err) => {
                warn!("bridge connection ended: {err}");
                break;
            }
        }
    }
    // dropping the senders fails every waiting call and ends the subscription
    pending.lock().take();
    events.lock().take();
}

/// How to start the bridge process and what to greet it with.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub command: String,
    pub args: Vec<String>,
    pub api_id: String,
    pub api_hash: String,
    pub session: String,
}

/// `MessageSource` backed by an external bridge program speaking
/// line-delimited JSON envelopes over its stdio.
pub struct BridgeSource {
    settings: BridgeSettings,
    child: Option<Child>,
    link: Option<BridgeLink>,
}

impl BridgeSource {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            child: None,
            link: None,
        }
    }

    fn link(&mut self) -> Result<&mut BridgeLink> {
        self.link
            .as_mut()
            .ok_or_else(|| ArchiveError::Disconnected.into())
    }

    async fn handshake(&mut self) -> Result<()> {
        let hello = Hello {
            api_id: self.settings.api_id.clone(),
            api_hash: self.settings.api_hash.clone(),
            session: self.settings.session.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
        };
        let params = serde_json::to_value(hello)?;
        self.link()?.call("bridge.hello", params).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for BridgeSource {
    async fn connect(&mut self) -> Result<()> {
        if self.link.as_ref().is_some_and(|link| !link.is_closed()) {
            return Ok(());
        }
        self.link = None;
        if let Some(mut old) = self.child.take() {
            let _ = old.kill().await;
        }
        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning bridge {}", self.settings.command))?;
        let stdin = child.stdin.take().context("bridge stdin not piped")?;
        let stdout = child.stdout.take().context("bridge stdout not piped")?;
        self.link = Some(BridgeLink::start(stdout, stdin));
        self.child = Some(child);
        self.handshake().await?;
        info!(command = %self.settings.command, "bridge connected");
        Ok(())
    }

    async fn dialogs(&mut self) -> Result<Vec<DialogInfo>> {
        self.link()?.call_as("dialogs.list", json!({})).await
    }

    async fn messages_page(
        &mut self,
        dialog_id: i64,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        self.link()?
            .call_as(
                "messages.page",
                json!({"dialog_id": dialog_id, "offset_id": offset_id, "limit": limit}),
            )
            .await
    }

    async fn download_media(&mut self, message: &SourceMessage, dest: &Path) -> Result<bool> {
        let result = self
            .link()?
            .call(
                "media.download",
                json!({
                    "dialog_id": message.dialog_id,
                    "message_id": message.id,
                    "dest": dest.to_string_lossy(),
                }),
            )
            .await?;
        Ok(result
            .get("downloaded")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn send_to_self(&mut self, path: &Path) -> Result<()> {
        self.link()?
            .call("media.send_to_self", json!({"path": path.to_string_lossy()}))
            .await?;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<UnboundedReceiver<SourceEvent>> {
        let link = self.link()?;
        let rx = link.attach_events();
        link.call("events.subscribe", json!({"topics": EVENT_TOPICS}))
            .await?;
        Ok(rx)
    }

    async fn catch_up(&mut self) -> Result<()> {
        self.link()?.call("events.catch_up", json!({})).await?;
        Ok(())
    }
}
