use anyhow::Result;
use async_trait::async_trait;
use bridge_api::{DialogInfo, SourceEvent, SourceMessage};
use std::collections::VecDeque;
use std::path::Path;
use tokio::sync::mpsc::UnboundedReceiver;

/// Everything the archiver needs from the messaging service.
#[async_trait]
pub trait MessageSource: Send {
    /// Establish (or re-establish) the session.
    async fn connect(&mut self) -> Result<()>;

    async fn dialogs(&mut self) -> Result<Vec<DialogInfo>>;

    /// Up to `limit` messages of a dialog, newest first, strictly older
    /// than `offset_id` when given. An empty page marks the start of history.
    async fn messages_page(
        &mut self,
        dialog_id: i64,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>>;

    /// Download the media of `message` into `dest`. `false` means the media
    /// is no longer available.
    async fn download_media(&mut self, message: &SourceMessage, dest: &Path) -> Result<bool>;

    /// Deliver a local file to the archiving account's own chat.
    async fn send_to_self(&mut self, path: &Path) -> Result<()>;

    /// Start receiving push events. The channel closes when the connection
    /// drops.
    async fn subscribe(&mut self) -> Result<UnboundedReceiver<SourceEvent>>;

    /// Ask the service to replay events missed while disconnected.
    async fn catch_up(&mut self) -> Result<()>;
}

/// Newest-first walk over one dialog's history, fetched page by page.
///
/// Dropping the pager mid-way is fine; creating a new one starts over from
/// the newest message.
pub struct MessagePager {
    dialog_id: i64,
    page_size: usize,
    buffer: VecDeque<SourceMessage>,
    offset_id: Option<i64>,
    exhausted: bool,
}

impl MessagePager {
    pub fn new(dialog_id: i64, page_size: usize) -> Self {
        Self {
            dialog_id,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            offset_id: None,
            exhausted: false,
        }
    }

    pub async fn next<S: MessageSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<SourceMessage>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = source
                .messages_page(self.dialog_id, self.offset_id, self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.offset_id = Some(last.id);
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }
}
