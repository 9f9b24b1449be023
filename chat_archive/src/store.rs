use crate::db;
use crate::error::ArchiveError;
use crate::model::{DialogEntry, Message};
use crate::timefmt;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// In-process copy of the dialogs table. Loaded lazily and kept in step
/// with every dialog write.
#[derive(Debug, Default)]
pub struct DialogCache {
    entries: Option<HashMap<i64, DialogEntry>>,
}

impl DialogCache {
    fn get_or_load(&mut self, conn: &Connection) -> Result<&HashMap<i64, DialogEntry>> {
        if self.entries.is_none() {
            let mut stmt = conn.prepare("SELECT id, name, folder FROM dialogs")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        DialogEntry {
                            name: row.get(1)?,
                            folder: row.get(2)?,
                        },
                    ))
                })?
                .collect::<Result<HashMap<_, _>, _>>()?;
            self.entries = Some(rows);
        }
        Ok(self.entries.get_or_insert_with(HashMap::new))
    }

    fn record(&mut self, id: i64, entry: DialogEntry) {
        if let Some(entries) = self.entries.as_mut() {
            entries.insert(id, entry);
        }
    }
}

/// SQLite-backed archive of dialogs and messages.
///
/// Writes go into an open transaction that `flush` commits; nothing is
/// committed unless something was written since the last flush.
pub struct Store {
    conn: Connection,
    dialogs: DialogCache,
    dirty: bool,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_connection(db::init_db(path)?))
    }

    /// Open an existing archive for reading only; writes fail.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_connection(db::open_read_only(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            dialogs: DialogCache::default(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn begin(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Insert or replace a dialog and refresh the cached entry.
    pub fn upsert_dialog(&mut self, id: i64, name: &str, folder: &str) -> Result<()> {
        self.begin()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO dialogs (id, name, folder) VALUES (?1, ?2, ?3)",
            params![id, name, folder],
        )?;
        self.dialogs.get_or_load(&self.conn)?;
        self.dialogs.record(
            id,
            DialogEntry {
                name: name.into(),
                folder: folder.into(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Insert or replace a message. A message without a timestamp is logged
    /// and skipped; the return value tells whether a row was written.
    pub fn upsert_message(&mut self, dialog_id: i64, msg: &Message) -> Result<bool> {
        let Some(ts) = msg.timestamp else {
            warn!(dialog_id, "{} - skipping", ArchiveError::MissingTimestamp(msg.id));
            return Ok(false);
        };
        let datetime = timefmt::to_store(ts)?;
        let extra = serde_json::to_string(&msg.extra())?;
        self.begin()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO messages (dialog, id, datetime, text, sender, media, extra) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![dialog_id, msg.id, datetime, msg.text, msg.sender, msg.media, extra],
        )?;
        self.dirty = true;
        Ok(true)
    }

    /// All known dialogs by id.
    pub fn list_dialogs(&mut self) -> Result<&HashMap<i64, DialogEntry>> {
        self.dialogs.get_or_load(&self.conn)
    }

    /// All messages of one dialog by id.
    pub fn list_messages(&self, dialog_id: i64) -> Result<BTreeMap<i64, Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, datetime, text, sender, media, extra FROM messages WHERE dialog = ?1",
        )?;
        let mut rows = stmt.query([dialog_id])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            match read_row(row)?.into_message() {
                Ok(msg) => {
                    out.insert(msg.id, msg);
                }
                Err(err) => warn!(dialog_id, "skipping unreadable message: {err:#}"),
            }
        }
        Ok(out)
    }

    /// Look a message up by id alone, across every dialog.
    pub fn get_message(&self, id: i64) -> Result<Option<(Message, i64)>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, datetime, text, sender, media, extra, dialog FROM messages WHERE id = ?1 LIMIT 1",
                [id],
                |row| Ok((read_row(row)?, row.get::<_, i64>(6)?)),
            )
            .optional()?;
        row.map(|(raw, dialog)| Ok((raw.into_message()?, dialog)))
            .transpose()
    }

    /// Look a message up within one dialog.
    pub fn get_message_in(&self, dialog_id: i64, id: i64) -> Result<Option<Message>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, datetime, text, sender, media, extra FROM messages WHERE dialog = ?1 AND id = ?2",
                params![dialog_id, id],
                read_row,
            )
            .optional()?;
        row.map(RawMessage::into_message).transpose()
    }

    /// Relative paths already recorded for a content hash, store-wide,
    /// oldest record first.
    pub fn lookup_media_by_hash(&self, hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT media FROM messages \
             WHERE json_extract(extra, '$.hash') = ?1 AND media IS NOT NULL AND media <> '' \
             GROUP BY media ORDER BY MIN(rowid)",
        )?;
        let paths = stmt
            .query_map([hash], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Commit pending writes. Returns whether anything was committed.
    pub fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        self.dirty = false;
        debug!("store flushed");
        Ok(true)
    }

    /// Flush and close the database.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }

    /// One line per message for the most recent `limit` messages.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.datetime, m.text, m.sender, m.media, m.extra, d.name \
             FROM messages m LEFT JOIN dialogs d ON m.sender = d.id \
             ORDER BY m.datetime DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let msg = match read_row(row)?.into_message() {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("skipping unreadable message: {err:#}");
                    continue;
                }
            };
            let sender_name: Option<String> = row.get(6)?;
            out.push(render_activity(&msg, sender_name.as_deref()));
        }
        Ok(out)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!("failed to flush store on close: {err:#}");
        }
    }
}

/// Columns `id, datetime, text, sender, media, extra` as read from SQLite.
struct RawMessage {
    id: i64,
    datetime: Option<String>,
    text: Option<String>,
    sender: Option<i64>,
    media: Option<String>,
    extra: Option<String>,
}

impl RawMessage {
    fn into_message(self) -> Result<Message> {
        Message::from_row(
            self.id,
            self.datetime,
            self.text,
            self.sender,
            self.media,
            self.extra,
        )
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        datetime: row.get(1)?,
        text: row.get(2)?,
        sender: row.get(3)?,
        media: row.get(4)?,
        extra: row.get(5)?,
    })
}

fn render_activity(msg: &Message, sender_name: Option<&str>) -> String {
    let when = msg
        .timestamp
        .and_then(|t| timefmt::to_store(t).ok())
        .unwrap_or_default();
    let who = match (msg.sender, sender_name) {
        (None, _) => "me".to_string(),
        (Some(_), Some(name)) => name.to_string(),
        (Some(id), None) => id.to_string(),
    };
    let body = msg
        .text
        .as_deref()
        .or(msg.media.as_deref())
        .unwrap_or_default();
    let mut line = format!("{when} - {who} - {body}");
    for (set, tag) in [
        (msg.silent, "[silent]"),
        (msg.scheduled, "[scheduled]"),
        (msg.edit_date.is_some(), "[edited]"),
        (msg.deleted, "[deleted]"),
    ] {
        if set {
            line.push(' ');
            line.push_str(tag);
        }
    }
    line
}
