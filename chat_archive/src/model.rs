use crate::timefmt;
use anyhow::Result;
use bridge_api::SourceMessage;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Auxiliary attributes kept next to the fixed message columns.
pub type AuxMap = BTreeMap<String, Value>;

pub const AUX_HASH: &str = "hash";
pub const AUX_SIZE: &str = "size";
pub const AUX_TTL: &str = "self_destructing";
pub const AUX_PREV: &str = "prev";

const EXTRA_SILENT: &str = "silent";
const EXTRA_SCHEDULED: &str = "from_scheduled";
const EXTRA_EDIT_DATE: &str = "edit_date";
const EXTRA_READ_TIME: &str = "read_time";
const EXTRA_DELETED: &str = "deleted";

/// Name and folder of an archived dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogEntry {
    pub name: String,
    pub folder: String,
}

/// A stored media file, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaObject {
    pub hash: String,
    pub size: u64,
    /// Path relative to the archive root.
    pub path: String,
}

/// One archived message. Unset, empty and false attributes count as
/// "not observed"; see `attributes`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id: i64,
    pub timestamp: Option<OffsetDateTime>,
    pub text: Option<String>,
    /// `None` when the archiving account wrote the message.
    pub sender: Option<i64>,
    pub media: Option<String>,
    pub silent: bool,
    pub scheduled: bool,
    pub edit_date: Option<OffsetDateTime>,
    pub read_time: Option<OffsetDateTime>,
    pub deleted: bool,
    pub aux: AuxMap,
}

/// Null, false, zero and empty values count as absent.
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl Message {
    /// Build an observation from what the source reported. Media is resolved
    /// separately by the materializer.
    pub fn from_source(src: &SourceMessage) -> Self {
        Self {
            id: src.id,
            timestamp: src.date.map(timefmt::normalize),
            text: src.text.clone().filter(|t| !t.is_empty()),
            sender: if src.out { None } else { src.sender_id },
            media: None,
            silent: src.silent,
            scheduled: src.from_scheduled,
            edit_date: src.edit_date.map(timefmt::normalize),
            read_time: None,
            deleted: false,
            aux: AuxMap::new(),
        }
    }

    pub fn hash(&self) -> Option<&str> {
        self.aux.get(AUX_HASH).and_then(Value::as_str)
    }

    pub fn size(&self) -> Option<u64> {
        self.aux.get(AUX_SIZE).and_then(Value::as_u64)
    }

    pub fn edit_history(&self) -> Vec<String> {
        match self.aux.get(AUX_PREV) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Append a superseded text to the edit history.
    pub fn push_edit(&mut self, previous: Option<&str>) {
        let entry = previous.map(Value::from).unwrap_or(Value::Null);
        match self.aux.get_mut(AUX_PREV) {
            Some(Value::Array(items)) => items.push(entry),
            _ => {
                self.aux.insert(AUX_PREV.into(), Value::Array(vec![entry]));
            }
        }
    }

    pub fn set_media(&mut self, media: &MediaObject) {
        self.media = Some(media.path.clone());
        self.aux.insert(AUX_HASH.into(), Value::from(media.hash.clone()));
        self.aux.insert(AUX_SIZE.into(), Value::from(media.size));
    }

    /// Fill every attribute this observation lacks from `prior`.
    pub fn carry_forward(&mut self, prior: &Message) {
        fn fill<T: Clone>(slot: &mut Option<T>, prior: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(prior);
            }
        }
        fill(&mut self.timestamp, &prior.timestamp);
        fill(&mut self.text, &prior.text);
        fill(&mut self.sender, &prior.sender);
        fill(&mut self.media, &prior.media);
        fill(&mut self.edit_date, &prior.edit_date);
        fill(&mut self.read_time, &prior.read_time);
        self.silent |= prior.silent;
        self.scheduled |= prior.scheduled;
        self.deleted |= prior.deleted;
        for (key, value) in &prior.aux {
            let present = self.aux.get(key).map(is_truthy).unwrap_or(false);
            if !present && is_truthy(value) {
                self.aux.insert(key.clone(), value.clone());
            }
        }
    }

    /// Every present attribute, keyed by its stored name.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        out.insert("id".to_string(), Value::from(self.id));
        if let Some(ts) = self.timestamp.and_then(|t| timefmt::to_store(t).ok()) {
            out.insert("datetime".into(), Value::from(ts));
        }
        if let Some(text) = self.text.as_ref().filter(|t| !t.is_empty()) {
            out.insert("text".into(), Value::from(text.clone()));
        }
        if let Some(sender) = self.sender.filter(|s| *s != 0) {
            out.insert("sender".into(), Value::from(sender));
        }
        if let Some(media) = self.media.as_ref().filter(|m| !m.is_empty()) {
            out.insert("media".into(), Value::from(media.clone()));
        }
        if let Value::Object(extra) = self.extra() {
            out.extend(extra);
        }
        out
    }

    /// The side-map persisted in the `extra` column.
    pub fn extra(&self) -> Value {
        let mut extra = Map::new();
        if self.silent {
            extra.insert(EXTRA_SILENT.into(), Value::Bool(true));
        }
        if self.scheduled {
            extra.insert(EXTRA_SCHEDULED.into(), Value::Bool(true));
        }
        if self.deleted {
            extra.insert(EXTRA_DELETED.into(), Value::Bool(true));
        }
        for (key, slot) in [
            (EXTRA_EDIT_DATE, self.edit_date),
            (EXTRA_READ_TIME, self.read_time),
        ] {
            if let Some(ts) = slot.and_then(|t| timefmt::to_store(t).ok()) {
                extra.insert(key.into(), Value::from(ts));
            }
        }
        for (key, value) in &self.aux {
            if is_truthy(value) {
                extra.insert(key.clone(), value.clone());
            }
        }
        Value::Object(extra)
    }

    /// Rebuild a message from its stored columns.
    pub fn from_row(
        id: i64,
        datetime: Option<String>,
        text: Option<String>,
        sender: Option<i64>,
        media: Option<String>,
        extra: Option<String>,
    ) -> Result<Self> {
        let mut msg = Message {
            id,
            timestamp: datetime.as_deref().map(timefmt::from_store).transpose()?,
            text: text.filter(|t| !t.is_empty()),
            sender: sender.filter(|s| *s != 0),
            media: media.filter(|m| !m.is_empty()),
            ..Default::default()
        };
        let extra: Map<String, Value> = match extra.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => Map::new(),
        };
        for (key, value) in extra {
            if !is_truthy(&value) {
                continue;
            }
            match key.as_str() {
                EXTRA_SILENT => msg.silent = true,
                EXTRA_SCHEDULED => msg.scheduled = true,
                EXTRA_DELETED => msg.deleted = true,
                EXTRA_EDIT_DATE => msg.edit_date = parse_extra_time(&value)?,
                EXTRA_READ_TIME => msg.read_time = parse_extra_time(&value)?,
                _ => {
                    msg.aux.insert(key, value);
                }
            }
        }
        Ok(msg)
    }
}

fn parse_extra_time(value: &Value) -> Result<Option<OffsetDateTime>> {
    match value {
        Value::String(s) => Ok(Some(timefmt::from_store(s)?)),
        Value::Number(n) => Ok(Some(timefmt::from_store(&n.to_string())?)),
        _ => Ok(None),
    }
}
