use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Open (or create) the archive database and make sure the schema exists.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let path = path.as_ref();
    let conn =
        Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open an existing archive database without write access. Fails when the
/// file does not exist; nothing is created.
pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let path = path.as_ref();
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("opening {} read-only", path.display()))
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dialogs (
  id INTEGER NOT NULL PRIMARY KEY,
  name TEXT NOT NULL,
  folder TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  dialog INTEGER NOT NULL,
  id INTEGER NOT NULL,
  datetime TEXT NOT NULL,
  text TEXT,
  sender INTEGER,
  media TEXT,
  extra TEXT,
  PRIMARY KEY (dialog, id)
);

CREATE INDEX IF NOT EXISTS messages_id ON messages(id);
CREATE INDEX IF NOT EXISTS messages_hash ON messages(json_extract(extra, '$.hash'));
"#;
