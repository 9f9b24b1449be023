use thiserror::Error;

/// Failures the archiver distinguishes. Everything except
/// `MissingCredentials` is handled per item and never stops a scan or the
/// listen loop.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("message {0} has no timestamp")]
    MissingTimestamp(i64),
    #[error("unsupported media on message {0}")]
    UnsupportedMedia(i64),
    #[error("unknown message {message_id}")]
    LookupMiss { message_id: i64 },
    #[error("bridge disconnected")]
    Disconnected,
    #[error("missing credentials: set CHAT_ARCHIVE_API_ID and CHAT_ARCHIVE_API_HASH")]
    MissingCredentials,
    #[error("bridge error {code}: {message}")]
    Bridge { code: i32, message: String },
}
