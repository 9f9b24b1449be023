//! Timestamp encoding for the store.
//!
//! New rows are written as `YYYY-MM-DD HH:MM:SS+0000`. Older archives hold a
//! mix of RFC 3339 strings, offset-less strings and raw Unix seconds, so
//! parsing walks through those in order.

use anyhow::{anyhow, Result};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Drop sub-second precision and move to UTC, matching what the store keeps.
pub fn normalize(dt: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(dt.unix_timestamp()).unwrap_or(dt)
}

/// Format a timestamp the way the store persists it.
pub fn to_store(dt: OffsetDateTime) -> Result<String> {
    let fmt = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
    );
    Ok(dt.to_offset(UtcOffset::UTC).format(fmt)?)
}

/// Parse a stored timestamp, current format first.
pub fn from_store(raw: &str) -> Result<OffsetDateTime> {
    let raw = raw.trim();
    let current = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
    );
    if let Ok(dt) = OffsetDateTime::parse(raw, current) {
        return Ok(dt);
    }
    let colon_offset = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
    );
    if let Ok(dt) = OffsetDateTime::parse(raw, colon_offset) {
        return Ok(dt);
    }
    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(dt);
    }
    let naive_fraction =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    if let Ok(dt) = PrimitiveDateTime::parse(raw, naive_fraction) {
        return Ok(dt.assume_utc());
    }
    let naive = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(dt) = PrimitiveDateTime::parse(raw, naive) {
        return Ok(dt.assume_utc());
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return Ok(OffsetDateTime::from_unix_timestamp(secs as i64)?);
    }
    Err(anyhow!("unrecognised timestamp {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn writes_utc_with_explicit_offset() {
        let dt = datetime!(2021-03-04 05:06:07 +02:00);
        assert_eq!(to_store(dt).unwrap(), "2021-03-04 03:06:07+0000");
    }

    #[test]
    fn reads_current_and_legacy_formats() {
        let want = datetime!(2021-03-04 03:06:07 UTC);
        for raw in [
            "2021-03-04 03:06:07+0000",
            "2021-03-04 05:06:07+0200",
            "2021-03-04 03:06:07+00:00",
            "2021-03-04T03:06:07Z",
            "2021-03-04 03:06:07",
            "2021-03-04 03:06:07.000000",
            "1614827167",
            "1614827167.0",
        ] {
            assert_eq!(from_store(raw).unwrap(), want, "{raw}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_store("yesterday").is_err());
    }

    #[test]
    fn normalize_drops_subseconds() {
        let dt = datetime!(2021-03-04 05:06:07.25 +01:00);
        let n = normalize(dt);
        assert_eq!(n, datetime!(2021-03-04 04:06:07 UTC));
        assert_eq!(n.offset(), UtcOffset::UTC);
    }
}
