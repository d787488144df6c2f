use std::io::Write;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Write a timestamped line to stderr.
///
/// Used where no log sink can be relied on: before the logger exists, and while
/// the sinks are being torn down. Write failures are ignored.
pub fn fallback_log(msg: impl AsRef<str>) {
    let line = format_line(OffsetDateTime::now_utc(), msg.as_ref());
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(line.as_bytes()).is_err() {
        return;
    }
    drop(stderr.flush());
}

fn format_line(at: OffsetDateTime, msg: &str) -> String {
    let ts = at
        .format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{ts} {msg}\n")
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn lines_are_prefixed_with_rfc3339_time() {
        let line = format_line(datetime!(2024-03-01 12:30:00 UTC), "Shutting down tracer...");
        assert_eq!(line, "2024-03-01T12:30:00Z Shutting down tracer...\n");
    }
}
