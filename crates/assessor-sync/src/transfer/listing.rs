//! Directory listing parser
//!
//! FTP `LIST` output is not standardised. County servers answer either in
//! Unix `ls -l` style:
//!
//! ```text
//! drwxr-xr-x   2 ftp ftp      4096 Jan 15 12:00 archive
//! -rw-r--r--   1 ftp ftp    123456 Jan 15  2024 parcel_2024.csv
//! ```
//!
//! or in the IIS/DOS style:
//!
//! ```text
//! 01-15-24  12:00PM       <DIR>          archive
//! 01-15-24  09:30AM              123456 parcel_2024.csv
//! ```

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use super::{RemoteFile, RemoteKind};

/// Parse one `LIST` line into a [`RemoteFile`] located in `parent`
///
/// `now` anchors Unix entries that omit the year. Returns `None` for lines
/// that are neither format (totals, blanks, banners) and for `.`/`..`.
pub fn parse_list_line(line: &str, parent: &str, now: DateTime<Utc>) -> Option<RemoteFile> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let (name, kind, size, modified) = parse_unix(line, now).or_else(|| parse_dos(line))?;
    if name == "." || name == ".." {
        return None;
    }

    Some(RemoteFile {
        path: join_remote(parent, &name),
        name,
        size,
        modified,
        kind,
    })
}

/// Join a remote directory and an entry name with exactly one separator
pub fn join_remote(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{}/{}", parent, name.trim_start_matches('/'))
}

type Parsed = (String, RemoteKind, u64, Option<DateTime<Utc>>);

fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<Parsed> {
    let mut fields = line.split_whitespace();
    let perms = fields.next()?;
    let kind = match perms.chars().next()? {
        'd' => RemoteKind::Directory,
        '-' | 'l' => RemoteKind::File,
        _ => return None,
    };
    if perms.len() < 10 {
        return None;
    }

    let _links = fields.next()?;
    let _owner = fields.next()?;
    let _group = fields.next()?;
    let size: u64 = fields.next()?.parse().ok()?;
    let month = fields.next()?;
    let day = fields.next()?;
    let time_or_year = fields.next()?;

    // Name is whatever follows the date column, spaces included.
    let name = rest_after_fields(line, 8)?;
    let name = match kind {
        RemoteKind::File if perms.starts_with('l') => {
            name.split(" -> ").next().unwrap_or(name).to_string()
        },
        _ => name.to_string(),
    };

    let modified = unix_timestamp(month, day, time_or_year, now);
    Some((name, kind, size, modified))
}

fn unix_timestamp(month: &str, day: &str, time_or_year: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;

        let in_year = |year: i32| NaiveDate::parse_from_str(&format!("{} {} {}", month, day, year), "%b %d %Y").ok();
        // Entries without a year are within the last six months; a date
        // ahead of "now", or Feb 29 outside a leap year, belongs to the
        // previous year.
        let date = match in_year(now.year()) {
            Some(date) if Utc.from_utc_datetime(&date.and_time(time)) <= now + chrono::Duration::days(1) => date,
            _ => in_year(now.year() - 1)?,
        };
        Some(Utc.from_utc_datetime(&date.and_time(time)))
    } else {
        let date = NaiveDate::parse_from_str(&format!("{} {} {}", month, day, time_or_year), "%b %d %Y").ok()?;
        Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
    }
}

fn parse_dos(line: &str) -> Option<Parsed> {
    let mut fields = line.split_whitespace();
    let date = fields.next()?;
    let time = fields.next()?;
    let size_or_dir = fields.next()?;

    let stamp = NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%m-%d-%y %I:%M%p")
        .or_else(|_| NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%m-%d-%Y %I:%M%p"))
        .ok()?;

    let (kind, size) = if size_or_dir.eq_ignore_ascii_case("<DIR>") {
        (RemoteKind::Directory, 0)
    } else {
        (RemoteKind::File, size_or_dir.parse().ok()?)
    };

    let name = rest_after_fields(line, 3)?.to_string();
    Some((name, kind, size, Some(Utc.from_utc_datetime(&stamp))))
}

/// Remainder of `line` after skipping `count` whitespace-separated fields
fn rest_after_fields(line: &str, count: usize) -> Option<&str> {
    let mut rest = line.trim_start();
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
