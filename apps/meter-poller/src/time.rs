use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Maps a wall-clock time to an instant in `tz`.
///
/// Ambiguous times resolve to the earlier instance; times inside a DST gap
/// resolve to the next valid local time.
pub(crate) fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
) -> Result<DateTime<Tz>, String> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Ok(dt),
        chrono::LocalResult::Ambiguous(a, b) => Ok(earlier(a, b)),
        chrono::LocalResult::None => find_next_valid_local(tz, naive, SEARCH_MINUTES)
            .ok_or_else(|| format!("no valid local datetime found after {naive}")),
    }
}

const SEARCH_MINUTES: i64 = 180;

pub(crate) fn start_of_day<Tz: TimeZone>(now: &DateTime<Tz>) -> Result<DateTime<Tz>, String> {
    midnight(&now.timezone(), now.date_naive())
}

pub(crate) fn start_of_month<Tz: TimeZone>(now: &DateTime<Tz>) -> Result<DateTime<Tz>, String> {
    let first = now
        .date_naive()
        .with_day(1)
        .ok_or_else(|| format!("no first day of month for {}", now.date_naive()))?;
    midnight(&now.timezone(), first)
}

fn midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Result<DateTime<Tz>, String> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("no midnight for {date}"))?;
    resolve_local(tz, naive)
}

/// Parses an API timestamp. Naive values are taken as wall-clock time in `tz`.
pub(crate) fn parse_timestamp<Tz: TimeZone>(tz: &Tz, raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return resolve_local(tz, naive)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}

fn earlier<Tz: TimeZone>(a: DateTime<Tz>, b: DateTime<Tz>) -> DateTime<Tz> {
    if a.with_timezone(&Utc) <= b.with_timezone(&Utc) {
        a
    } else {
        b
    }
}

fn find_next_valid_local<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
    max_minutes: i64,
) -> Option<DateTime<Tz>> {
    for minutes in 0..=max_minutes {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Some(dt),
            chrono::LocalResult::Ambiguous(a, b) => return Some(earlier(a, b)),
            chrono::LocalResult::None => continue,
        }
    }
    None
}
