use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{NaiveDate, NaiveTime};

use crate::model::{Ms, TimeInterval};

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;
pub const MINUTES_PER_DAY: u16 = 1440;

/// The single time source consulted by the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        now_ms()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeFormatError {
    #[error("expected HH:MM in 24-hour form, got {0:?}")]
    BadClock(String),
    #[error("end {end} must be after start {start}")]
    EmptyRange { start: String, end: String },
    #[error("expected YYYY-MM-DD, got {0:?}")]
    BadDate(String),
}

/// Parse `H:MM` / `HH:MM` into minutes since midnight.
pub fn parse_clock(s: &str) -> Result<u16, TimeFormatError> {
    let bad = || TimeFormatError::BadClock(s.to_string());
    let (h, m) = s.split_once(':').ok_or_else(bad)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(bad());
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let hour: u16 = h.parse().map_err(|_| bad())?;
    let minute: u16 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok(hour * 60 + minute)
}

pub fn format_clock(minute_of_day: u16) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, TimeFormatError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| TimeFormatError::BadDate(s.to_string()))
}

/// Build an interval from a date and two clock strings.
pub fn to_interval(date: NaiveDate, start: &str, end: &str) -> Result<TimeInterval, TimeFormatError> {
    let start_min = parse_clock(start)?;
    let end_min = parse_clock(end)?;
    if end_min <= start_min {
        return Err(TimeFormatError::EmptyRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(TimeInterval {
        date,
        start: start_min,
        end: end_min,
    })
}

/// Absolute instant of `minute_of_day` on `date`, for a site at `utc_offset_minutes`.
pub fn instant_of(date: NaiveDate, minute_of_day: u16, utc_offset_minutes: i32) -> Ms {
    let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    midnight + (minute_of_day as Ms - utc_offset_minutes as Ms) * MINUTE_MS
}
