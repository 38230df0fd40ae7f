use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::clock::{MINUTES_PER_DAY, parse_clock};
use crate::limits::{MAX_ROOM_CODE_LEN, MAX_ROOMS};
use crate::model::{RoomCode, TimeInterval};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {reason} (got {value:?})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Room catalog and operating hours. Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Empty means any well-formed room code is accepted.
    pub rooms: BTreeSet<RoomCode>,
    pub open: u16,
    /// Exclusive; may be 1440 for "until midnight".
    pub close: u16,
    pub utc_offset_minutes: i32,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            rooms: BTreeSet::new(),
            open: 0,
            close: MINUTES_PER_DAY,
            utc_offset_minutes: 0,
        }
    }
}

impl SchedulePolicy {
    pub fn with_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rooms: rooms.into_iter().map(|r| RoomCode::new(r)).collect(),
            ..Self::default()
        }
    }

    pub fn knows_room(&self, room: &RoomCode) -> bool {
        self.rooms.is_empty() || self.rooms.contains(room)
    }

    pub fn within_hours(&self, interval: &TimeInterval) -> bool {
        interval.start >= self.open && interval.end <= self.close
    }
}

/// Process configuration, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub secret: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval_secs: u64,
    pub metrics_port: Option<u16>,
    pub policy: SchedulePolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reads through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = parse_or(&lookup, "ROOMBOOK_PORT", 5480)?;
        let bind = lookup("ROOMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let data_dir = PathBuf::from(lookup("ROOMBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let secret = lookup("ROOMBOOK_SECRET").unwrap_or_else(|| "roombook".into());
        let max_connections: usize = parse_or(&lookup, "ROOMBOOK_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(invalid("ROOMBOOK_MAX_CONNECTIONS", "0", "must be at least 1"));
        }
        let compact_threshold = parse_or(&lookup, "ROOMBOOK_COMPACT_THRESHOLD", 1000)?;
        let sweep_interval_secs: u64 = parse_or(&lookup, "ROOMBOOK_SWEEP_INTERVAL_SECS", 30)?;
        if sweep_interval_secs == 0 {
            return Err(invalid("ROOMBOOK_SWEEP_INTERVAL_SECS", "0", "must be at least 1"));
        }
        let metrics_port = match lookup("ROOMBOOK_METRICS_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|e| invalid("ROOMBOOK_METRICS_PORT", &raw, e.to_string()))?,
            ),
            None => None,
        };

        let rooms = parse_rooms(lookup("ROOMBOOK_ROOMS").as_deref().unwrap_or(""))?;
        let open = match lookup("ROOMBOOK_OPEN") {
            Some(raw) => parse_hour_bound("ROOMBOOK_OPEN", &raw)?,
            None => 0,
        };
        let close = match lookup("ROOMBOOK_CLOSE") {
            Some(raw) => parse_hour_bound("ROOMBOOK_CLOSE", &raw)?,
            None => MINUTES_PER_DAY,
        };
        if open >= close {
            return Err(invalid("ROOMBOOK_CLOSE", &format!("{close}"), "must be after ROOMBOOK_OPEN"));
        }
        let utc_offset_minutes: i32 = parse_or(&lookup, "ROOMBOOK_UTC_OFFSET_MINUTES", 0)?;
        if utc_offset_minutes.abs() > 18 * 60 {
            return Err(invalid(
                "ROOMBOOK_UTC_OFFSET_MINUTES",
                &utc_offset_minutes.to_string(),
                "must be within +-18 hours",
            ));
        }

        Ok(Self {
            port,
            bind,
            data_dir,
            secret,
            max_connections,
            compact_threshold,
            sweep_interval_secs,
            metrics_port,
            policy: SchedulePolicy {
                rooms,
                open,
                close,
                utc_offset_minutes,
            },
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// `HH:MM`, or `24:00` for end of day.
fn parse_hour_bound(var: &'static str, raw: &str) -> Result<u16, ConfigError> {
    if raw.trim() == "24:00" {
        return Ok(MINUTES_PER_DAY);
    }
    parse_clock(raw.trim()).map_err(|e| invalid(var, raw, e.to_string()))
}

fn parse_rooms(raw: &str) -> Result<BTreeSet<RoomCode>, ConfigError> {
    let mut rooms = BTreeSet::new();
    for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if code.len() > MAX_ROOM_CODE_LEN {
            return Err(invalid("ROOMBOOK_ROOMS", code, "room code too long"));
        }
        rooms.insert(RoomCode::new(code));
    }
    if rooms.len() > MAX_ROOMS {
        return Err(invalid("ROOMBOOK_ROOMS", raw, "too many rooms"));
    }
    Ok(rooms)
}
