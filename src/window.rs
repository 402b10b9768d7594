// Maintenance window: a daily wall-clock range in which automatic updates may apply.
// Windows with start > end wrap past midnight (e.g. 22:00-02:00).

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Zone the window's wall-clock times are interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WindowZone {
    Utc,
    /// Host local time.
    Local,
    Fixed(FixedOffset),
}

impl FromStr for WindowZone {
    type Err = String;

    /// Accepts "UTC", "local" or a fixed offset such as "+02:00" / "-0530".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") {
            return Ok(WindowZone::Utc);
        }
        if s.eq_ignore_ascii_case("local") {
            return Ok(WindowZone::Local);
        }
        s.parse::<FixedOffset>()
            .map(WindowZone::Fixed)
            .map_err(|_| format!("invalid timezone {:?} (expected UTC, local or +HH:MM)", s))
    }
}

impl TryFrom<String> for WindowZone {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<WindowZone> for String {
    fn from(z: WindowZone) -> Self {
        z.to_string()
    }
}

impl fmt::Display for WindowZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowZone::Utc => f.write_str("UTC"),
            WindowZone::Local => f.write_str("local"),
            WindowZone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    #[serde(default = "default_zone")]
    pub timezone: WindowZone,
}

fn default_zone() -> WindowZone {
    WindowZone::Utc
}

/// True when `now` falls inside `window`; both boundaries are inside.
pub fn in_window(now: NaiveTime, window: &UpdateWindow) -> bool {
    if window.start <= window.end {
        window.start <= now && now <= window.end
    } else {
        now >= window.start || now <= window.end
    }
}

impl UpdateWindow {
    pub fn new(start: NaiveTime, end: NaiveTime, timezone: WindowZone) -> Self {
        Self {
            start,
            end,
            timezone,
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Wall-clock time of `at` in the window's zone.
    pub fn time_of_day(&self, at: DateTime<Utc>) -> NaiveTime {
        self.local_datetime(at).time()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        in_window(self.time_of_day(at), self)
    }

    /// Next instant strictly after `at` at which the window opens.
    pub fn next_start_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.local_datetime(at);
        let mut candidate = local.date().and_time(self.start);
        if candidate <= local {
            candidate += Duration::days(1);
        }
        // A start that falls into a DST gap has no instant; try the following day.
        for _ in 0..2 {
            if let Some(instant) = self.to_utc(candidate) {
                return instant;
            }
            candidate += Duration::days(1);
        }
        at + Duration::days(1)
    }

    fn local_datetime(&self, at: DateTime<Utc>) -> NaiveDateTime {
        match self.timezone {
            WindowZone::Utc => at.naive_utc(),
            WindowZone::Local => at.with_timezone(&Local).naive_local(),
            WindowZone::Fixed(offset) => at.with_timezone(&offset).naive_local(),
        }
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.timezone {
            WindowZone::Utc => Some(Utc.from_utc_datetime(&local)),
            WindowZone::Local => Local
                .from_local_datetime(&local)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            WindowZone::Fixed(offset) => offset
                .from_local_datetime(&local)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// "HH:MM" (or "HH:MM:SS") serde format for wall-clock times.
pub(crate) mod hhmm {
    use chrono::{NaiveTime, Timelike};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
            .map_err(|_| format!("invalid time of day {:?} (expected HH:MM)", s))
    }

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        let fmt = if t.second() == 0 { "%H:%M" } else { "%H:%M:%S" };
        s.serialize_str(&t.format(fmt).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
