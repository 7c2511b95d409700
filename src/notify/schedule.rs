use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::errors::SentinelError;

/// One "HH:MM" delivery slot, stored as minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u16);

impl Slot {
    pub fn new(hour: u8, minute: u8) -> Result<Self, SentinelError> {
        if hour >= 24 || minute >= 60 {
            return Err(SentinelError::Schedule(format!(
                "slot {hour:02}:{minute:02} out of range"
            )));
        }
        Ok(Self(hour as u16 * 60 + minute as u16))
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    fn time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour() as u32, self.minute() as u32, 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for Slot {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| SentinelError::Schedule(format!("invalid slot {s:?}, want HH:MM")))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| SentinelError::Schedule(format!("invalid hour in slot {s:?}")))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| SentinelError::Schedule(format!("invalid minute in slot {s:?}")))?;
        Slot::new(hour, minute)
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Slot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Sort and deduplicate a slot list. An empty result is the caller's
/// signal to fall back to the process-wide schedule.
pub fn normalize(mut slots: Vec<Slot>) -> Vec<Slot> {
    slots.sort_unstable();
    slots.dedup();
    slots
}

/// Parse a comma-separated "HH:MM,HH:MM" schedule (config/env form).
pub fn parse_schedule_csv(text: &str) -> Result<Vec<Slot>, SentinelError> {
    let slots = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Slot::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    if slots.is_empty() {
        return Err(SentinelError::Schedule(format!(
            "schedule {text:?} contains no slots"
        )));
    }
    Ok(normalize(slots))
}

/// A recipient time-zone: either an IANA zone or a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TzSpec {
    Named(Tz),
    Fixed(FixedOffset),
}

impl TzSpec {
    pub const UTC: TzSpec = TzSpec::Named(Tz::UTC);

    fn to_local(self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            TzSpec::Named(tz) => instant.with_timezone(&tz).naive_local(),
            TzSpec::Fixed(off) => instant.with_timezone(&off).naive_local(),
        }
    }

    /// Resolve a local wall-clock time back to UTC. DST gaps yield `None`
    /// (the slot is skipped for that day); ambiguous times take the
    /// earlier mapping.
    fn from_local(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            TzSpec::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            TzSpec::Fixed(off) => off
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

fn parse_offset(text: &str) -> Option<FixedOffset> {
    let (sign, body) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = match body.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (body.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl FromStr for TzSpec {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(SentinelError::Schedule("empty timezone".into()));
        }
        if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
            return Ok(TzSpec::UTC);
        }
        let offset_part = text
            .strip_prefix("UTC")
            .or_else(|| text.strip_prefix("utc"))
            .or_else(|| text.strip_prefix("GMT"))
            .unwrap_or(text);
        if offset_part.starts_with('+') || offset_part.starts_with('-') {
            return parse_offset(offset_part)
                .map(TzSpec::Fixed)
                .ok_or_else(|| SentinelError::Schedule(format!("invalid UTC offset {text:?}")));
        }
        Tz::from_str(text)
            .map(TzSpec::Named)
            .map_err(|_| SentinelError::Schedule(format!("unknown timezone {text:?}")))
    }
}

impl fmt::Display for TzSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TzSpec::Named(tz) => write!(f, "{}", tz.name()),
            TzSpec::Fixed(off) => {
                let secs = off.local_minus_utc();
                let (sign, secs) = if secs < 0 { ('-', -secs) } else { ('+', secs) };
                write!(f, "{}{:02}:{:02}", sign, secs / 3600, (secs % 3600) / 60)
            }
        }
    }
}

impl Serialize for TzSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TzSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// The minimum schedule slot strictly after `now`, in the given zone.
/// Falls over to the first slot of the next day once today's slots have
/// passed. `slots` must be normalized; an empty list pushes a day out.
pub fn next_slot_after(now: DateTime<Utc>, tz: TzSpec, slots: &[Slot]) -> DateTime<Utc> {
    let today = tz.to_local(now).date();
    for day_offset in 0..=2u64 {
        let Some(date) = today.checked_add_days(Days::new(day_offset)) else {
            continue;
        };
        for slot in slots {
            if let Some(instant) = tz.from_local(date.and_time(slot.time())) {
                if instant > now {
                    return instant;
                }
            }
        }
    }
    now + chrono::Duration::days(1)
}

/// The latest schedule slot at or before `now`: the window the worker was
/// last expected to drain. Used by restart recovery.
pub fn prev_slot_at_or_before(now: DateTime<Utc>, tz: TzSpec, slots: &[Slot]) -> DateTime<Utc> {
    let today = tz.to_local(now).date();
    for day_offset in 0..=2u64 {
        let Some(date) = today.checked_sub_days(Days::new(day_offset)) else {
            continue;
        };
        for slot in slots.iter().rev() {
            if let Some(instant) = tz.from_local(date.and_time(slot.time())) {
                if instant <= now {
                    return instant;
                }
            }
        }
    }
    now - chrono::Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn slots(items: &[&str]) -> Vec<Slot> {
        normalize(items.iter().map(|s| s.parse().unwrap()).collect())
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn slot_parses_and_rejects() {
        assert_eq!("09:05".parse::<Slot>().unwrap().to_string(), "09:05");
        assert!("24:00".parse::<Slot>().is_err());
        assert!("09:60".parse::<Slot>().is_err());
        assert!("nine".parse::<Slot>().is_err());
    }

    #[test]
    fn schedule_normalises_sorted_and_deduplicated() {
        let parsed = parse_schedule_csv("17:30, 09:00,09:00").unwrap();
        assert_eq!(
            parsed.iter().map(Slot::to_string).collect::<Vec<_>>(),
            vec!["09:00", "17:30"]
        );
        assert!(parse_schedule_csv("  , ").is_err());
    }

    #[test]
    fn tz_parses_offsets_and_names() {
        assert_eq!("Z".parse::<TzSpec>().unwrap(), TzSpec::UTC);
        assert_eq!(
            "+03:00".parse::<TzSpec>().unwrap(),
            TzSpec::Fixed(FixedOffset::east_opt(3 * 3600).unwrap())
        );
        assert_eq!(
            "UTC+3".parse::<TzSpec>().unwrap(),
            TzSpec::Fixed(FixedOffset::east_opt(3 * 3600).unwrap())
        );
        assert_eq!(
            "-05:30".parse::<TzSpec>().unwrap(),
            TzSpec::Fixed(FixedOffset::east_opt(-(5 * 3600 + 30 * 60)).unwrap())
        );
        assert!(matches!(
            "Europe/Berlin".parse::<TzSpec>().unwrap(),
            TzSpec::Named(_)
        ));
        assert!("Neverland/Nowhere".parse::<TzSpec>().is_err());
        assert!("+15:00".parse::<TzSpec>().is_err());
    }

    #[test]
    fn next_slot_picks_later_slot_today() {
        let schedule = slots(&["09:00", "17:00"]);
        let now = utc(2024, 5, 10, 10, 15);
        let next = next_slot_after(now, TzSpec::UTC, &schedule);
        assert_eq!(next, utc(2024, 5, 10, 17, 0));
    }

    #[test]
    fn next_slot_rolls_to_tomorrow() {
        let schedule = slots(&["09:00", "17:00"]);
        let now = utc(2024, 5, 10, 18, 0);
        let next = next_slot_after(now, TzSpec::UTC, &schedule);
        assert_eq!(next, utc(2024, 5, 11, 9, 0));
    }

    #[test]
    fn next_slot_is_strictly_after_now() {
        let schedule = slots(&["09:00"]);
        let now = utc(2024, 5, 10, 9, 0);
        let next = next_slot_after(now, TzSpec::UTC, &schedule);
        assert_eq!(next, utc(2024, 5, 11, 9, 0));
    }

    #[test]
    fn next_slot_respects_fixed_offset() {
        // 10:15 at +03:00 is 07:15 UTC; the 17:00 local slot is 14:00 UTC.
        let schedule = slots(&["09:00", "17:00"]);
        let tz = TzSpec::Fixed(FixedOffset::east_opt(3 * 3600).unwrap());
        let now = utc(2024, 5, 10, 7, 15);
        assert_eq!(next_slot_after(now, tz, &schedule), utc(2024, 5, 10, 14, 0));
    }

    #[test]
    fn prev_slot_finds_latest_passed_window() {
        let schedule = slots(&["09:00", "17:00"]);
        let now = utc(2024, 5, 10, 10, 15);
        assert_eq!(
            prev_slot_at_or_before(now, TzSpec::UTC, &schedule),
            utc(2024, 5, 10, 9, 0)
        );
        let early = utc(2024, 5, 10, 3, 0);
        assert_eq!(
            prev_slot_at_or_before(early, TzSpec::UTC, &schedule),
            utc(2024, 5, 9, 17, 0)
        );
    }
}
