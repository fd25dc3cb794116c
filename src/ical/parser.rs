//! A module to parse iCal feeds

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::parser::ical::component::IcalEvent;
use ical::property::Property;

use crate::occurrence::FeedEvent;
use crate::traits::{BoxError, FeedParser};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;


/// Parses iCalendar feeds (RFC 5545). Every `VEVENT` of every `VCALENDAR` becomes a [`FeedEvent`]
#[derive(Clone, Copy, Debug, Default)]
pub struct IcalFeedParser;

impl IcalFeedParser {
    pub fn new() -> Self {
        Self
    }
}

impl FeedParser for IcalFeedParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<FeedEvent>, BoxError> {
        parse(bytes)
    }
}


/// Parse a whole feed. Any malformed calendar or date makes the whole feed fail
pub fn parse(bytes: &[u8]) -> Result<Vec<FeedEvent>, BoxError> {
    let content = std::str::from_utf8(bytes)
        .map_err(|err| format!("Feed is not valid UTF-8: {}", err))?;

    let mut events = Vec::new();
    let mut n_calendars = 0;
    for calendar in ical::IcalParser::new(content.as_bytes()) {
        let calendar = calendar.map_err(|err| format!("Unable to parse iCal data: {}", err))?;
        n_calendars += 1;

        for vevent in &calendar.events {
            if let Some(event) = parse_event(vevent)? {
                events.push(event);
            }
        }
    }

    if n_calendars == 0 {
        return Err("Feed contains no calendar".into());
    }
    Ok(events)
}

fn parse_event(vevent: &IcalEvent) -> Result<Option<FeedEvent>, BoxError> {
    let uid = match text(vevent, "UID").filter(|uid| uid.trim().is_empty() == false) {
        Some(uid) => uid,
        None => {
            log::warn!("Skipping an event that has no UID");
            return Ok(None);
        },
    };

    let start = property(vevent, "DTSTART").map(parse_when).transpose()?;
    let end = property(vevent, "DTEND").map(parse_when).transpose()?;
    let duration = match property(vevent, "DURATION").and_then(|prop| prop.value.as_deref()) {
        None => None,
        Some(value) => Some(parse_duration(value).ok_or_else(|| format!("Invalid DURATION {:?} for event {}", value, uid))?),
    };

    let all_day = matches!(start, Some(When::Date(_)));
    let start_millis = start.map(|when| when.millis());
    let end_millis = match (end, start_millis) {
        (Some(end), _) => Some(end.millis()),
        (None, Some(start)) => match duration {
            Some(duration) => Some(start.saturating_add(duration)),
            None if all_day => Some(start.saturating_add(DAY_MILLIS)),
            None => None,
        },
        (None, None) => None,
    };

    let mut exception_dates = Vec::new();
    for prop in vevent.properties.iter().filter(|prop| prop.name.eq_ignore_ascii_case("EXDATE")) {
        exception_dates.extend(parse_exdate(prop)?);
    }

    Ok(Some(FeedEvent {
        summary: text(vevent, "SUMMARY"),
        description: text(vevent, "DESCRIPTION"),
        location: text(vevent, "LOCATION"),
        start_millis,
        end_millis,
        all_day,
        recurrence_rule: property(vevent, "RRULE").and_then(|prop| prop.value.clone()).filter(|rule| rule.trim().is_empty() == false),
        exception_dates,
        uid,
    }))
}


/// A date (all-day) or an instant
#[derive(Clone, Copy, Debug, PartialEq)]
enum When {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
}

impl When {
    /// Dates start at UTC midnight
    fn millis(&self) -> i64 {
        match self {
            When::Date(date) => Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)).timestamp_millis(),
            When::Instant(instant) => instant.timestamp_millis(),
        }
    }
}

fn parse_when(prop: &Property) -> Result<When, BoxError> {
    let value = prop.value.as_deref().unwrap_or_default();
    parse_when_value(value, param(prop, "TZID"), is_date(prop))
}

fn parse_when_value(value: &str, tzid: Option<&str>, is_date: bool) -> Result<When, BoxError> {
    let value = value.trim();
    if is_date || value.contains('T') == false {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|err| format!("Invalid date {:?}: {}", value, err))?;
        return Ok(When::Date(date));
    }

    if let Some(utc) = value.strip_suffix('Z') {
        let naive = parse_naive(utc)?;
        return Ok(When::Instant(Utc.from_utc_datetime(&naive)));
    }

    let naive = parse_naive(value)?;
    let instant = match tzid.map(resolve_timezone) {
        // Floating times are read as UTC
        None | Some(None) => Utc.from_utc_datetime(&naive),
        Some(Some(tz)) => match tz.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            // This local time is skipped by a DST change
            None => Utc.from_utc_datetime(&naive),
        },
    };
    Ok(When::Instant(instant))
}

fn parse_naive(value: &str) -> Result<NaiveDateTime, BoxError> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map_err(|err| format!("Invalid date-time {:?}: {}", value, err).into())
}

fn resolve_timezone(tzid: &str) -> Option<Tz> {
    // Some producers prefix their TZIDs with a slash, or with their own path
    let candidates = [tzid, tzid.trim_start_matches('/')];
    let tz = candidates.iter().find_map(|candidate| Tz::from_str(candidate).ok());
    if tz.is_none() {
        log::warn!("Unknown time zone {:?}, reading its times as UTC", tzid);
    }
    tz
}

fn parse_exdate(prop: &Property) -> Result<Vec<i64>, BoxError> {
    let tzid = param(prop, "TZID");
    let is_date = is_date(prop);
    prop.value.as_deref().unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| value.is_empty() == false)
        .map(|value| parse_when_value(value, tzid, is_date).map(|when| when.millis()))
        .collect()
}

/// Parse an RFC 5545 duration (e.g. `PT1H30M`, `-P1D`, `P2W`) into milliseconds
fn parse_duration(value: &str) -> Option<i64> {
    let value = value.trim();
    let (sign, rest) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix('P')?;

    let mut total: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    let mut seen_unit = false;
    for c in rest.chars() {
        match c {
            '0'..='9' => number.push(c),
            'T' if number.is_empty() => in_time = true,
            _ => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                let unit_secs = match (c, in_time) {
                    ('W', false) => 7 * 24 * 3600,
                    ('D', false) => 24 * 3600,
                    ('H', true) => 3600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
                total = total.checked_add(n.checked_mul(unit_secs * 1000)?)?;
                seen_unit = true;
            },
        }
    }
    if number.is_empty() == false || seen_unit == false {
        return None;
    }
    Some(sign * total)
}


fn property<'a>(vevent: &'a IcalEvent, name: &str) -> Option<&'a Property> {
    vevent.properties.iter().find(|prop| prop.name.eq_ignore_ascii_case(name))
}

fn text(vevent: &IcalEvent, name: &str) -> Option<String> {
    property(vevent, name)
        .and_then(|prop| prop.value.as_deref())
        .map(unescape)
}

fn param<'a>(prop: &'a Property, name: &str) -> Option<&'a str> {
    prop.params.as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(|value| value.trim_matches('"'))
}

fn is_date(prop: &Property) -> bool {
    param(prop, "VALUE").map_or(false, |value| value.eq_ignore_ascii_case("DATE"))
}

/// Undo the escaping of TEXT values
fn unescape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}


#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_FEED: &str = r#"BEGIN:VCALENDAR
VERSION:2.0
PRODID:-//Example Corp//Team calendar//EN
BEGIN:VEVENT
UID:standup@example.com
DTSTAMP:20240601T120000Z
DTSTART;TZID=Europe/Paris:20240610T100000
DURATION:PT15M
RRULE:FREQ=WEEKLY;BYDAY=MO
EXDATE;TZID=Europe/Paris:20240617T100000,20240624T100000
SUMMARY:Stand-up
END:VEVENT
BEGIN:VEVENT
UID:offsite@example.com
DTSTAMP:20240601T120000Z
DTSTART;VALUE=DATE:20240610
SUMMARY:Team offsite
LOCATION:Lyon\, France
DESCRIPTION:Bring a jacket\nand snacks
END:VEVENT
BEGIN:VEVENT
UID:review@example.com
DTSTAMP:20240601T120000Z
DTSTART:20240611T140000Z
DTEND:20240611T150000Z
SUMMARY:Review
END:VEVENT
BEGIN:VEVENT
DTSTAMP:20240601T120000Z
DTSTART:20240612T140000Z
SUMMARY:No UID
END:VEVENT
BEGIN:VEVENT
UID:floating@example.com
DTSTAMP:20240601T120000Z
DTSTART:20240613T090000
SUMMARY:Floating
END:VEVENT
END:VCALENDAR
"#;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_feed_parsing() {
        let _ = env_logger::builder().is_test(true).try_init();
        let events = IcalFeedParser::new().parse(EXAMPLE_FEED.as_bytes()).unwrap();
        let uids: Vec<&str> = events.iter().map(|e| e.uid.as_str()).collect();
        assert_eq!(uids, vec!["standup@example.com", "offsite@example.com", "review@example.com", "floating@example.com"]);

        let standup = &events[0];
        // Paris is UTC+2 in June
        assert_eq!(standup.start_millis, Some(utc(2024, 6, 10, 8, 0)));
        assert_eq!(standup.end_millis, Some(utc(2024, 6, 10, 8, 15)));
        assert_eq!(standup.recurrence_rule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
        assert_eq!(standup.exception_dates, vec![utc(2024, 6, 17, 8, 0), utc(2024, 6, 24, 8, 0)]);
        assert!(standup.all_day == false);
        assert!(standup.is_recurring());

        let offsite = &events[1];
        assert!(offsite.all_day);
        assert_eq!(offsite.start_millis, Some(utc(2024, 6, 10, 0, 0)));
        assert_eq!(offsite.end_millis, Some(utc(2024, 6, 11, 0, 0)));
        assert_eq!(offsite.location.as_deref(), Some("Lyon, France"));
        assert_eq!(offsite.description.as_deref(), Some("Bring a jacket\nand snacks"));
        assert!(offsite.is_recurring() == false);

        let review = &events[2];
        assert_eq!(review.summary.as_deref(), Some("Review"));
        assert_eq!(review.start_millis, Some(utc(2024, 6, 11, 14, 0)));
        assert_eq!(review.end_millis, Some(utc(2024, 6, 11, 15, 0)));

        let floating = &events[3];
        assert_eq!(floating.start_millis, Some(utc(2024, 6, 13, 9, 0)));
        assert_eq!(floating.end_millis, None);
    }

    #[test]
    fn malformed_feeds_fail_as_a_whole() {
        let parser = IcalFeedParser::new();
        assert!(parser.parse(b"").is_err());
        assert!(parser.parse(&[0xff, 0xfe, 0x00]).is_err());

        let bad_date = EXAMPLE_FEED.replace("DTSTART:20240611T140000Z", "DTSTART:next tuesday");
        assert!(parser.parse(bad_date.as_bytes()).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("PT1H30M"), Some(90 * 60 * 1000));
        assert_eq!(parse_duration("P1D"), Some(DAY_MILLIS));
        assert_eq!(parse_duration("P2W"), Some(14 * DAY_MILLIS));
        assert_eq!(parse_duration("-PT15M"), Some(-15 * 60 * 1000));
        assert_eq!(parse_duration("P1DT12H"), Some(DAY_MILLIS + 12 * 3600 * 1000));
        assert_eq!(parse_duration("P"), None);
        assert_eq!(parse_duration("PT5"), None);
        assert_eq!(parse_duration("1H"), None);
    }

    #[test]
    fn unknown_time_zones_are_read_as_utc() {
        let when = parse_when_value("20240610T100000", Some("Mars/Olympus_Mons"), false).unwrap();
        assert_eq!(when.millis(), utc(2024, 6, 10, 10, 0));

        let when = parse_when_value("20240610T100000", Some("/America/New_York"), false).unwrap();
        assert_eq!(when.millis(), utc(2024, 6, 10, 14, 0));
    }
}
