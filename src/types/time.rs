//! `date` and `timestamp[tz]` codec.
//!
//! Binary `date` is days since 2000-01-01, binary timestamps are microseconds
//! since 2000-01-01 00:00:00 UTC. The extreme bit patterns are the `infinity`
//! and `-infinity` special values.
use time::{Date, Duration, Month, Time, UtcDateTime};

use crate::{
    row::DecodeError,
    value::{PgDate, PgTimestamp},
};

/// 2000-01-01 as a julian day, the postgres epoch.
const PG_EPOCH_JULIAN: i32 = 2_451_545;

const DATE_POS_INFINITY: i32 = i32::MAX;
const DATE_NEG_INFINITY: i32 = i32::MIN;
const TIMESTAMP_POS_INFINITY: i64 = i64::MAX;
const TIMESTAMP_NEG_INFINITY: i64 = i64::MIN;

const UTC_PG_EPOCH: UtcDateTime = {
    // source: `from_julian_day` docs
    let date = match Date::from_julian_day(PG_EPOCH_JULIAN) {
        Ok(ok) => ok,
        Err(_) => panic!("postgres epoch is in range"),
    };
    UtcDateTime::new(date, Time::MIDNIGHT)
};

pub(crate) fn decode_date_binary(days: i32) -> Result<PgDate, DecodeError> {
    match days {
        DATE_POS_INFINITY => Ok(PgDate::PosInfinity),
        DATE_NEG_INFINITY => Ok(PgDate::NegInfinity),
        days => Date::from_julian_day(
            PG_EPOCH_JULIAN
                .checked_add(days)
                .ok_or(DecodeError::invalid("date out of range"))?,
        )
        .map(PgDate::Finite)
        .map_err(|_| DecodeError::invalid("date out of range")),
    }
}

pub(crate) fn encode_date_binary(date: &PgDate) -> i32 {
    match date {
        PgDate::Finite(date) => date.to_julian_day() - PG_EPOCH_JULIAN,
        PgDate::PosInfinity => DATE_POS_INFINITY,
        PgDate::NegInfinity => DATE_NEG_INFINITY,
    }
}

pub(crate) fn decode_timestamp_binary(micros: i64) -> PgTimestamp {
    match micros {
        TIMESTAMP_POS_INFINITY => PgTimestamp::PosInfinity,
        TIMESTAMP_NEG_INFINITY => PgTimestamp::NegInfinity,
        micros => {
            PgTimestamp::Finite(UTC_PG_EPOCH.saturating_add(Duration::microseconds(micros)))
        }
    }
}

pub(crate) fn encode_timestamp_binary(ts: &PgTimestamp) -> i64 {
    match ts {
        PgTimestamp::Finite(ts) => (*ts - UTC_PG_EPOCH).whole_microseconds() as i64,
        PgTimestamp::PosInfinity => TIMESTAMP_POS_INFINITY,
        PgTimestamp::NegInfinity => TIMESTAMP_NEG_INFINITY,
    }
}

/// ISO date, with the era suffix for years before 1 AD.
pub(crate) fn format_date(date: &PgDate) -> String {
    match date {
        PgDate::Finite(date) => {
            let (mut year, month, day) = (date.year(), date.month() as u8, date.day());
            let bc = year <= 0;
            if bc {
                // year 0 is 1 BC
                year = 1 - year;
            }
            format!(
                "{year:04}-{month:02}-{day:02}{}",
                if bc { " BC" } else { "" },
            )
        }
        PgDate::PosInfinity => "infinity".into(),
        PgDate::NegInfinity => "-infinity".into(),
    }
}

pub(crate) fn format_timestamp(ts: &PgTimestamp, with_offset: bool) -> String {
    match ts {
        PgTimestamp::Finite(ts) => {
            let date = format_date(&PgDate::Finite(ts.date()));
            let (date, era) = match date.strip_suffix(" BC") {
                Some(date) => (date, " BC"),
                None => (date.as_str(), ""),
            };
            format!(
                "{date} {:02}:{:02}:{:02}.{:06}{}{era}",
                ts.hour(),
                ts.minute(),
                ts.second(),
                ts.microsecond(),
                if with_offset { "+00" } else { "" },
            )
        }
        PgTimestamp::PosInfinity => "infinity".into(),
        PgTimestamp::NegInfinity => "-infinity".into(),
    }
}

pub(crate) fn parse_date_text(text: &str) -> Result<PgDate, DecodeError> {
    match text {
        "infinity" => return Ok(PgDate::PosInfinity),
        "-infinity" => return Ok(PgDate::NegInfinity),
        _ => { }
    }
    let (text, bc) = match text.strip_suffix(" BC") {
        Some(text) => (text, true),
        None => (text, false),
    };
    parse_ymd(text, bc).map(PgDate::Finite)
}

fn parse_ymd(text: &str, bc: bool) -> Result<Date, DecodeError> {
    let malformed = || DecodeError::invalid("malformed date");
    let mut parts = text.splitn(3, '-');
    let mut year: i32 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(malformed)?;
    let month: u8 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(malformed)?;
    let day: u8 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(malformed)?;
    if bc {
        year = 1 - year;
    }
    let month = Month::try_from(month).map_err(|_| malformed())?;
    Date::from_calendar_date(year, month, day).map_err(|_| malformed())
}

/// Parse `YYYY-MM-DD HH:MM:SS[.ffffff][±HH[:MM[:SS]]][ BC]`.
pub(crate) fn parse_timestamp_text(text: &str) -> Result<PgTimestamp, DecodeError> {
    match text {
        "infinity" => return Ok(PgTimestamp::PosInfinity),
        "-infinity" => return Ok(PgTimestamp::NegInfinity),
        _ => { }
    }
    let malformed = || DecodeError::invalid("malformed timestamp");

    let (text, bc) = match text.strip_suffix(" BC") {
        Some(text) => (text, true),
        None => (text, false),
    };
    let (date, rest) = text
        .split_once([' ', 'T'])
        .ok_or_else(malformed)?;
    let date = parse_ymd(date, bc)?;

    // split the optional utc offset off the time of day
    let sign_at = rest
        .char_indices()
        .skip(1)
        .find(|&(_, c)| matches!(c, '+' | '-'))
        .map(|(i, _)| i);
    let (time, offset) = match sign_at {
        Some(i) => (&rest[..i], Some(&rest[i..])),
        None => (rest, None),
    };

    let (hms, micro) = match time.split_once('.') {
        Some((hms, frac)) => {
            if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let mut micro: u32 = frac.parse().map_err(|_| malformed())?;
            // right pad to microseconds
            for _ in frac.len()..6 {
                micro *= 10;
            }
            (hms, micro)
        }
        None => (time, 0),
    };

    let mut hms = hms.splitn(3, ':');
    let hour: u8 = hms.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
    let minute: u8 = hms.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
    let second: u8 = hms.next().unwrap_or("0").parse().map_err(|_| malformed())?;

    let time = Time::from_hms_micro(hour, minute, second, micro).map_err(|_| malformed())?;
    let mut ts = UtcDateTime::new(date, time);

    if let Some(offset) = offset {
        let sign: i64 = if offset.starts_with('-') { -1 } else { 1 };
        let mut parts = offset[1..].splitn(3, ':');
        let hours: i64 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        let minutes: i64 = parts.next().unwrap_or("0").parse().map_err(|_| malformed())?;
        let seconds: i64 = parts.next().unwrap_or("0").parse().map_err(|_| malformed())?;
        let offset = sign * (hours * 3600 + minutes * 60 + seconds);
        ts = ts.saturating_sub(Duration::seconds(offset));
    }

    Ok(PgTimestamp::Finite(ts))
}

#[cfg(test)]
mod test {
    use super::*;

    fn date(year: i32, month: u8, day: u8) -> Date {
        Date::from_calendar_date(year, Month::try_from(month).unwrap(), day).unwrap()
    }

    #[test]
    fn date_epoch_math() {
        assert_eq!(
            decode_date_binary(0).unwrap(),
            PgDate::Finite(date(2000, 1, 1)),
        );
        assert_eq!(
            decode_date_binary(31 + 29).unwrap(),
            PgDate::Finite(date(2000, 3, 1)),
        );
        assert_eq!(
            decode_date_binary(-1).unwrap(),
            PgDate::Finite(date(1999, 12, 31)),
        );
        for days in [-400_000, -1, 0, 1, 400_000] {
            assert_eq!(encode_date_binary(&decode_date_binary(days).unwrap()), days);
        }
    }

    #[test]
    fn date_infinities() {
        assert_eq!(decode_date_binary(i32::MAX).unwrap(), PgDate::PosInfinity);
        assert_eq!(decode_date_binary(i32::MIN).unwrap(), PgDate::NegInfinity);
        assert_eq!(encode_date_binary(&PgDate::PosInfinity), i32::MAX);
        assert_eq!(encode_date_binary(&PgDate::NegInfinity), i32::MIN);
        assert_eq!(format_date(&PgDate::PosInfinity), "infinity");
        assert_eq!(parse_date_text("-infinity").unwrap(), PgDate::NegInfinity);
    }

    #[test]
    fn timestamp_epoch_math() {
        let epoch = UtcDateTime::new(date(2000, 1, 1), Time::MIDNIGHT);
        assert_eq!(decode_timestamp_binary(0), PgTimestamp::Finite(epoch));
        assert_eq!(
            decode_timestamp_binary(86_400_000_000),
            PgTimestamp::Finite(UtcDateTime::new(date(2000, 1, 2), Time::MIDNIGHT)),
        );
        assert_eq!(
            decode_timestamp_binary(-1),
            PgTimestamp::Finite(UtcDateTime::new(
                date(1999, 12, 31),
                Time::from_hms_micro(23, 59, 59, 999_999).unwrap(),
            )),
        );
        assert_eq!(
            encode_timestamp_binary(&decode_timestamp_binary(-123_456_789)),
            -123_456_789,
        );
        assert_eq!(
            decode_timestamp_binary(i64::MAX),
            PgTimestamp::PosInfinity,
        );
    }

    #[test]
    fn historical_sub_minute_offset() {
        // '1893-03-31 22:46:55+00:53:27' is the utc instant 1893-03-31T21:53:28Z
        let parsed = parse_timestamp_text("1893-03-31 22:46:55+00:53:27").unwrap();
        let expect = UtcDateTime::new(
            date(1893, 3, 31),
            Time::from_hms(21, 53, 28).unwrap(),
        );
        assert_eq!(parsed, PgTimestamp::Finite(expect));
    }

    #[test]
    fn text_format_roundtrip() {
        let ts = PgTimestamp::Finite(UtcDateTime::new(
            date(2023, 7, 9),
            Time::from_hms_micro(1, 2, 3, 450_000).unwrap(),
        ));
        let text = format_timestamp(&ts, true);
        assert_eq!(text, "2023-07-09 01:02:03.450000+00");
        assert_eq!(parse_timestamp_text(&text).unwrap(), ts);

        assert_eq!(format_date(&PgDate::Finite(date(-43, 3, 15))), "0044-03-15 BC");
        assert_eq!(
            parse_date_text("0044-03-15 BC").unwrap(),
            PgDate::Finite(date(-43, 3, 15)),
        );
    }
}
