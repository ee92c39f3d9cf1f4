// src/period.rs
use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc};
use eyre::{eyre, Result};

/// A calendar month in the civil time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(eyre!("invalid month {}", month));
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: DateTime<Utc>, tz: FixedOffset) -> Self {
        let local = date.with_timezone(&tz);
        Self {
            year: local.year(),
            month: local.month(),
        }
    }

    /// "YYYY.MM"
    pub fn label(&self) -> String {
        format!("{}.{:02}", self.year, self.month)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First day of the month, 00:00:00 civil time.
    pub fn start(&self, tz: FixedOffset) -> Result<DateTime<FixedOffset>> {
        tz.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| eyre!("no civil start for period {}", self.label()))
    }

    /// Exclusive end: first day of the next month.
    pub fn end(&self, tz: FixedOffset) -> Result<DateTime<FixedOffset>> {
        self.next().start(tz)
    }

    /// Half-open `[start, end)` window in UTC.
    pub fn window(&self, tz: FixedOffset) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        Ok((
            self.start(tz)?.with_timezone(&Utc),
            self.end(tz)?.with_timezone(&Utc),
        ))
    }
}

/// Half-open window covering the civil day `date` falls on.
pub fn day_window(date: DateTime<FixedOffset>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = date
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(*date.offset()).single())
        .ok_or_else(|| eyre!("no civil midnight for {}", date))?;
    let start = midnight.with_timezone(&Utc);
    Ok((start, start + Duration::days(1)))
}
