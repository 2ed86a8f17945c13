use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuickRange {
    ThisWeek,
    ThisMonth,
    ThisTerm,
    ThisYear,
}

impl QuickRange {
    /// Accepts `thisWeek`, `this_week` or the button label `This Week`.
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "thisweek" | "week" => Some(QuickRange::ThisWeek),
            "thismonth" | "month" => Some(QuickRange::ThisMonth),
            "thisterm" | "term" => Some(QuickRange::ThisTerm),
            "thisyear" | "year" => Some(QuickRange::ThisYear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("term start months must not be empty")]
    NoTerms,
    #[error("term start month out of range: {0}")]
    BadMonth(u32),
    #[error("term start month listed twice: {0}")]
    DuplicateMonth(u32),
    #[error("date out of supported range")]
    OutOfRange,
    #[error("start date {start} is after end date {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// School-year layout used by the "This Term" and "This Week" quick filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermCalendar {
    start_months: Vec<u32>,
    week_start: WeekStart,
}

impl Default for TermCalendar {
    fn default() -> Self {
        Self {
            start_months: vec![1, 4, 7, 10],
            week_start: WeekStart::Monday,
        }
    }
}

impl TermCalendar {
    pub fn new(mut start_months: Vec<u32>, week_start: WeekStart) -> Result<Self, CalendarError> {
        if start_months.is_empty() {
            return Err(CalendarError::NoTerms);
        }
        if let Some(&m) = start_months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(CalendarError::BadMonth(m));
        }
        start_months.sort_unstable();
        if let Some(w) = start_months.windows(2).find(|w| w[0] == w[1]) {
            return Err(CalendarError::DuplicateMonth(w[0]));
        }
        Ok(Self {
            start_months,
            week_start,
        })
    }

    pub fn start_months(&self) -> &[u32] {
        &self.start_months
    }

    pub fn week_start(&self) -> WeekStart {
        self.week_start
    }

    /// The term containing `day`; terms may wrap across the new year.
    pub fn term_containing(&self, day: NaiveDate) -> Result<DateRange, CalendarError> {
        let mut starts = Vec::with_capacity(self.start_months.len() * 3);
        for year in [day.year() - 1, day.year(), day.year() + 1] {
            for &m in &self.start_months {
                starts.push(NaiveDate::from_ymd_opt(year, m, 1).ok_or(CalendarError::OutOfRange)?);
            }
        }
        let current = starts
            .iter()
            .rposition(|s| *s <= day)
            .ok_or(CalendarError::OutOfRange)?;
        let next = starts.get(current + 1).ok_or(CalendarError::OutOfRange)?;
        let end = next.pred_opt().ok_or(CalendarError::OutOfRange)?;
        DateRange::new(starts[current], end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Result<Self, CalendarError> {
        if start_date > end_date {
            return Err(CalendarError::Inverted {
                start: start_date,
                end: end_date,
            });
        }
        Ok(Self {
            start_date,
            end_date,
        })
    }

    #[cfg(test)]
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day <= self.end_date
    }

    pub fn len_days(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start_date
            .iter_days()
            .take_while(move |d| *d <= self.end_date)
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()
}

pub fn quick_range(
    range: QuickRange,
    today: NaiveDate,
    calendar: &TermCalendar,
) -> Result<DateRange, CalendarError> {
    match range {
        QuickRange::ThisWeek => {
            let offset = match calendar.week_start {
                WeekStart::Monday => today.weekday().num_days_from_monday(),
                WeekStart::Sunday => today.weekday().num_days_from_sunday(),
            };
            let start = today - Duration::days(i64::from(offset));
            DateRange::new(start, start + Duration::days(6))
        }
        QuickRange::ThisMonth => {
            let start = today.with_day(1).ok_or(CalendarError::OutOfRange)?;
            let end = last_day_of_month(today.year(), today.month())
                .ok_or(CalendarError::OutOfRange)?;
            DateRange::new(start, end)
        }
        QuickRange::ThisTerm => calendar.term_containing(today),
        QuickRange::ThisYear => {
            let start =
                NaiveDate::from_ymd_opt(today.year(), 1, 1).ok_or(CalendarError::OutOfRange)?;
            let end =
                NaiveDate::from_ymd_opt(today.year(), 12, 31).ok_or(CalendarError::OutOfRange)?;
            DateRange::new(start, end)
        }
    }
}
