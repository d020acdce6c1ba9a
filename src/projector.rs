use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};

use crate::model::*;

/// Bookings shown per day cell before collapsing the rest into `+N`.
pub const PREVIEW_BUDGET: usize = 3;

/// Display token for a service line. Fixed table, so stable across runs.
pub fn color_for(line: ServiceLine) -> &'static str {
    match line {
        ServiceLine::A => "blue",
        ServiceLine::B => "green",
        ServiceLine::C => "orange",
        ServiceLine::D => "purple",
    }
}

/// Token for an optional tag; untagged bookings render neutral.
pub fn color_for_tag(line: Option<ServiceLine>) -> &'static str {
    line.map_or("gray", color_for)
}

/// A calendar month, e.g. `2025-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthRef {
    year: i32,
    month: u32,
}

impl MonthRef {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|next| next.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl FromStr for MonthRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s}"))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in {s}"))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in {s}"))?;
        Self::new(year, month).ok_or_else(|| format!("no such month: {s}"))
    }
}

impl fmt::Display for MonthRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayCell {
    pub date: NaiveDate,
    /// False for days borrowed from the neighbouring months.
    pub in_month: bool,
    /// True if the date is bookable under the window.
    pub in_window: bool,
    /// Active bookings on this date, by slot time.
    pub bookings: Vec<Booking>,
}

/// Rendered subset of a day's bookings. The cell keeps the full list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preview<'a> {
    pub shown: &'a [Booking],
    pub overflow: usize,
}

impl Preview<'_> {
    pub fn overflow_label(&self) -> Option<String> {
        (self.overflow > 0).then(|| format!("+{}", self.overflow))
    }
}

impl DayCell {
    pub fn preview(&self, budget: usize) -> Preview<'_> {
        let shown = &self.bookings[..self.bookings.len().min(budget)];
        Preview {
            shown,
            overflow: self.bookings.len() - shown.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthGrid {
    pub month: MonthRef,
    /// Sunday-first rows of exactly seven cells.
    pub weeks: Vec<Vec<DayCell>>,
}

impl MonthGrid {
    pub fn cells(&self) -> impl Iterator<Item = &DayCell> {
        self.weeks.iter().flatten()
    }

    pub fn cell(&self, date: NaiveDate) -> Option<&DayCell> {
        self.cells().find(|c| c.date == date)
    }
}

/// Lay out `month` as full weeks, padding with days of the adjacent months,
/// and attach each date's active bookings.
pub fn month_grid(window: &WindowConfig, bookings: &[Booking], month: MonthRef) -> MonthGrid {
    let first = month.first_day();
    let last = month.last_day();
    let lead = first.weekday().num_days_from_sunday() as u64;
    let trail = 6 - last.weekday().num_days_from_sunday() as u64;
    let start = first.checked_sub_days(Days::new(lead)).unwrap_or(first);
    let end = last.checked_add_days(Days::new(trail)).unwrap_or(last);

    let mut by_date: BTreeMap<NaiveDate, Vec<Booking>> = BTreeMap::new();
    for b in bookings
        .iter()
        .filter(|b| b.is_active() && start <= b.slot_date && b.slot_date <= end)
    {
        by_date.entry(b.slot_date).or_default().push(b.clone());
    }
    for day in by_date.values_mut() {
        day.sort_by_key(|b| (b.slot_time, b.created_at));
    }

    let cells: Vec<DayCell> = start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(|date| DayCell {
            date,
            in_month: month.contains(date),
            in_window: window.contains_date(date),
            bookings: by_date.remove(&date).unwrap_or_default(),
        })
        .collect();

    MonthGrid {
        month,
        weeks: cells.chunks(7).map(|w| w.to_vec()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn window() -> WindowConfig {
        WindowConfig {
            date_begin: d("2025-01-10"),
            date_end: d("2025-01-20"),
            time_first: parse_hhmm("09:00").unwrap(),
            time_last: parse_hhmm("18:00").unwrap(),
            time_unit: 60,
            max_limit: None,
        }
    }

    fn booking(date: &str, time: &str, status: BookingStatus, line: Option<ServiceLine>) -> Booking {
        Booking {
            id: Ulid::new(),
            window_id: Ulid::new(),
            slot_date: d(date),
            slot_time: parse_hhmm(time).unwrap(),
            subject_id: "unit-101-1203".into(),
            contact_name: "Kim".into(),
            contact_phone: "010-0000-0000".into(),
            memo: None,
            line,
            status,
            created_at: 0,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

    #[test]
    fn january_2025_layout() {
        let grid = month_grid(&window(), &[], MonthRef::new(2025, 1).unwrap());
        assert_eq!(grid.weeks.len(), 5);
        assert!(grid.weeks.iter().all(|w| w.len() == 7));
        assert_eq!(grid.weeks[0][0].date, d("2024-12-29"));
        assert_eq!(grid.weeks[0][0].date.weekday(), Weekday::Sun);
        assert!(!grid.weeks[0][0].in_month);
        assert_eq!(grid.weeks[0][3].date, d("2025-01-01"));
        assert!(grid.weeks[0][3].in_month);
        let last = &grid.weeks[4][6];
        assert_eq!(last.date, d("2025-02-01"));
        assert!(!last.in_month);
    }

    #[test]
    fn month_starting_sunday_needs_no_padding() {
        let grid = month_grid(&window(), &[], "2026-02".parse().unwrap());
        assert_eq!(grid.weeks.len(), 4);
        assert_eq!(grid.weeks[0][0].date, d("2026-02-01"));
        assert_eq!(grid.weeks[3][6].date, d("2026-02-28"));
        assert!(grid.cells().all(|c| c.in_month));
    }

    #[test]
    fn window_days_flagged() {
        let grid = month_grid(&window(), &[], MonthRef::new(2025, 1).unwrap());
        let bookable: Vec<_> = grid.cells().filter(|c| c.in_window).map(|c| c.date).collect();
        assert_eq!(bookable.len(), 11);
        assert_eq!(bookable.first(), Some(&d("2025-01-10")));
        assert_eq!(bookable.last(), Some(&d("2025-01-20")));
    }

    #[test]
    fn only_active_bookings_placed() {
        let bookings = vec![
            booking("2025-01-10", "11:00", BookingStatus::Active, Some(ServiceLine::A)),
            booking("2025-01-10", "09:00", BookingStatus::Active, None),
            booking("2025-01-10", "10:00", BookingStatus::Cancelled, None),
            booking("2025-02-01", "09:00", BookingStatus::Active, None),
            booking("2025-03-05", "09:00", BookingStatus::Active, None),
        ];
        let grid = month_grid(&window(), &bookings, MonthRef::new(2025, 1).unwrap());
        let day = grid.cell(d("2025-01-10")).unwrap();
        let times: Vec<_> = day.bookings.iter().map(|b| fmt_hhmm(b.slot_time)).collect();
        assert_eq!(times, vec!["09:00", "11:00"]);
        // Borrowed trailing day still carries its bookings.
        assert_eq!(grid.cell(d("2025-02-01")).unwrap().bookings.len(), 1);
        let placed: usize = grid.cells().map(|c| c.bookings.len()).sum();
        assert_eq!(placed, 3);
    }

    #[test]
    fn preview_truncates_without_dropping() {
        let bookings: Vec<_> = ["09:00", "10:00", "11:00", "12:00", "13:00"]
            .iter()
            .map(|t| booking("2025-01-15", t, BookingStatus::Active, None))
            .collect();
        let grid = month_grid(&window(), &bookings, MonthRef::new(2025, 1).unwrap());
        let cell = grid.cell(d("2025-01-15")).unwrap();
        let preview = cell.preview(PREVIEW_BUDGET);
        assert_eq!(preview.shown.len(), 3);
        assert_eq!(preview.overflow, 2);
        assert_eq!(preview.overflow_label().as_deref(), Some("+2"));
        assert_eq!(cell.bookings.len(), 5);

        let quiet = grid.cell(d("2025-01-16")).unwrap().preview(PREVIEW_BUDGET);
        assert!(quiet.shown.is_empty());
        assert_eq!(quiet.overflow_label(), None);
    }

    #[test]
    fn colors_are_stable_and_distinct() {
        let tokens: Vec<_> = ServiceLine::ALL.iter().map(|l| color_for(*l)).collect();
        let again: Vec<_> = ServiceLine::ALL.iter().map(|l| color_for(*l)).collect();
        assert_eq!(tokens, again);
        let mut unique = tokens.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), tokens.len());
        assert_eq!(color_for_tag(None), "gray");
        assert_eq!(color_for_tag(Some(ServiceLine::B)), color_for(ServiceLine::B));
    }

    #[test]
    fn month_parsing() {
        let m: MonthRef = "2025-12".parse().unwrap();
        assert_eq!(m.last_day(), d("2025-12-31"));
        assert_eq!(m.to_string(), "2025-12");
        assert!("2025-13".parse::<MonthRef>().is_err());
        assert!("2025".parse::<MonthRef>().is_err());
        assert_eq!(MonthRef::of(d("2024-02-10")).last_day(), d("2024-02-29"));
    }
}
