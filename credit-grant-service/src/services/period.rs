//! Calendar-aware period windows for recurring grants.
//!
//! Boundaries are always measured from the anchor (`anchor + k * step`) rather
//! than from the previous boundary, so month-end anchors do not drift: an anchor
//! on Jan 31 yields Feb 28/29, then Mar 31.

use crate::models::CreditGrantPeriod;
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("period count must be at least 1, got {0}")]
    InvalidCount(i32),

    #[error("recurring grant has no period")]
    MissingPeriod,

    #[error("period arithmetic out of range")]
    OutOfRange,
}

impl From<PeriodError> for AppError {
    fn from(err: PeriodError) -> Self {
        match err {
            PeriodError::InvalidCount(_) | PeriodError::MissingPeriod => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            PeriodError::OutOfRange => AppError::InternalError(anyhow::Error::new(err)),
        }
    }
}

/// Half-open `[start, end)` window covered by one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Days(i64),
    Months(u32),
}

/// A period unit multiplied by a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    period: CreditGrantPeriod,
    count: u32,
}

impl Recurrence {
    pub fn new(period: CreditGrantPeriod, count: i32) -> Result<Self, PeriodError> {
        if count < 1 {
            return Err(PeriodError::InvalidCount(count));
        }
        Ok(Self {
            period,
            count: count as u32,
        })
    }

    fn step(&self) -> Result<Step, PeriodError> {
        let months = |per: u32| {
            per.checked_mul(self.count)
                .map(Step::Months)
                .ok_or(PeriodError::OutOfRange)
        };
        match self.period {
            CreditGrantPeriod::Weekly => Ok(Step::Days(7 * i64::from(self.count))),
            CreditGrantPeriod::Monthly => months(1),
            CreditGrantPeriod::Quarterly => months(3),
            CreditGrantPeriod::Annual => months(12),
        }
    }

    fn boundary(&self, anchor: DateTime<Utc>, k: u32) -> Result<DateTime<Utc>, PeriodError> {
        match self.step()? {
            Step::Days(days) => {
                let total = days
                    .checked_mul(i64::from(k))
                    .and_then(Duration::try_days)
                    .ok_or(PeriodError::OutOfRange)?;
                anchor
                    .checked_add_signed(total)
                    .ok_or(PeriodError::OutOfRange)
            }
            Step::Months(months) => {
                let total = months.checked_mul(k).ok_or(PeriodError::OutOfRange)?;
                anchor
                    .checked_add_months(Months::new(total))
                    .ok_or(PeriodError::OutOfRange)
            }
        }
    }

    /// Smallest `k` with `boundary(k) > after`.
    fn first_index_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<u32, PeriodError> {
        if after < anchor {
            return Ok(0);
        }

        // Lower-bound estimate; never overshoots the answer.
        let mut k = match self.step()? {
            Step::Days(days) => ((after - anchor).num_days() / days) as u32,
            Step::Months(months) => {
                let elapsed = (after.year() - anchor.year()) * 12 + after.month0() as i32
                    - anchor.month0() as i32;
                ((elapsed - 1).max(0) as u32) / months
            }
        };

        loop {
            if self.boundary(anchor, k)? > after {
                return Ok(k);
            }
            k = k.checked_add(1).ok_or(PeriodError::OutOfRange)?;
        }
    }

    /// First period boundary strictly after `after`.
    pub fn next_boundary(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PeriodError> {
        let k = self.first_index_after(anchor, after)?;
        self.boundary(anchor, k)
    }

    /// Window that begins at `start` and runs to the next boundary, clipped to
    /// `limit`. Returns `None` when the clipped window is empty.
    pub fn window_from(
        &self,
        start: DateTime<Utc>,
        anchor: DateTime<Utc>,
        limit: Option<DateTime<Utc>>,
    ) -> Result<Option<PeriodWindow>, PeriodError> {
        let end = self.next_boundary(anchor, start)?;
        Ok(clip(start, end, limit))
    }

    /// Window containing `at`, never starting before `start`.
    pub fn window_covering(
        &self,
        at: DateTime<Utc>,
        start: DateTime<Utc>,
        anchor: DateTime<Utc>,
        limit: Option<DateTime<Utc>>,
    ) -> Result<Option<PeriodWindow>, PeriodError> {
        let at = at.max(start);
        if limit.is_some_and(|l| at >= l) {
            return Ok(None);
        }

        let k = self.first_index_after(anchor, at)?;
        let window_start = if k == 0 {
            start
        } else {
            self.boundary(anchor, k - 1)?.max(start)
        };
        let end = self.boundary(anchor, k)?;
        Ok(clip(window_start, end, limit))
    }
}

fn clip(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: Option<DateTime<Utc>>,
) -> Option<PeriodWindow> {
    let end = match limit {
        Some(limit) if end >= limit => limit,
        _ => end,
    };
    (end > start).then_some(PeriodWindow { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn monthly() -> Recurrence {
        Recurrence::new(CreditGrantPeriod::Monthly, 1).unwrap()
    }

    #[test]
    fn month_end_anchor_clamps_without_drift() {
        let anchor = at(2025, 1, 31);
        let r = monthly();

        let first = r.window_from(anchor, anchor, None).unwrap().unwrap();
        assert_eq!(first.end, at(2025, 2, 28));

        let second = r.window_from(first.end, anchor, None).unwrap().unwrap();
        assert_eq!(second.start, at(2025, 2, 28));
        assert_eq!(second.end, at(2025, 3, 31));
    }

    #[test]
    fn leap_year_february() {
        let anchor = at(2024, 1, 31);
        let window = monthly().window_from(anchor, anchor, None).unwrap().unwrap();
        assert_eq!(window.end, at(2024, 2, 29));

        let annual = Recurrence::new(CreditGrantPeriod::Annual, 1).unwrap();
        let leap_day = at(2024, 2, 29);
        let window = annual.window_from(leap_day, leap_day, None).unwrap().unwrap();
        assert_eq!(window.end, at(2025, 2, 28));
    }

    #[test]
    fn weekly_count_multiplies_days() {
        let r = Recurrence::new(CreditGrantPeriod::Weekly, 2).unwrap();
        let anchor = at(2025, 3, 3);
        let window = r.window_from(anchor, anchor, None).unwrap().unwrap();
        assert_eq!(window.end - window.start, Duration::days(14));
    }

    #[test]
    fn quarterly_and_multi_month_counts() {
        let anchor = at(2025, 1, 15);
        let quarterly = Recurrence::new(CreditGrantPeriod::Quarterly, 1).unwrap();
        assert_eq!(
            quarterly.next_boundary(anchor, anchor).unwrap(),
            at(2025, 4, 15)
        );

        let bimonthly = Recurrence::new(CreditGrantPeriod::Monthly, 2).unwrap();
        assert_eq!(
            bimonthly.next_boundary(anchor, at(2025, 3, 20)).unwrap(),
            at(2025, 5, 15)
        );
    }

    #[test]
    fn preserves_anchor_time_of_day() {
        let anchor = Utc.with_ymd_and_hms(2025, 5, 10, 10, 30, 0).unwrap();
        let next = monthly().next_boundary(anchor, anchor).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 10, 10, 30, 0).unwrap());
    }

    #[test]
    fn clips_to_limit() {
        let anchor = at(2025, 1, 1);
        let window = monthly()
            .window_from(anchor, anchor, Some(at(2025, 1, 20)))
            .unwrap()
            .unwrap();
        assert_eq!(window.end, at(2025, 1, 20));

        // Clipped to an empty window.
        assert_eq!(
            monthly()
                .window_from(at(2025, 1, 20), anchor, Some(at(2025, 1, 20)))
                .unwrap(),
            None
        );
    }

    #[test]
    fn window_covering_aligns_to_anchor() {
        let anchor = at(2025, 1, 1);
        let window = monthly()
            .window_covering(at(2025, 3, 10), anchor, anchor, None)
            .unwrap()
            .unwrap();
        assert_eq!(window.start, at(2025, 3, 1));
        assert_eq!(window.end, at(2025, 4, 1));
    }

    #[test]
    fn window_covering_never_starts_before_start() {
        let anchor = at(2025, 1, 1);
        let start = at(2025, 3, 5);
        let window = monthly()
            .window_covering(at(2025, 3, 10), start, anchor, None)
            .unwrap()
            .unwrap();
        assert_eq!(window.start, start);
        assert_eq!(window.end, at(2025, 4, 1));
    }

    #[test]
    fn stub_period_before_later_anchor() {
        let start = at(2025, 1, 1);
        let anchor = at(2025, 1, 15);
        let r = monthly();

        let stub = r.window_covering(at(2025, 1, 3), start, anchor, None).unwrap().unwrap();
        assert_eq!(stub.start, start);
        assert_eq!(stub.end, anchor);

        let next = r.window_from(stub.end, anchor, None).unwrap().unwrap();
        assert_eq!(next.end, at(2025, 2, 15));
    }

    #[test]
    fn window_covering_past_limit_is_none() {
        let anchor = at(2025, 1, 1);
        let window = monthly()
            .window_covering(at(2025, 6, 1), anchor, anchor, Some(at(2025, 5, 1)))
            .unwrap();
        assert_eq!(window, None);
    }

    #[test]
    fn identical_inputs_yield_identical_windows() {
        let anchor = at(2025, 8, 31);
        let r = monthly();
        let a = r.window_covering(at(2025, 11, 2), anchor, anchor, None).unwrap();
        let b = r.window_covering(at(2025, 11, 2), anchor, anchor, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.unwrap().start, at(2025, 10, 31));
        assert_eq!(a.unwrap().end, at(2025, 11, 30));
    }

    #[test]
    fn overflowing_count_is_out_of_range() {
        let r = Recurrence::new(CreditGrantPeriod::Annual, i32::MAX).unwrap();
        let anchor = at(2025, 1, 1);
        assert_eq!(r.next_boundary(anchor, anchor), Err(PeriodError::OutOfRange));
        assert_eq!(r.window_from(anchor, anchor, None), Err(PeriodError::OutOfRange));
    }

    #[test]
    fn rejects_non_positive_count() {
        assert_eq!(
            Recurrence::new(CreditGrantPeriod::Weekly, 0),
            Err(PeriodError::InvalidCount(0))
        );
    }
}
