use chrono::NaiveDate;
use log::{debug, warn};

use crate::data::{TradingCalendar, business_days};
use crate::model::Segment;

const SEGMENT_DAYS: [(i64, usize); 5] = [(1, 60), (2, 30), (3, 20), (4, 10), (5, 5)];

/// Trading days per segment for a frequency hint. Higher hints mean more
/// frequent trading and shorter windows; out-of-table hints are clamped.
pub fn segment_days(frequency_hint: i64) -> usize {
    let hint = frequency_hint.clamp(SEGMENT_DAYS[0].0, SEGMENT_DAYS[SEGMENT_DAYS.len() - 1].0);
    SEGMENT_DAYS
        .iter()
        .find(|(h, _)| *h == hint)
        .map(|(_, days)| *days)
        .unwrap_or(SEGMENT_DAYS[0].1)
}

/// Splits `[start, end]` into consecutive, non-overlapping trading windows.
///
/// A calendar failure or an empty calendar falls back to weekdays. When no
/// trading day is left, or when `start >= end`, the range comes back as a
/// single segment exactly as given.
pub fn build_segments(
    start: NaiveDate,
    end: NaiveDate,
    frequency_hint: i64,
    calendar: &dyn TradingCalendar,
) -> Vec<Segment> {
    if start >= end {
        return vec![Segment::new(start, end)];
    }

    let mut days = match calendar.get_trading_days(start, end) {
        Ok(days) if !days.is_empty() => days,
        Ok(_) => {
            warn!("trading calendar is empty for {start}..{end}, using business days");
            business_days(start, end)
        }
        Err(e) => {
            warn!("trading calendar failed ({e}), using business days");
            business_days(start, end)
        }
    };
    days.retain(|d| *d >= start && *d <= end);
    days.sort();
    days.dedup();

    if days.is_empty() {
        return vec![Segment::new(start, end)];
    }

    let width = segment_days(frequency_hint);
    let segments: Vec<Segment> = days
        .chunks(width)
        .map(|w| Segment::new(w[0], w[w.len() - 1]))
        .collect();
    debug!(
        "{} trading days split into {} segments of up to {width} days",
        days.len(),
        segments.len()
    );
    segments
}
