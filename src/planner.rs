use chrono::{DateTime, Duration, Utc};

use crate::domain::TimeWindow;
use crate::error::HarvestError;

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Splits `[start, end)` into consecutive windows of `increment_hours`,
    /// the last one possibly shorter.
    pub fn plan(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        increment_hours: f64,
    ) -> Result<Vec<TimeWindow>, HarvestError> {
        if !increment_hours.is_finite() || increment_hours <= 0.0 {
            return Err(HarvestError::Config(format!(
                "chunk increment must be positive, got {increment_hours} hours"
            )));
        }
        let step = Duration::milliseconds((increment_hours * 3_600_000.0).round() as i64);
        if step <= Duration::zero() {
            return Err(HarvestError::Config(format!(
                "chunk increment of {increment_hours} hours is below one millisecond"
            )));
        }

        let mut bounds = vec![start];
        let mut cursor = start;
        while cursor < end {
            cursor = (cursor + step).min(end);
            bounds.push(cursor);
        }

        if bounds.len() < 2 {
            return Err(HarvestError::Config(format!(
                "no data chunk between {start} and {end}"
            )));
        }

        bounds
            .windows(2)
            .map(|pair| TimeWindow::new(pair[0], pair[1]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn single_day_single_window() {
        let windows = ChunkPlanner::plan(at(1, 0), at(2, 0), 24.0).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start(), at(1, 0));
        assert_eq!(windows[0].end(), at(2, 0));
    }

    #[test]
    fn windows_are_contiguous_and_cover_range() {
        let cases = [(at(1, 0), at(3, 5), 12.0), (at(1, 0), at(1, 7), 2.5), (at(1, 3), at(9, 0), 24.0)];
        for (start, end, hours) in cases {
            let windows = ChunkPlanner::plan(start, end, hours).unwrap();
            let total_ms = (end - start).num_milliseconds() as f64;
            let step_ms = hours * 3_600_000.0;
            assert_eq!(windows.len(), (total_ms / step_ms).ceil() as usize);
            assert_eq!(windows.first().unwrap().start(), start);
            assert_eq!(windows.last().unwrap().end(), end);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].end(), pair[1].start());
            }
            for window in &windows[..windows.len() - 1] {
                assert_eq!(window.seconds(), hours * 3600.0);
            }
        }
    }

    #[test]
    fn final_window_may_be_shorter() {
        let windows = ChunkPlanner::plan(at(1, 0), at(1, 5), 2.0).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].seconds(), 3600.0);
    }

    #[test]
    fn empty_range_is_a_config_error() {
        assert_matches!(
            ChunkPlanner::plan(at(1, 0), at(1, 0), 24.0),
            Err(HarvestError::Config(_))
        );
        assert_matches!(
            ChunkPlanner::plan(at(2, 0), at(1, 0), 24.0),
            Err(HarvestError::Config(_))
        );
        assert_matches!(
            ChunkPlanner::plan(at(1, 0), at(2, 0), 0.0),
            Err(HarvestError::Config(_))
        );
    }
}
