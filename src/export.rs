//! CSV export of the event log.

use crate::aggregate::DetectionEvent;

const HEADER: [&str; 2] = ["Time", "Event"];

/// Render the log as CSV, oldest event first.
///
/// Accepts the log in its in-memory (newest-first) order. Every field is
/// quoted; rows are joined with `\n` and there is no trailing newline.
pub fn events_to_csv<'a, I>(newest_first: I) -> String
where
    I: IntoIterator<Item = &'a DetectionEvent>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut rows = vec![row(HEADER[0], HEADER[1])];
    for event in newest_first.into_iter().rev() {
        rows.push(row(&event.time_of_day(), &event.describe()));
    }
    rows.join("\n")
}

fn row(time: &str, event: &str) -> String {
    format!("{},{}", quote(time), quote(event))
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::collections::VecDeque;

    fn event(class: &str, pct: u8, secs: u32) -> DetectionEvent {
        DetectionEvent {
            class: class.to_string(),
            score_percent: pct,
            timestamp: Local
                .with_ymd_and_hms(2024, 5, 1, 9, 0, secs)
                .single()
                .unwrap(),
        }
    }

    #[test]
    fn export_is_oldest_first_with_header() {
        let mut log = VecDeque::new();
        log.push_front(event("bottle", 90, 1));
        log.push_front(event("cup", 72, 5));

        let csv = events_to_csv(&log);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "\"Time\",\"Event\"",
                "\"09:00:01\",\"bottle (90%)\"",
                "\"09:00:05\",\"cup (72%)\"",
            ]
        );
        assert!(!csv.ends_with('\n'));
    }

    #[test]
    fn empty_log_exports_header_only() {
        let log: Vec<DetectionEvent> = Vec::new();
        assert_eq!(events_to_csv(&log), "\"Time\",\"Event\"");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
