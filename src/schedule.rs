/* Copyright 2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Planned drives from a weekly schedule helper

use chrono::naive::{NaiveDate, NaiveTime};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct BlockData {
    /// Required state of charge (%) when leaving
    #[serde(default, alias = "required_soc")]
    pub required: Option<f64>,
    /// Planned distance (km)
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScheduleBlock {
    pub from: NaiveTime,
    pub to: NaiveTime,
    #[serde(default)]
    pub data: BlockData,
}

/// Weekly schedule, keyed by lower-case English day name
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct WeeklySchedule(pub HashMap<String, Vec<ScheduleBlock>>);

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedDrive {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub required_soc: Option<f64>,
    pub distance: Option<f64>,
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    name.parse().ok()
}

impl WeeklySchedule {
    /// Turn the weekly blocks into concrete drives within the next week.
    ///
    /// A block whose end is not after its start runs past midnight; if such
    /// a block started yesterday and has not ended yet, it is returned as
    /// it is (ongoing). Other blocks that have already ended are moved to
    /// next week. The result is sorted by start time.
    pub fn resolve<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<PlannedDrive> {
        let tz = now.timezone();
        let now_utc = now.with_timezone(&Utc);
        let today = now.date_naive();
        let occurrence = |date: NaiveDate, block: &ScheduleBlock| {
            let end_date = if block.to <= block.from {
                date + Duration::days(1)
            } else {
                date
            };
            let start = tz.from_local_datetime(&date.and_time(block.from)).earliest()?;
            let end = tz.from_local_datetime(&end_date.and_time(block.to)).earliest()?;
            Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
        };
        let mut drives = Vec::new();
        for (day, blocks) in self.0.iter() {
            let Some(weekday) = parse_weekday(day) else {
                continue;
            };
            let offset = (weekday.num_days_from_monday() + 7
                - today.weekday().num_days_from_monday())
                % 7;
            let date = today + Duration::days(offset.into());
            for block in blocks {
                let overnight = block.to <= block.from;
                let previous = occurrence(date - Duration::days(7), block)
                    .filter(|&(start, end)| overnight && start <= now_utc && now_utc < end);
                let (start, end) = match previous {
                    Some(times) => times,
                    None => {
                        // Falls in a DST gap
                        let Some((start, end)) = occurrence(date, block) else {
                            continue;
                        };
                        if end <= now_utc {
                            (start + Duration::days(7), end + Duration::days(7))
                        } else {
                            (start, end)
                        }
                    }
                };
                drives.push(PlannedDrive {
                    start,
                    end,
                    required_soc: block.data.required,
                    distance: block.data.distance,
                });
            }
        }
        drives.sort_by_key(|drive| drive.start);
        drives
    }
}

/// The drive in progress at `now`, if any.
pub fn ongoing_drive(drives: &[PlannedDrive], now: DateTime<Utc>) -> Option<&PlannedDrive> {
    drives
        .iter()
        .find(|drive| drive.start <= now && now < drive.end)
}

/// The first drive starting after `now`.
pub fn next_drive(drives: &[PlannedDrive], now: DateTime<Utc>) -> Option<&PlannedDrive> {
    drives
        .iter()
        .filter(|drive| drive.start > now)
        .min_by_key(|drive| drive.start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> WeeklySchedule {
        serde_json::from_str(
            r#"{
                "monday": [],
                "wednesday": [{"from": "07:30:00", "to": "17:00:00"}],
                "sunday": [
                    {"from": "09:30:00", "to": "10:00:00", "data": {"required": 50}},
                    {"from": "22:00:00", "to": "01:00:00", "data": {"distance": 120}}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_into_the_coming_week() {
        // 2025-06-04 is a Wednesday
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 6, 0, 0).unwrap();
        let drives = schedule().resolve(&now);
        assert_eq!(drives.len(), 3);
        assert_eq!(drives[0].start, Utc.with_ymd_and_hms(2025, 6, 4, 7, 30, 0).unwrap());
        assert_eq!(drives[0].end, Utc.with_ymd_and_hms(2025, 6, 4, 17, 0, 0).unwrap());
        assert_eq!(drives[1].start, Utc.with_ymd_and_hms(2025, 6, 8, 9, 30, 0).unwrap());
        assert_eq!(drives[1].required_soc, Some(50.0));
        // Runs past midnight
        assert_eq!(drives[2].end, Utc.with_ymd_and_hms(2025, 6, 9, 1, 0, 0).unwrap());
        assert_eq!(drives[2].distance, Some(120.0));
    }

    #[test]
    fn finished_block_moves_to_next_week() {
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 18, 0, 0).unwrap();
        let drives = schedule().resolve(&now);
        let wednesday = drives.iter().find(|d| d.start.weekday() == Weekday::Wed).unwrap();
        assert_eq!(wednesday.start, Utc.with_ymd_and_hms(2025, 6, 11, 7, 30, 0).unwrap());
    }

    #[test]
    fn ongoing_and_next() {
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 8, 0, 0).unwrap();
        let drives = schedule().resolve(&now);
        let ongoing = ongoing_drive(&drives, now).unwrap();
        assert_eq!(ongoing.start, Utc.with_ymd_and_hms(2025, 6, 4, 7, 30, 0).unwrap());
        let next = next_drive(&drives, now).unwrap();
        assert_eq!(next.start, Utc.with_ymd_and_hms(2025, 6, 8, 9, 30, 0).unwrap());
    }

    #[test]
    fn overnight_block_from_yesterday_is_ongoing() {
        let schedule: WeeklySchedule = serde_json::from_str(
            r#"{"tuesday": [{"from": "22:00:00", "to": "01:00:00", "data": {"required": 90}}]}"#,
        )
        .unwrap();
        // Wednesday 00:30
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 0, 30, 0).unwrap();
        let drives = schedule.resolve(&now);
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].start, Utc.with_ymd_and_hms(2025, 6, 3, 22, 0, 0).unwrap());
        assert_eq!(drives[0].end, Utc.with_ymd_and_hms(2025, 6, 4, 1, 0, 0).unwrap());
        assert_eq!(ongoing_drive(&drives, now), Some(&drives[0]));
        assert!(next_drive(&drives, now).is_none());

        // Once it has ended it moves to next Tuesday
        let later = Utc.with_ymd_and_hms(2025, 6, 4, 1, 30, 0).unwrap();
        let drives = schedule.resolve(&later);
        assert_eq!(drives[0].start, Utc.with_ymd_and_hms(2025, 6, 10, 22, 0, 0).unwrap());
        assert!(ongoing_drive(&drives, later).is_none());
    }

    #[test]
    fn unknown_day_names_are_ignored() {
        let schedule: WeeklySchedule =
            serde_json::from_str(r#"{"someday": [{"from": "07:00:00", "to": "08:00:00"}]}"#)
                .unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 6, 0, 0).unwrap();
        assert!(schedule.resolve(&now).is_empty());
    }
}
