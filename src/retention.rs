//! Retention policies over snapshot creation instants.
//!
//! Every policy takes the full list of instants and returns the subset to
//! remove. The caller maps instants back to snapshots and deletes them.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Duration, NaiveDateTime};

use crate::error::{Error, Result};

/// The instants to remove so that only the `keep` most recent remain.
/// `keep == 0` removes everything.
pub fn keep_last_n(entries: &[NaiveDateTime], keep: usize) -> Vec<NaiveDateTime> {
    let mut sorted = entries.to_vec();
    sorted.sort();
    if keep == 0 {
        return sorted;
    }
    if sorted.len() <= keep {
        return Vec::new();
    }
    sorted.truncate(sorted.len() - keep);
    sorted
}

/// Parse `<count><unit>` with units s, m, h, d and w.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(text.to_owned());

    if text.len() < 2 {
        return Err(invalid());
    }
    let (count, unit) = text.split_at(text.len() - 1);
    let count: i64 = count.parse().map_err(|_| invalid())?;
    if count < 0 {
        return Err(invalid());
    }

    Ok(match unit {
        "s" => Duration::seconds(count),
        "m" => Duration::minutes(count),
        "h" => Duration::hours(count),
        "d" => Duration::days(count),
        "w" => Duration::weeks(count),
        _ => return Err(invalid()),
    })
}

/// The instants at or beyond `duration` in the past, relative to `now`.
pub fn older_than(
    entries: &[NaiveDateTime],
    duration: Duration,
    now: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let cutoff = now - duration;
    let mut removed: Vec<NaiveDateTime> = entries
        .iter()
        .filter(|dt| **dt <= cutoff)
        .copied()
        .collect();
    removed.sort();
    removed
}

/// The instants whose validity flag is unset.
pub fn invalid_only(entries: &[(NaiveDateTime, bool)]) -> Vec<NaiveDateTime> {
    let mut removed: Vec<NaiveDateTime> = entries
        .iter()
        .filter(|(_, valid)| !valid)
        .map(|(dt, _)| *dt)
        .collect();
    removed.sort();
    removed
}

/// Tier widths for grandfather-father-son rotation.
#[derive(Debug, Clone, Copy)]
pub struct GffsTiers {
    pub days: u32,
    pub weeks: u32,
    pub months: u32,
    pub years: u32,
}

impl Default for GffsTiers {
    fn default() -> Self {
        Self {
            days: 7,
            weeks: 4,
            months: 12,
            years: 3,
        }
    }
}

/// Instants retained by one rotation pass, split per tier.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GffsKept {
    pub daily: Vec<NaiveDateTime>,
    pub weekly: Vec<NaiveDateTime>,
    pub monthly: Vec<NaiveDateTime>,
    pub yearly: Vec<NaiveDateTime>,
}

impl GffsKept {
    /// Union of all tiers, ascending.
    pub fn combined(&self) -> Vec<NaiveDateTime> {
        let mut all: Vec<NaiveDateTime> = self
            .yearly
            .iter()
            .chain(&self.monthly)
            .chain(&self.weekly)
            .chain(&self.daily)
            .copied()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// The most recent entry in an ascending `group` that falls on
/// `weekday_full` (0 = Monday .. 6 = Sunday), or the most recent entry
/// when none does.
fn representative(group: &[NaiveDateTime], weekday_full: u32) -> NaiveDateTime {
    group
        .iter()
        .rev()
        .find(|dt| dt.weekday().num_days_from_monday() == weekday_full)
        .or_else(|| group.last())
        .copied()
        .unwrap()
}

fn tier<K: Ord + Copy>(
    entries: &[NaiveDateTime],
    key: impl Fn(&NaiveDateTime) -> K,
    boundary: K,
    count: u32,
    weekday_full: u32,
) -> Vec<NaiveDateTime> {
    let mut groups: BTreeMap<K, Vec<NaiveDateTime>> = BTreeMap::new();
    for dt in entries {
        let k = key(dt);
        if k < boundary {
            groups.entry(k).or_default().push(*dt);
        }
    }

    let mut kept: Vec<NaiveDateTime> = groups
        .values()
        .rev()
        .take(count as usize)
        .map(|group| representative(group, weekday_full))
        .collect();
    kept.reverse();
    kept
}

/// Grandfather-father-son rotation over `entries`.
///
/// The daily tier keeps the most recent instant per calendar date within
/// the last `days` days. Coarser tiers continue where the finer one left
/// off: the weekly tier covers ISO weeks strictly before the oldest daily
/// week, the monthly tier covers months before the oldest day or week kept
/// and the yearly tier covers years before everything above. Each coarse
/// period is represented by its latest instant falling on `weekday_full`,
/// or its latest instant outright.
pub fn rotate_gffs(
    entries: &[NaiveDateTime],
    tiers: GffsTiers,
    weekday_full: u32,
) -> GffsKept {
    let mut sorted = entries.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut kept = GffsKept::default();
    let start = match sorted.last() {
        Some(start) => *start,
        None => return kept,
    };

    let horizon = start - Duration::days(tiers.days as i64);
    let mut seen_dates = HashSet::new();
    for dt in sorted.iter().rev() {
        if *dt <= horizon || kept.daily.len() >= tiers.days as usize {
            break;
        }
        if seen_dates.insert(dt.date()) {
            kept.daily.push(*dt);
        }
    }
    kept.daily.reverse();

    let week_key = |dt: &NaiveDateTime| {
        let week = dt.iso_week();
        (week.year(), week.week())
    };
    let week_boundary = kept
        .daily
        .iter()
        .map(week_key)
        .min()
        .unwrap_or_else(|| week_key(&start));
    kept.weekly = tier(&sorted, week_key, week_boundary, tiers.weeks, weekday_full);

    let month_key = |dt: &NaiveDateTime| (dt.year(), dt.month());
    let month_boundary = kept
        .daily
        .iter()
        .chain(&kept.weekly)
        .map(month_key)
        .min()
        .unwrap_or_else(|| month_key(&start));
    kept.monthly = tier(&sorted, month_key, month_boundary, tiers.months, weekday_full);

    let year_boundary = kept
        .daily
        .iter()
        .chain(&kept.weekly)
        .chain(&kept.monthly)
        .map(NaiveDateTime::year)
        .min()
        .unwrap_or_else(|| start.year());
    kept.yearly = tier(
        &sorted,
        |dt| dt.year(),
        year_boundary,
        tiers.years,
        weekday_full,
    );

    kept
}

/// The instants a rotation pass would discard.
pub fn gffs(entries: &[NaiveDateTime], tiers: GffsTiers, weekday_full: u32) -> Vec<NaiveDateTime> {
    let kept: HashSet<NaiveDateTime> = rotate_gffs(entries, tiers, weekday_full)
        .combined()
        .into_iter()
        .collect();
    let mut removed: Vec<NaiveDateTime> = entries
        .iter()
        .filter(|dt| !kept.contains(dt))
        .copied()
        .collect();
    removed.sort();
    removed.dedup();
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn daily_series(last: NaiveDateTime, count: usize) -> Vec<NaiveDateTime> {
        (0..count).map(|i| last - Duration::days(i as i64)).collect()
    }

    #[test]
    fn keep_last_n_basics() {
        let entries = vec![dt(2024, 1, 3), dt(2024, 1, 1), dt(2024, 1, 2)];

        assert_eq!(
            keep_last_n(&entries, 1),
            vec![dt(2024, 1, 1), dt(2024, 1, 2)]
        );
        assert_eq!(keep_last_n(&entries, 3), Vec::new());
        assert_eq!(keep_last_n(&entries, 10), Vec::new());

        let mut all = entries.clone();
        all.sort();
        assert_eq!(keep_last_n(&entries, 0), all);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("12h").unwrap(), Duration::hours(12));
        assert_eq!(parse_duration("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("2w").unwrap(), Duration::weeks(2));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for text in ["", "7", "d", "7x", "d7", "1.5d", "-3d", "7 d"] {
            assert!(
                matches!(parse_duration(text), Err(Error::InvalidDuration(_))),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn older_than_includes_the_boundary() {
        let now = dt(2024, 1, 15);
        let entries = vec![
            dt(2024, 1, 1),
            dt(2024, 1, 8),
            dt(2024, 1, 9),
            dt(2024, 1, 14),
        ];

        let removed = older_than(&entries, Duration::weeks(1), now);
        assert_eq!(removed, vec![dt(2024, 1, 1), dt(2024, 1, 8)]);
    }

    #[test]
    fn invalid_only_picks_unset_flags() {
        let entries = vec![
            (dt(2024, 1, 2), false),
            (dt(2024, 1, 1), true),
            (dt(2024, 1, 3), false),
        ];
        assert_eq!(invalid_only(&entries), vec![dt(2024, 1, 2), dt(2024, 1, 3)]);
        assert!(invalid_only(&[]).is_empty());
    }

    #[test]
    fn rotate_gffs_full_sunday() {
        let entries = daily_series(dt(2017, 12, 31), 365 * 6);
        let kept = rotate_gffs(&entries, GffsTiers::default(), 6);

        assert_eq!(
            kept.combined(),
            vec![
                dt(2013, 12, 29),
                dt(2014, 12, 28),
                dt(2015, 12, 27),
                dt(2016, 12, 25),
                dt(2017, 1, 29),
                dt(2017, 2, 26),
                dt(2017, 3, 26),
                dt(2017, 4, 30),
                dt(2017, 5, 28),
                dt(2017, 6, 25),
                dt(2017, 7, 30),
                dt(2017, 8, 27),
                dt(2017, 9, 24),
                dt(2017, 10, 29),
                dt(2017, 11, 26),
                dt(2017, 12, 3),
                dt(2017, 12, 10),
                dt(2017, 12, 17),
                dt(2017, 12, 24),
                dt(2017, 12, 25),
                dt(2017, 12, 26),
                dt(2017, 12, 27),
                dt(2017, 12, 28),
                dt(2017, 12, 29),
                dt(2017, 12, 30),
                dt(2017, 12, 31),
            ]
        );
    }

    #[test]
    fn rotate_gffs_full_monday() {
        let entries = daily_series(dt(2017, 12, 31), 365 * 7);
        let kept = rotate_gffs(&entries, GffsTiers::default(), 0);

        assert_eq!(
            kept.combined(),
            vec![
                dt(2013, 12, 30),
                dt(2014, 12, 29),
                dt(2015, 12, 28),
                dt(2016, 11, 28),
                dt(2016, 12, 26),
                dt(2017, 1, 30),
                dt(2017, 2, 27),
                dt(2017, 3, 27),
                dt(2017, 4, 24),
                dt(2017, 5, 29),
                dt(2017, 6, 26),
                dt(2017, 7, 31),
                dt(2017, 8, 28),
                dt(2017, 9, 25),
                dt(2017, 10, 30),
                dt(2017, 11, 27),
                dt(2017, 12, 4),
                dt(2017, 12, 11),
                dt(2017, 12, 18),
                dt(2017, 12, 25),
                dt(2017, 12, 26),
                dt(2017, 12, 27),
                dt(2017, 12, 28),
                dt(2017, 12, 29),
                dt(2017, 12, 30),
                dt(2017, 12, 31),
            ]
        );
    }

    #[test]
    fn rotate_gffs_keeps_most_recent_per_day() {
        let entries = vec![
            dt(2024, 1, 2).with_hour(8),
            dt(2024, 1, 2).with_hour(20),
            dt(2024, 1, 1).with_hour(12),
        ];
        let kept = rotate_gffs(&entries, GffsTiers::default(), 6);

        assert_eq!(
            kept.daily,
            vec![dt(2024, 1, 1).with_hour(12), dt(2024, 1, 2).with_hour(20)]
        );
        assert_eq!(
            gffs(&entries, GffsTiers::default(), 6),
            vec![dt(2024, 1, 2).with_hour(8)]
        );
    }

    #[test]
    fn rotate_gffs_empty_input() {
        let kept = rotate_gffs(&[], GffsTiers::default(), 6);
        assert_eq!(kept, GffsKept::default());
        assert!(gffs(&[], GffsTiers::default(), 6).is_empty());
    }

    #[test]
    fn rotate_gffs_sparse_history_keeps_everything_recent() {
        // Fewer entries than the daily tier holds: nothing is discarded.
        let entries = vec![dt(2024, 1, 8), dt(2024, 1, 6), dt(2024, 1, 4)];
        assert!(gffs(&entries, GffsTiers::default(), 6).is_empty());
    }

    trait WithHour {
        fn with_hour(self, hour: u32) -> NaiveDateTime;
    }

    impl WithHour for NaiveDateTime {
        fn with_hour(self, hour: u32) -> NaiveDateTime {
            self.date().and_hms_opt(hour, 0, 0).unwrap()
        }
    }
}
