// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Calendar-encoded time buckets.

use std::{fmt, time::SystemTime};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::BucketError;

/// Width of a [`TimeBucket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Granularity {
    /// `YYYYMMDDHHmm`
    Minute,
    /// `YYYYMMDDHH`
    Hour,
    /// `YYYYMMDD`
    Day,
}

impl Granularity {
    // number of trailing decimal digits below a day
    fn sub_day_digits(self) -> u32 {
        match self {
            Granularity::Minute => 4,
            Granularity::Hour => 2,
            Granularity::Day => 0,
        }
    }
}

/// An integer encoding of a UTC calendar period, e.g. `202401010930` for 09:30 on 2024-01-01.
///
/// The granularity is implied by the number of digits, so buckets of different
/// granularities never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket(i64);

impl TimeBucket {
    /// Validates a raw bucket value.
    pub fn from_raw(raw: i64) -> Result<Self, BucketError> {
        let granularity = Self::width(raw).ok_or(BucketError::BadWidth(raw))?;
        let day = raw / 10i64.pow(granularity.sub_day_digits());
        let rest = raw % 10i64.pow(granularity.sub_day_digits());
        let (year, month, dom) = (day / 10_000, (day / 100) % 100, day % 100);
        let date_ok = NaiveDate::from_ymd_opt(year as i32, month as u32, dom as u32).is_some();
        let time_ok = match granularity {
            Granularity::Minute => rest / 100 < 24 && rest % 100 < 60,
            Granularity::Hour => rest < 24,
            Granularity::Day => true,
        };
        if date_ok && time_ok {
            Ok(Self(raw))
        } else {
            Err(BucketError::BadCalendar(raw))
        }
    }

    /// The bucket of the given granularity containing `time`, in UTC.
    pub fn at(time: SystemTime, granularity: Granularity) -> Self {
        let time: DateTime<Utc> = time.into();
        let day = i64::from(time.year()) * 10_000
            + i64::from(time.month()) * 100
            + i64::from(time.day());
        Self(match granularity {
            Granularity::Day => day,
            Granularity::Hour => day * 100 + i64::from(time.hour()),
            Granularity::Minute => {
                day * 10_000 + i64::from(time.hour()) * 100 + i64::from(time.minute())
            }
        })
    }

    /// Minute bucket for the current time.
    pub fn current_minute() -> Self {
        Self::at(SystemTime::now(), Granularity::Minute)
    }

    /// The raw integer encoding.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// The granularity implied by the encoding.
    pub fn granularity(self) -> Granularity {
        // only constructible through from_raw/at, so the width is always valid
        Self::width(self.0).unwrap_or(Granularity::Minute)
    }

    /// The bucket of a coarser (or equal) granularity that contains this one.
    pub fn truncate(self, to: Granularity) -> Result<Self, BucketError> {
        let from = self.granularity();
        if to < from {
            return Err(BucketError::Finer(self.0));
        }
        let shift = from.sub_day_digits() - to.sub_day_digits();
        Ok(Self(self.0 / 10i64.pow(shift)))
    }

    fn width(raw: i64) -> Option<Granularity> {
        match raw {
            10_000_000..=99_999_999 => Some(Granularity::Day),
            1_000_000_000..=9_999_999_999 => Some(Granularity::Hour),
            100_000_000_000..=999_999_999_999 => Some(Granularity::Minute),
            _ => None,
        }
    }
}

impl TryFrom<i64> for TimeBucket {
    type Error = BucketError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<TimeBucket> for i64 {
    fn from(bucket: TimeBucket) -> Self {
        bucket.0
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use assert2::check;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(202401010930, Granularity::Minute)]
    #[case(2024010109, Granularity::Hour)]
    #[case(20240101, Granularity::Day)]
    fn granularity_follows_width(#[case] raw: i64, #[case] expected: Granularity) {
        check!(TimeBucket::from_raw(raw).unwrap().granularity() == expected);
    }

    #[rstest]
    #[case(2024010193, BucketError::BadCalendar(2024010193))]
    #[case(20241301, BucketError::BadCalendar(20241301))]
    #[case(202401010960, BucketError::BadCalendar(202401010960))]
    #[case(2024, BucketError::BadWidth(2024))]
    #[case(-20240101, BucketError::BadWidth(-20240101))]
    fn rejects_malformed_buckets(#[case] raw: i64, #[case] expected: BucketError) {
        check!(TimeBucket::from_raw(raw) == Err(expected));
    }

    #[test]
    fn computes_bucket_from_wall_clock() {
        // 2024-01-01T09:30:15Z
        let time = UNIX_EPOCH + Duration::from_secs(1_704_101_415);
        check!(TimeBucket::at(time, Granularity::Minute).raw() == 202401010930);
        check!(TimeBucket::at(time, Granularity::Hour).raw() == 2024010109);
        check!(TimeBucket::at(time, Granularity::Day).raw() == 20240101);
    }

    #[test]
    fn truncates_to_coarser_buckets() {
        let minute = TimeBucket::from_raw(202401010930).unwrap();
        check!(minute.truncate(Granularity::Hour).unwrap().raw() == 2024010109);
        check!(minute.truncate(Granularity::Day).unwrap().raw() == 20240101);
        check!(minute.truncate(Granularity::Minute).unwrap() == minute);

        let day = TimeBucket::from_raw(20240101).unwrap();
        check!(day.truncate(Granularity::Hour) == Err(BucketError::Finer(20240101)));
    }
}
