//! Piecewise-linear PV power curve.
//!
//! A [`PowerCurve`] is defined by a breakpoint table of `(minute of day, watts)` pairs. Between
//! two breakpoints the power is linearly interpolated, outside the table it is zero. Lookups are
//! memoized per minute in a small LRU cache owned by the curve.

use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

use thiserror::Error;
use tracing::{debug, trace};

pub const CACHE_CAPACITY: usize = 120;

/// Minutes from 00:00 at which the reference PV curve changes slope. 336 is 05:36, 864 is
/// 14:24 (peak), 1267 is 21:07.
pub const PV_CURVE_MINUTES: [i64; 17] = [
    336, 480, 499, 557, 576, 624, 672, 749, 864, 960, 1037, 1056, 1104, 1152, 1181, 1200, 1267,
];

/// Watts at each of [`PV_CURVE_MINUTES`].
pub const PV_CURVE_WATTS: [f64; 17] = [
    0.0, 300.0, 500.0, 1000.0, 1500.0, 2000.0, 2500.0, 3000.0, 3250.0, 3000.0, 2500.0, 2000.0,
    1500.0, 1000.0, 500.0, 250.0, 0.0,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTableError {
    #[error("breakpoint table has {minutes} minutes but {powers} power values")]
    LengthMismatch { minutes: usize, powers: usize },
    #[error("breakpoint table is empty")]
    Empty,
    #[error("breakpoint minutes must be strictly increasing, {previous} is followed by {next}")]
    NotIncreasing { previous: i64, next: i64 },
}

/// Fixed-capacity map that forgets the least recently used key when full.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    // Front is least recently used.
    recency: VecDeque<K>,
}

impl<K: Copy + Eq + Hash, V: Copy> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: K) {
        if let Some(position) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(position);
        }
        self.recency.push_back(key);
    }

    pub fn get(&mut self, key: K) -> Option<V> {
        let value = *self.entries.get(&key)?;
        self.touch(key);
        Some(value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        if self.entries.insert(key, value).is_none() && self.entries.len() > self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.touch(key);
    }
}

#[derive(Debug)]
pub struct PowerCurve {
    minutes: Vec<i64>,
    powers: Vec<f64>,
    breakpoints: HashMap<i64, f64>,
    cache: LruCache<i64, f64>,
}

impl PowerCurve {
    pub fn new(minutes: Vec<i64>, powers: Vec<f64>) -> Result<Self, InvalidTableError> {
        if minutes.len() != powers.len() {
            return Err(InvalidTableError::LengthMismatch {
                minutes: minutes.len(),
                powers: powers.len(),
            });
        }
        if minutes.is_empty() {
            return Err(InvalidTableError::Empty);
        }
        if let Some(pair) = minutes.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(InvalidTableError::NotIncreasing {
                previous: pair[0],
                next: pair[1],
            });
        }

        let breakpoints = minutes.iter().copied().zip(powers.iter().copied()).collect();

        debug!(
            breakpoints = minutes.len(),
            first_minute = minutes[0],
            last_minute = minutes[minutes.len() - 1],
            "built power curve"
        );

        Ok(Self {
            minutes,
            powers,
            breakpoints,
            cache: LruCache::new(CACHE_CAPACITY),
        })
    }

    /// The reference PV production curve.
    pub fn reference() -> Self {
        Self::new(PV_CURVE_MINUTES.to_vec(), PV_CURVE_WATTS.to_vec())
            .expect("expect reference PV curve to be a valid table")
    }

    fn min_minute(&self) -> i64 {
        self.minutes[0]
    }

    fn max_minute(&self) -> i64 {
        self.minutes[self.minutes.len() - 1]
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Power in watts at `minute`, memoized.
    pub fn value(&mut self, minute: i64) -> f64 {
        if let Some(power) = self.cache.get(minute) {
            trace!(minute, power, "power curve cache hit");
            return power;
        }

        let power = self.value_uncached(minute);
        self.cache.insert(minute, power);
        power
    }

    /// Power in watts at `minute`, without touching the cache.
    pub fn value_uncached(&self, minute: i64) -> f64 {
        if minute <= self.min_minute() || minute >= self.max_minute() {
            return 0.0;
        }

        if let Some(power) = self.breakpoints.get(&minute) {
            return *power;
        }

        let start = self.find_segment(minute);
        let slope = self.slope(start, start + 1);
        slope * (minute - self.minutes[start]) as f64 + self.powers[start]
    }

    fn slope(&self, from: usize, to: usize) -> f64 {
        let run = self.minutes[to] - self.minutes[from];
        if run == 0 {
            return 0.0;
        }
        (self.powers[to] - self.powers[from]) / run as f64
    }

    /// Index `i` with `minutes[i] < minute < minutes[i + 1]`.
    ///
    /// `minute` must lie strictly inside the table and not be a breakpoint.
    fn find_segment(&self, minute: i64) -> usize {
        let minutes = &self.minutes;
        let mut low = 0;
        let mut high = minutes.len() - 1;

        loop {
            let middle = low + (high - low) / 2;
            if minute > minutes[middle] {
                if minute < minutes[middle + 1] {
                    return middle;
                }
                low = middle + 1;
            } else {
                if minute > minutes[middle - 1] {
                    return middle - 1;
                }
                high = middle - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_outside_the_table() {
        let mut curve = PowerCurve::reference();
        for minute in (-10..=336).chain(1267..1500) {
            assert_eq!(curve.value(minute), 0.0, "minute {minute}");
        }
    }

    #[test]
    fn peak_breakpoint_is_exact() {
        let mut curve = PowerCurve::reference();
        assert_eq!(curve.value(864), 3250.0);
        assert_eq!(curve.value(480), 300.0);
    }

    #[test]
    fn increasing_until_peak() {
        let mut curve = PowerCurve::reference();
        let values: Vec<f64> = (337..=864).step_by(5).map(|m| curve.value(m)).collect();
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn decreasing_after_peak() {
        let mut curve = PowerCurve::reference();
        let values: Vec<f64> = (864..=1266).step_by(5).map(|m| curve.value(m)).collect();
        for pair in values.windows(2) {
            assert!(pair[0] > pair[1], "{} !> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn interpolates_linearly_between_breakpoints() {
        let mut curve = PowerCurve::reference();
        // Halfway between (336, 0) and (480, 300).
        assert!((curve.value(408) - 150.0).abs() < 1e-9);
        // (1200, 250) to (1267, 0), one minute in.
        let expected = 250.0 - 250.0 / 67.0;
        assert!((curve.value(1201) - expected).abs() < 1e-9);
    }

    #[test]
    fn memoized_values_match_direct_computation() {
        let mut curve = PowerCurve::reference();
        for minute in 0..1440 {
            let first = curve.value(minute);
            let second = curve.value(minute);
            assert_eq!(first.to_bits(), second.to_bits());
            assert_eq!(first.to_bits(), curve.value_uncached(minute).to_bits());
        }
    }

    #[test]
    fn cache_stays_bounded() {
        let mut curve = PowerCurve::reference();
        for minute in 0..1440 {
            curve.value(minute);
        }
        assert_eq!(curve.cached_entries(), CACHE_CAPACITY);
    }

    #[test]
    fn segment_search_agrees_with_partition_point() {
        let curve = PowerCurve::reference();
        for minute in 337..1267 {
            if curve.breakpoints.contains_key(&minute) {
                continue;
            }
            let expected = PV_CURVE_MINUTES.partition_point(|m| *m < minute) - 1;
            let found = curve.find_segment(minute);
            assert_eq!(found, expected, "minute {minute}");
            assert!(PV_CURVE_MINUTES[found] < minute && minute < PV_CURVE_MINUTES[found + 1]);
        }
    }

    #[test]
    fn rejects_mismatched_table() {
        let result = PowerCurve::new(vec![0, 10, 20], vec![0.0, 5.0]);
        assert_eq!(
            result.unwrap_err(),
            InvalidTableError::LengthMismatch {
                minutes: 3,
                powers: 2
            }
        );
    }

    #[test]
    fn rejects_unordered_table() {
        let result = PowerCurve::new(vec![0, 20, 10], vec![0.0, 5.0, 0.0]);
        assert_eq!(
            result.unwrap_err(),
            InvalidTableError::NotIncreasing {
                previous: 20,
                next: 10
            }
        );
    }

    #[test]
    fn small_table_segments() {
        let mut curve = PowerCurve::new(vec![0, 10, 20, 30], vec![0.0, 10.0, 30.0, 0.0]).unwrap();
        assert_eq!(curve.value(8), 8.0);
        assert_eq!(curve.value(22), 24.0);
        assert_eq!(curve.value(15), 20.0);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert(1, 1.0);
        cache.insert(2, 2.0);
        assert_eq!(cache.get(1), Some(1.0));
        cache.insert(3, 3.0);
        assert_eq!(cache.get(2), None);
        assert_eq!(cache.get(1), Some(1.0));
        assert_eq!(cache.get(3), Some(3.0));
        assert_eq!(cache.len(), 2);
    }
}
