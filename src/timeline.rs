use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::TimelineError;
use crate::models::Observation;

/// An incoming sales record before validation.
///
/// Every field is optional so a malformed row can be rejected on its own
/// instead of failing the whole load. Aliases accept the column names used by
/// the scraped weekly-sales exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    #[serde(default, alias = "card_id")]
    pub entity_id: Option<String>,
    #[serde(default, alias = "week")]
    pub period_start: Option<String>,
    #[serde(default, alias = "num_sold")]
    pub volume: Option<f64>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default, alias = "week_avg")]
    pub avg_price: Option<f64>,
}

/// Reason a single incoming record was excluded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("record could not be read: {0}")]
    Unreadable(String),
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("unparseable period_start `{0}`")]
    BadDate(String),
    #[error("volume {0} is not a non-negative integer")]
    BadVolume(f64),
    #[error("`{field}` is negative or not finite ({value})")]
    BadPrice { field: &'static str, value: f64 },
}

/// A rejected record and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Position in the incoming record stream
    pub index: usize,
    pub entity_id: Option<String>,
    pub reason: RejectReason,
}

/// Parse the date formats seen in exports: plain dates, naive timestamps, RFC 3339
pub fn parse_period_start(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive())
}

fn check_price(field: &'static str, value: Option<f64>) -> Result<f64, RejectReason> {
    let value = value.ok_or(RejectReason::Missing(field))?;
    if !value.is_finite() || value < 0.0 {
        return Err(RejectReason::BadPrice { field, value });
    }
    Ok(value)
}

/// Validate one raw record into a typed observation
pub fn validate(raw: &RawObservation) -> Result<Observation, RejectReason> {
    let entity_id = raw
        .entity_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RejectReason::Missing("entity_id"))?
        .to_string();

    let date_str = raw
        .period_start
        .as_deref()
        .ok_or(RejectReason::Missing("period_start"))?;
    let period_start =
        parse_period_start(date_str).ok_or_else(|| RejectReason::BadDate(date_str.to_string()))?;

    let volume = raw.volume.ok_or(RejectReason::Missing("volume"))?;
    if !volume.is_finite() || volume < 0.0 || volume.fract() != 0.0 {
        return Err(RejectReason::BadVolume(volume));
    }

    Ok(Observation {
        entity_id,
        period_start,
        volume: volume as u64,
        min_price: check_price("min_price", raw.min_price)?,
        max_price: check_price("max_price", raw.max_price)?,
        avg_price: check_price("avg_price", raw.avg_price)?,
    })
}

/// Universe-level grouping key for an entity: the prefix before the first
/// delimiter (`sv8pt5-12` -> `sv8pt5`). An id without the delimiter is its own group.
pub fn entity_group(entity_id: &str, delimiter: char) -> &str {
    entity_id.split(delimiter).next().unwrap_or(entity_id)
}

/// Per-entity chronologically ordered observations
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub entity_id: String,
    pub observations: Vec<Observation>,
}

impl Timeline {
    /// Build a timeline from unsorted observations of a single entity.
    /// Duplicate periods are an integrity error; nothing is picked arbitrarily.
    pub fn from_observations(
        entity_id: String,
        mut observations: Vec<Observation>,
    ) -> Result<Self, TimelineError> {
        observations.sort_by_key(|o| o.period_start);

        if let Some(pair) = observations
            .windows(2)
            .find(|pair| pair[0].period_start == pair[1].period_start)
        {
            return Err(TimelineError::DuplicatePeriod {
                entity_id,
                period_start: pair[0].period_start,
            });
        }

        Ok(Self {
            entity_id,
            observations,
        })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// All valid entity timelines for a run, plus what was thrown away on the way in
#[derive(Debug, Clone, Default)]
pub struct TimelineStore {
    /// Keyed by entity id; BTreeMap keeps iteration order stable across runs
    pub timelines: BTreeMap<String, Timeline>,
    pub rejections: Vec<Rejection>,
    pub integrity_failures: Vec<TimelineError>,
}

impl TimelineStore {
    /// Validate, group and order incoming records.
    ///
    /// Never assumes the input is sorted. Malformed records are rejected one by
    /// one; an entity with a duplicated period is dropped whole and reported.
    pub fn build<I>(raws: I) -> Self
    where
        I: IntoIterator<Item = RawObservation>,
    {
        Self::build_indexed(raws.into_iter().enumerate())
    }

    /// Same as [`TimelineStore::build`], but each record carries its own
    /// position in the source so rejections point back at the file.
    pub fn build_indexed<I>(raws: I) -> Self
    where
        I: IntoIterator<Item = (usize, RawObservation)>,
    {
        let mut store = TimelineStore::default();
        let mut by_entity: BTreeMap<String, Vec<Observation>> = BTreeMap::new();

        for (index, raw) in raws {
            match validate(&raw) {
                Ok(obs) => by_entity.entry(obs.entity_id.clone()).or_default().push(obs),
                Err(reason) => {
                    debug!(index, entity = ?raw.entity_id, %reason, "rejecting observation");
                    store.rejections.push(Rejection {
                        index,
                        entity_id: raw.entity_id.clone(),
                        reason,
                    });
                }
            }
        }

        for (entity_id, observations) in by_entity {
            match Timeline::from_observations(entity_id.clone(), observations) {
                Ok(timeline) => {
                    store.timelines.insert(entity_id, timeline);
                }
                Err(e) => {
                    warn!(error = %e, "dropping entity with ambiguous ordering");
                    store.integrity_failures.push(e);
                }
            }
        }

        if !store.rejections.is_empty() {
            warn!(rejected = store.rejections.len(), "observations rejected during load");
        }

        store
    }

    /// Merge rejections found before validation (e.g. unreadable source records),
    /// keeping the list in source order
    pub fn with_rejections(mut self, rejections: Vec<Rejection>) -> Self {
        self.rejections.extend(rejections);
        self.rejections.sort_by_key(|r| r.index);
        self
    }

    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    pub fn total_observations(&self) -> usize {
        self.timelines.values().map(Timeline::len).sum()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, week: &str, avg: f64) -> RawObservation {
        RawObservation {
            entity_id: Some(id.to_string()),
            period_start: Some(week.to_string()),
            volume: Some(3.0),
            min_price: Some(avg - 1.0),
            max_price: Some(avg + 1.0),
            avg_price: Some(avg),
        }
    }

    #[test]
    fn test_parse_period_start_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(parse_period_start("2024-03-10"), Some(expected));
        assert_eq!(parse_period_start("2024-03-10 00:00:00"), Some(expected));
        assert_eq!(parse_period_start("2024-03-10T00:00:00Z"), Some(expected));
        assert_eq!(parse_period_start("10/03/2024"), None);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut r = raw("sv1-1", "2024-01-07", 20.0);
        r.volume = Some(2.5);
        assert_eq!(validate(&r), Err(RejectReason::BadVolume(2.5)));

        let mut r = raw("sv1-1", "2024-01-07", 20.0);
        r.avg_price = None;
        assert_eq!(validate(&r), Err(RejectReason::Missing("avg_price")));

        let mut r = raw("sv1-1", "2024-01-07", 20.0);
        r.min_price = Some(-1.0);
        assert!(matches!(validate(&r), Err(RejectReason::BadPrice { field: "min_price", .. })));

        let r = raw("  ", "2024-01-07", 20.0);
        assert_eq!(validate(&r), Err(RejectReason::Missing("entity_id")));
    }

    #[test]
    fn test_build_sorts_each_entity() {
        let store = TimelineStore::build(vec![
            raw("sv1-1", "2024-01-21", 3.0),
            raw("sv1-1", "2024-01-07", 1.0),
            raw("sv2-5", "2024-01-07", 9.0),
            raw("sv1-1", "2024-01-14", 2.0),
        ]);

        assert_eq!(store.len(), 2);
        let prices: Vec<f64> = store.timelines["sv1-1"]
            .observations
            .iter()
            .map(|o| o.avg_price)
            .collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_build_counts_rejections_without_dropping_entity() {
        let mut bad = raw("sv1-1", "not-a-date", 5.0);
        bad.period_start = Some("not-a-date".to_string());

        let store = TimelineStore::build(vec![
            raw("sv1-1", "2024-01-07", 1.0),
            bad,
            raw("sv1-1", "2024-01-14", 2.0),
        ]);

        assert_eq!(store.rejected_count(), 1);
        assert_eq!(store.rejections[0].index, 1);
        assert_eq!(store.timelines["sv1-1"].len(), 2);
    }

    #[test]
    fn test_indexed_build_keeps_source_positions() {
        let mut bad = raw("sv1-1", "2024-01-14", 2.0);
        bad.volume = Some(-1.0);

        let store = TimelineStore::build_indexed(vec![
            (0, raw("sv1-1", "2024-01-07", 1.0)),
            (3, bad),
        ])
        .with_rejections(vec![Rejection {
            index: 1,
            entity_id: None,
            reason: RejectReason::Unreadable("bad row".to_string()),
        }]);

        let indices: Vec<usize> = store.rejections.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn test_duplicate_period_is_fatal_for_that_entity_only() {
        let store = TimelineStore::build(vec![
            raw("sv1-1", "2024-01-07", 1.0),
            raw("sv1-1", "2024-01-07", 1.5),
            raw("sv2-5", "2024-01-07", 9.0),
        ]);

        assert!(!store.timelines.contains_key("sv1-1"));
        assert!(store.timelines.contains_key("sv2-5"));
        assert_eq!(
            store.integrity_failures,
            vec![TimelineError::DuplicatePeriod {
                entity_id: "sv1-1".to_string(),
                period_start: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            }]
        );
    }

    #[test]
    fn test_entity_group() {
        assert_eq!(entity_group("sv8pt5-161", '-'), "sv8pt5");
        assert_eq!(entity_group("promo", '-'), "promo");
    }
}
