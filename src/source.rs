use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

use crate::timeline::{RawObservation, RejectReason, Rejection, TimelineStore};

/// Raw records read from a file, plus those that could not even be decoded.
///
/// Both carry their position in the file, so every rejection index means the
/// same thing whether the record failed to decode or failed validation.
#[derive(Debug, Clone, Default)]
pub struct LoadedObservations {
    pub raws: Vec<(usize, RawObservation)>,
    pub rejections: Vec<Rejection>,
}

impl LoadedObservations {
    pub fn into_store(self) -> TimelineStore {
        TimelineStore::build_indexed(self.raws).with_rejections(self.rejections)
    }
}

/// Read weekly sales records from a `.json` array or a `.csv` file.
///
/// A record that does not decode is rejected on its own; only I/O and
/// top-level format errors fail the load.
pub fn load_observations(path: &Path) -> Result<LoadedObservations> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let loaded = match ext.as_deref() {
        Some("json") => load_json(path)?,
        Some("csv") => load_csv(path)?,
        _ => bail!("Unsupported input format (expected .json or .csv): {}", path.display()),
    };

    info!(
        path = %path.display(),
        records = loaded.raws.len(),
        unreadable = loaded.rejections.len(),
        "observations loaded"
    );
    Ok(loaded)
}

fn load_json(path: &Path) -> Result<LoadedObservations> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .with_context(|| format!("Expected a JSON array of records: {}", path.display()))?;

    let mut loaded = LoadedObservations::default();
    for (index, value) in values.into_iter().enumerate() {
        let entity_id = value
            .get("entity_id")
            .or_else(|| value.get("card_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        match serde_json::from_value::<RawObservation>(value) {
            Ok(raw) => loaded.raws.push((index, raw)),
            Err(e) => loaded.rejections.push(Rejection {
                index,
                entity_id,
                reason: RejectReason::Unreadable(e.to_string()),
            }),
        }
    }
    Ok(loaded)
}

fn load_csv(path: &Path) -> Result<LoadedObservations> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;

    let mut loaded = LoadedObservations::default();
    for (index, result) in rdr.deserialize::<RawObservation>().enumerate() {
        match result {
            Ok(raw) => loaded.raws.push((index, raw)),
            Err(e) => loaded.rejections.push(Rejection {
                index,
                entity_id: None,
                reason: RejectReason::Unreadable(e.to_string()),
            }),
        }
    }
    Ok(loaded)
}
