//! Candidate-entity extraction from nested race-event payloads.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use paddock_core::{non_blank, Category, EntityRecord, EventPage, RaceEvent, Runner};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "paddock-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognised payload shape: {0}")]
    Shape(String),
}

/// Sub-records that produced no candidate. Only a missing id disqualifies one;
/// a missing name falls back to a provisional name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub missing_id: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.missing_id
    }
}

/// Deduplicated candidates per category, plus what was skipped on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub events: usize,
    pub candidates: BTreeMap<Category, BTreeMap<String, EntityRecord>>,
    pub skipped: BTreeMap<Category, SkipCounts>,
}

impl Extraction {
    pub fn candidates_for(&self, category: Category) -> Option<&BTreeMap<String, EntityRecord>> {
        self.candidates.get(&category)
    }

    pub fn skipped_for(&self, category: Category) -> SkipCounts {
        self.skipped.get(&category).copied().unwrap_or_default()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.values().map(BTreeMap::len).sum()
    }

    /// Record a sighting. The last named sighting of an id decides its name; a
    /// provisional name never replaces a real one. A later sighting without a
    /// location keeps the one already seen.
    pub fn observe(&mut self, record: EntityRecord) {
        let slot = self.candidates.entry(record.category).or_default();
        match slot.get_mut(&record.id) {
            Some(existing) => {
                if !record.provisional_name {
                    existing.name = record.name;
                    existing.provisional_name = false;
                }
                if record.location.is_some() {
                    existing.location = record.location;
                }
            }
            None => {
                slot.insert(record.id.clone(), record);
            }
        }
    }

    fn skip_missing_id(&mut self, category: Category) {
        self.skipped.entry(category).or_default().missing_id += 1;
    }
}

/// The id/name pair a runner carries for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sighting {
    id: Option<String>,
    name: Option<String>,
    location: Option<String>,
}

fn sighting(runner: &Runner, category: Category) -> Sighting {
    let pair = |id: &Option<String>, name: &Option<String>| Sighting {
        id: non_blank(id.clone()),
        name: non_blank(name.clone()),
        location: None,
    };
    match category {
        Category::Horse => pair(&runner.horse_id, &runner.horse),
        Category::Jockey => pair(&runner.jockey_id, &runner.jockey),
        Category::Trainer => Sighting {
            location: non_blank(runner.trainer_location.clone()),
            ..pair(&runner.trainer_id, &runner.trainer)
        },
        Category::Owner => pair(&runner.owner_id, &runner.owner),
        Category::Sire => pair(&runner.sire_id, &runner.sire),
        Category::Dam => pair(&runner.dam_id, &runner.dam),
        Category::Damsire => pair(&runner.damsire_id, &runner.damsire),
    }
}

/// Walk every runner of every event and collect one candidate per
/// `(category, id)`. Iteration is in payload order, so the last sighting of an
/// id wins its name.
pub fn extract(events: &[RaceEvent]) -> Extraction {
    let mut out = Extraction {
        events: events.len(),
        ..Default::default()
    };

    for event in events {
        let race_id = event.race_id.as_deref().unwrap_or("<unknown race>");
        for runner in &event.runners {
            for category in Category::ALL {
                let seen = sighting(runner, category);
                match (seen.id, seen.name) {
                    (None, None) => {}
                    (None, Some(name)) => {
                        debug!(race_id, %category, entity_name = %name, "sub-record without id skipped");
                        out.skip_missing_id(category);
                    }
                    (Some(id), None) => {
                        debug!(race_id, %category, entity_id = %id, "sub-record without name; id kept as provisional name");
                        out.observe(EntityRecord::unnamed(category, id).with_location(seen.location));
                    }
                    (Some(id), Some(name)) => {
                        out.observe(
                            EntityRecord::new(category, id, name).with_location(seen.location),
                        );
                    }
                }
            }
        }
    }

    info!(
        events = out.events,
        candidates = out.candidate_count(),
        "extraction complete"
    );
    out
}

/// Accepts a listing page (`{"results": [...]}` or `{"racecards": [...]}`), a
/// bare array of events, or a single event object.
pub fn parse_event_page(text: &str) -> Result<Vec<RaceEvent>, ExtractError> {
    let value: JsonValue = serde_json::from_str(text)?;
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }
    if value.get("results").is_some() || value.get("racecards").is_some() {
        let page: EventPage = serde_json::from_value(value)?;
        return Ok(page.results);
    }
    if value.get("runners").is_some() || value.get("race_id").is_some() {
        return Ok(vec![serde_json::from_value(value)?]);
    }
    Err(ExtractError::Shape(format!(
        "expected a page, an event array or an event, got {}",
        json_kind(&value)
    )))
}

pub fn load_event_file(path: impl AsRef<Path>) -> Result<Vec<RaceEvent>, ExtractError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_event_page(&text)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object without events",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn events(value: JsonValue) -> Vec<RaceEvent> {
        serde_json::from_value(value).expect("events fixture")
    }

    #[test]
    fn last_seen_name_wins_within_batch() {
        let batch = events(json!([
            { "race_id": "R1", "runners": [ { "horse_id": "H1", "horse": "Alpha" } ] },
            { "race_id": "R2", "runners": [
                { "horse_id": "H2", "horse": "Beta" },
                { "horse_id": "H1", "horse": "Alpha (GB)" }
            ] }
        ]));

        let extraction = extract(&batch);
        let horses = extraction.candidates_for(Category::Horse).unwrap();
        assert_eq!(horses.len(), 2);
        assert_eq!(horses["H1"].name, "Alpha (GB)");
        assert_eq!(horses["H2"].name, "Beta");
    }

    #[test]
    fn repeated_id_yields_exactly_one_record() {
        let runners: Vec<JsonValue> = (0..25)
            .map(|i| json!({ "jockey_id": "J1", "jockey": format!("Rider {i}") }))
            .collect();
        let batch = events(json!([{ "race_id": "R1", "runners": runners }]));

        let extraction = extract(&batch);
        let jockeys = extraction.candidates_for(Category::Jockey).unwrap();
        assert_eq!(jockeys.len(), 1);
        assert_eq!(jockeys["J1"].name, "Rider 24");
    }

    #[test]
    fn every_category_is_collected_from_one_runner() {
        let batch = events(json!([{ "race_id": "R1", "runners": [{
            "horse_id": "H1", "horse": "Alpha",
            "jockey_id": "J1", "jockey": "A Rider",
            "trainer_id": "T1", "trainer": "A Trainer", "trainer_location": "Newmarket",
            "owner_id": "O1", "owner": "An Owner",
            "sire_id": "S1", "sire": "A Sire",
            "dam_id": "D1", "dam": "A Dam",
            "damsire_id": "DS1", "damsire": "A Damsire"
        }]}]));

        let extraction = extract(&batch);
        for category in Category::ALL {
            assert_eq!(
                extraction.candidates_for(category).map(BTreeMap::len),
                Some(1),
                "{category}"
            );
        }
        let trainer = &extraction.candidates_for(Category::Trainer).unwrap()["T1"];
        assert_eq!(trainer.location.as_deref(), Some("Newmarket"));
    }

    #[test]
    fn name_field_spelling_variants_are_accepted() {
        let batch = events(json!([{ "runners": [
            { "horse_id": "H1", "horse_name": "Alpha", "sire_id": "S1", "sire_name": "Sire" }
        ]}]));
        let extraction = extract(&batch);
        assert_eq!(extraction.candidates_for(Category::Horse).unwrap()["H1"].name, "Alpha");
        assert_eq!(extraction.candidates_for(Category::Sire).unwrap()["S1"].name, "Sire");
    }

    #[test]
    fn missing_ids_are_counted_not_fatal() {
        let batch = events(json!([{ "race_id": "R1", "runners": [
            { "horse_id": "", "horse": "Nameless Id" },
            { "horse_id": null, "horse": "Also Skipped", "jockey_id": "J1" },
            { "horse_id": "H3", "horse": "Kept" },
            { "owner": null, "owner_id": null }
        ]}]));

        let extraction = extract(&batch);
        assert_eq!(extraction.candidates_for(Category::Horse).unwrap().len(), 1);
        assert_eq!(extraction.skipped_for(Category::Horse).missing_id, 2);
        assert_eq!(extraction.skipped_for(Category::Jockey).total(), 0);
        assert_eq!(extraction.skipped_for(Category::Owner).total(), 0);
    }

    #[test]
    fn nameless_sighting_keeps_id_under_provisional_name() {
        let batch = events(json!([{ "race_id": "R1", "runners": [
            { "jockey_id": "J1" },
            { "jockey_id": "J2", "jockey": "Named Early" },
            { "jockey_id": "J2" },
            { "jockey_id": "J1", "jockey": "Named Late" }
        ]}]));

        let extraction = extract(&batch);
        let jockeys = extraction.candidates_for(Category::Jockey).unwrap();
        assert_eq!(jockeys["J1"].name, "Named Late");
        assert!(!jockeys["J1"].provisional_name);
        assert_eq!(jockeys["J2"].name, "Named Early");
        assert!(!jockeys["J2"].provisional_name);

        let lone = extract(&events(json!([{ "runners": [{ "owner_id": "O1" }] }])));
        let owner = &lone.candidates_for(Category::Owner).unwrap()["O1"];
        assert_eq!(owner.name, "O1");
        assert!(owner.provisional_name);
        assert_eq!(lone.skipped_for(Category::Owner).total(), 0);
    }

    #[test]
    fn later_sighting_without_location_keeps_earlier_location() {
        let batch = events(json!([{ "runners": [
            { "trainer_id": "T1", "trainer": "Trainer", "trainer_location": "Lambourn" },
            { "trainer_id": "T1", "trainer": "Trainer Renamed" }
        ]}]));
        let extraction = extract(&batch);
        let trainer = &extraction.candidates_for(Category::Trainer).unwrap()["T1"];
        assert_eq!(trainer.name, "Trainer Renamed");
        assert_eq!(trainer.location.as_deref(), Some("Lambourn"));
    }

    #[test]
    fn empty_batch_has_no_candidates() {
        let extraction = extract(&[]);
        assert_eq!(extraction.candidate_count(), 0);
        assert!(extraction.candidates.is_empty());
    }

    #[test]
    fn parses_pages_arrays_and_single_events() {
        let page = r#"{"results":[{"race_id":"R1","runners":[]}],"total":1,"limit":50,"skip":0}"#;
        assert_eq!(parse_event_page(page).unwrap().len(), 1);

        let racecards = r#"{"racecards":[{"race_id":"R1"},{"race_id":"R2"}]}"#;
        assert_eq!(parse_event_page(racecards).unwrap().len(), 2);

        let array = r#"[{"race_id":"R1"}]"#;
        assert_eq!(parse_event_page(array).unwrap().len(), 1);

        let single = r#"{"race_id":"R1","runners":[{"horse_id":"H1","horse":"A"}]}"#;
        assert_eq!(parse_event_page(single).unwrap()[0].runners.len(), 1);

        assert!(matches!(parse_event_page("42"), Err(ExtractError::Shape(_))));
        assert!(matches!(parse_event_page("{not json"), Err(ExtractError::Json(_))));
    }

    #[test]
    fn loads_events_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"results":[{{"race_id":"R9","runners":[{{"dam_id":"D9","dam":"Dam Nine"}}]}}]}}"#
        )
        .expect("write fixture");

        let loaded = load_event_file(file.path()).expect("load");
        assert_eq!(loaded[0].race_id.as_deref(), Some("R9"));

        let missing = load_event_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ExtractError::Io { .. })));
    }
}
