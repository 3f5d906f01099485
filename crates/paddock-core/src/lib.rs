//! Core domain model for paddock: entity categories, candidate records and the
//! race-event payloads they are discovered in.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "paddock-core";

/// Reference-entity category. Each category is persisted to its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Horse,
    Sire,
    Dam,
    Damsire,
    Jockey,
    Trainer,
    Owner,
}

impl Category {
    /// Processing order. Horses run first so that pedigree ids surfaced by
    /// enrichment reach the sire/dam/damsire candidate sets before those run.
    pub const ALL: [Category; 7] = [
        Category::Horse,
        Category::Sire,
        Category::Dam,
        Category::Damsire,
        Category::Jockey,
        Category::Trainer,
        Category::Owner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Horse => "horse",
            Category::Sire => "sire",
            Category::Dam => "dam",
            Category::Damsire => "damsire",
            Category::Jockey => "jockey",
            Category::Trainer => "trainer",
            Category::Owner => "owner",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Category::Horse => "horses",
            Category::Sire => "sires",
            Category::Dam => "dams",
            Category::Damsire => "damsires",
            Category::Jockey => "jockeys",
            Category::Trainer => "trainers",
            Category::Owner => "owners",
        }
    }

    /// Only horses have a per-entity detail endpoint.
    pub fn supports_enrichment(self) -> bool {
        matches!(self, Category::Horse)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single non-key column value carried by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnValue {
    Text(String),
    Date(NaiveDate),
}

/// Supplementary horse fields returned by the detail endpoint.
///
/// `id` and `name` in the detail payload are ignored on purpose: the identity of
/// a record always comes from the sighting that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HorseDetail {
    #[serde(alias = "dob", deserialize_with = "lenient_date")]
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<String>,
    pub sex_code: Option<String>,
    pub colour: Option<String>,
    pub region: Option<String>,
    pub breeder: Option<String>,
    pub sire_id: Option<String>,
    #[serde(alias = "sire_name")]
    pub sire: Option<String>,
    pub dam_id: Option<String>,
    #[serde(alias = "dam_name")]
    pub dam: Option<String>,
    pub damsire_id: Option<String>,
    #[serde(alias = "damsire_name")]
    pub damsire: Option<String>,
}

impl HorseDetail {
    /// Field-wise merge: a present incoming value replaces the current one, an
    /// absent or blank one leaves it alone.
    pub fn merge_from(&mut self, incoming: HorseDetail) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = non_blank(value) {
                *slot = Some(v);
            }
        }
        if incoming.date_of_birth.is_some() {
            self.date_of_birth = incoming.date_of_birth;
        }
        take(&mut self.sex, incoming.sex);
        take(&mut self.sex_code, incoming.sex_code);
        take(&mut self.colour, incoming.colour);
        take(&mut self.region, incoming.region);
        take(&mut self.breeder, incoming.breeder);
        take(&mut self.sire_id, incoming.sire_id);
        take(&mut self.sire, incoming.sire);
        take(&mut self.dam_id, incoming.dam_id);
        take(&mut self.dam, incoming.dam);
        take(&mut self.damsire_id, incoming.damsire_id);
        take(&mut self.damsire, incoming.damsire);
    }

    pub fn is_empty(&self) -> bool {
        *self == HorseDetail::default()
    }
}

/// Candidate or persisted reference entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub category: Category,
    pub id: String,
    pub name: String,
    /// Trainer base as printed on the racecard.
    pub location: Option<String>,
    pub detail: Option<HorseDetail>,
    /// `name` is the id standing in for a name no sighting has supplied yet.
    #[serde(default)]
    pub provisional_name: bool,
}

impl EntityRecord {
    pub fn new(category: Category, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
            name: name.into(),
            location: None,
            detail: None,
            provisional_name: false,
        }
    }

    /// A sighting that carried an id but no name. The id is stored as the name
    /// until a named sighting replaces it.
    pub fn unnamed(category: Category, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            provisional_name: true,
            ..Self::new(category, id, String::new())
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = non_blank(location);
        self
    }

    pub fn is_enriched(&self) -> bool {
        self.detail.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Attach detail-endpoint fields. Never touches `id` or `name`.
    pub fn merge_detail(&mut self, detail: HorseDetail) {
        self.detail.get_or_insert_with(HorseDetail::default).merge_from(detail);
    }

    /// Every non-key column this record carries, by column name. Absent values
    /// are reported as `None` so callers can tell "not carried" from "carried".
    ///
    /// The list is wider than any one table: filtering down to a
    /// destination schema happens in the store's allow-list.
    pub fn columns(&self) -> Vec<(&'static str, Option<ColumnValue>)> {
        let text = |v: &Option<String>| v.clone().map(ColumnValue::Text);
        let mut out = Vec::new();
        if self.location.is_some() {
            out.push(("location", text(&self.location)));
        }
        if let Some(d) = &self.detail {
            out.push(("date_of_birth", d.date_of_birth.map(ColumnValue::Date)));
            out.push(("sex", text(&d.sex)));
            out.push(("sex_code", text(&d.sex_code)));
            out.push(("colour", text(&d.colour)));
            out.push(("region", text(&d.region)));
            out.push(("breeder", text(&d.breeder)));
            out.push(("sire_id", text(&d.sire_id)));
            out.push(("sire_name", text(&d.sire)));
            out.push(("dam_id", text(&d.dam_id)));
            out.push(("dam_name", text(&d.dam)));
            out.push(("damsire_id", text(&d.damsire_id)));
            out.push(("damsire_name", text(&d.damsire)));
        }
        out
    }

    /// Pedigree ancestors named by this record's detail, as first-class
    /// candidates of their own categories.
    pub fn pedigree_candidates(&self) -> Vec<EntityRecord> {
        let Some(d) = &self.detail else {
            return Vec::new();
        };
        [
            (Category::Sire, &d.sire_id, &d.sire),
            (Category::Dam, &d.dam_id, &d.dam),
            (Category::Damsire, &d.damsire_id, &d.damsire),
        ]
        .into_iter()
        .filter_map(|(category, id, name)| {
            let id = non_blank(id.clone())?;
            let name = non_blank(name.clone())?;
            Some(EntityRecord::new(category, id, name))
        })
        .collect()
    }
}

/// One race in a results or racecards listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceEvent {
    pub race_id: Option<String>,
    pub course: Option<String>,
    pub date: Option<String>,
    pub runners: Vec<Runner>,
}

/// One page of a paginated listing. Results pages use `results` as the list
/// key, racecard pages use `racecards`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPage {
    #[serde(alias = "racecards")]
    pub results: Vec<RaceEvent>,
    pub total: Option<u64>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

/// Participant sub-record. Every entity reference is a denormalized id/name
/// pair; either half may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Runner {
    pub horse_id: Option<String>,
    #[serde(alias = "horse_name")]
    pub horse: Option<String>,
    pub jockey_id: Option<String>,
    #[serde(alias = "jockey_name")]
    pub jockey: Option<String>,
    pub trainer_id: Option<String>,
    #[serde(alias = "trainer_name")]
    pub trainer: Option<String>,
    pub trainer_location: Option<String>,
    pub owner_id: Option<String>,
    #[serde(alias = "owner_name")]
    pub owner: Option<String>,
    pub sire_id: Option<String>,
    #[serde(alias = "sire_name")]
    pub sire: Option<String>,
    pub dam_id: Option<String>,
    #[serde(alias = "dam_name")]
    pub dam: Option<String>,
    pub damsire_id: Option<String>,
    #[serde(alias = "damsire_name")]
    pub damsire: Option<String>,
}

/// Trim and drop empty strings.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

// Dates arrive as `YYYY-MM-DD`, sometimes with a time suffix, sometimes as junk.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        let head = s.trim().get(..10)?.to_string();
        NaiveDate::parse_from_str(&head, "%Y-%m-%d").ok()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_accepts_api_spelling_and_ignores_identity() {
        let detail: HorseDetail = serde_json::from_value(serde_json::json!({
            "id": "hrs_1",
            "name": "Should Not Matter",
            "dob": "2019-02-15",
            "sex_code": "G",
            "sire_id": "sir_1",
            "sire": "Frankel (GB)",
            "breeder": ""
        }))
        .unwrap();

        assert_eq!(detail.date_of_birth, NaiveDate::from_ymd_opt(2019, 2, 15));
        assert_eq!(detail.sex_code.as_deref(), Some("G"));
        assert_eq!(detail.sire.as_deref(), Some("Frankel (GB)"));
    }

    #[test]
    fn unparseable_dob_becomes_none() {
        let detail: HorseDetail =
            serde_json::from_value(serde_json::json!({ "dob": "unknown" })).unwrap();
        assert_eq!(detail.date_of_birth, None);

        let detail: HorseDetail =
            serde_json::from_value(serde_json::json!({ "dob": "2020-04-01T00:00:00Z" })).unwrap();
        assert_eq!(detail.date_of_birth, NaiveDate::from_ymd_opt(2020, 4, 1));
    }

    #[test]
    fn merge_detail_never_changes_identity_or_clears_fields() {
        let mut record = EntityRecord::new(Category::Horse, "H5", "Gamma");
        record.merge_detail(HorseDetail {
            colour: Some("b".into()),
            sire_id: Some("S1".into()),
            ..Default::default()
        });
        record.merge_detail(HorseDetail {
            colour: None,
            region: Some("GB".into()),
            breeder: Some("  ".into()),
            ..Default::default()
        });

        assert_eq!(record.id, "H5");
        assert_eq!(record.name, "Gamma");
        let detail = record.detail.as_ref().unwrap();
        assert_eq!(detail.colour.as_deref(), Some("b"));
        assert_eq!(detail.region.as_deref(), Some("GB"));
        assert_eq!(detail.sire_id.as_deref(), Some("S1"));
        assert_eq!(detail.breeder, None);
        assert!(record.is_enriched());
    }

    #[test]
    fn pedigree_candidates_require_id_and_name() {
        let mut record = EntityRecord::new(Category::Horse, "H5", "Gamma");
        record.merge_detail(HorseDetail {
            sire_id: Some("S1".into()),
            sire: Some("Sire One".into()),
            dam_id: Some("D1".into()),
            ..Default::default()
        });

        let ancestors = record.pedigree_candidates();
        assert_eq!(ancestors, vec![EntityRecord::new(Category::Sire, "S1", "Sire One")]);
    }

    #[test]
    fn unnamed_record_uses_its_id_as_provisional_name() {
        let record = EntityRecord::unnamed(Category::Jockey, "J7");
        assert_eq!(record.name, "J7");
        assert!(record.provisional_name);
        assert!(!EntityRecord::new(Category::Jockey, "J7", "Rider").provisional_name);
    }

    #[test]
    fn name_only_record_carries_no_columns() {
        let record = EntityRecord::new(Category::Jockey, "J1", "A Rider");
        assert!(record.columns().is_empty());
        assert!(!record.is_enriched());
    }
}
