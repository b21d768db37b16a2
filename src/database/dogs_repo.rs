// Dogs repository for Where's My Dog
// Lookup, insert-or-update and listing of identity records

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use rusqlite::{params, Connection, Row};

use super::models::{IdentityRecord, PriorSighting, UpsertOutcome};
use super::DatabaseManager;
use crate::keypoints::GeometryRecord;

impl DatabaseManager {
    /// Get a dog by identity key
    pub fn get_dog(&self, id: &str) -> Result<Option<IdentityRecord>> {
        self.with_connection(|conn| {
            get_dog_impl(conn, id)
        })
    }

    /// Insert a new dog or update the sighting fields of an existing one.
    ///
    /// The lookup and the write share one transaction under the connection
    /// lock, so concurrent sightings of the same dog are serialized.
    pub fn upsert_dog(
        &self,
        id: &str,
        label: &str,
        geometry: &GeometryRecord,
        note: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        self.with_transaction(|tx| {
            upsert_dog_impl(tx, id, label, geometry, note, seen_at)
        })
    }

    /// Get all dogs in the order they were first recorded
    pub fn list_dogs(&self) -> Result<Vec<IdentityRecord>> {
        self.with_connection(|conn| {
            list_dogs_impl(conn)
        })
    }
}

struct DogRow {
    id: String,
    name: String,
    keypoints: String,
    note: Option<String>,
    last_seen: Option<String>,
}

impl DogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            keypoints: row.get(2)?,
            note: row.get(3)?,
            last_seen: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord> {
        let geometry = GeometryRecord::parse(&self.keypoints)
            .map_err(|e| anyhow!("Stored keypoints for dog {} are invalid: {}", self.id, e))?;
        let last_seen = self.last_seen();

        Ok(IdentityRecord {
            id: self.id,
            label: self.name,
            geometry,
            note: self.note,
            last_seen,
        })
    }

    /// Snapshot that tolerates geometry this version cannot read
    fn into_prior(self) -> PriorSighting {
        let geometry = match GeometryRecord::parse(&self.keypoints) {
            Ok(geometry) => Some(geometry),
            Err(e) => {
                log::warn!("Stored keypoints for dog {} are unreadable, overwriting: {}", self.id, e);
                None
            }
        };
        let last_seen = self.last_seen();

        PriorSighting {
            label: self.name,
            geometry,
            note: self.note,
            last_seen,
        }
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen.as_deref().and_then(|raw| {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                log::warn!("Ignoring unparseable last_seen '{}' for dog {}", raw, self.id);
            }
            parsed
        })
    }
}

/// Timestamps are written as RFC 3339. Older deployments wrote naive
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` values, read here as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_dog_row(conn: &Connection, id: &str) -> Result<Option<DogRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, keypoints, note, last_seen FROM dogs WHERE id = ?"
    ).context("Failed to prepare get_dog query")?;

    match stmt.query_row(params![id], DogRow::from_row) {
        Ok(row) => Ok(Some(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get dog"),
    }
}

fn get_dog_impl(conn: &Connection, id: &str) -> Result<Option<IdentityRecord>> {
    get_dog_row(conn, id)?.map(DogRow::into_record).transpose()
}

fn upsert_dog_impl(
    conn: &Connection,
    id: &str,
    label: &str,
    geometry: &GeometryRecord,
    note: Option<&str>,
    seen_at: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    let previous = get_dog_row(conn, id)?.map(DogRow::into_prior);
    let keypoints = geometry.serialize();
    // Stored at microsecond precision; keep the returned record identical to a re-read
    let seen_at = seen_at.trunc_subsecs(6);
    let last_seen = format_timestamp(&seen_at);

    let record = match &previous {
        Some(existing) => {
            conn.execute(
                "UPDATE dogs SET keypoints = ?1, note = ?2, last_seen = ?3 WHERE id = ?4",
                params![keypoints, note, last_seen, id],
            ).context("Failed to update dog")?;

            log::debug!("Updated sighting for dog {} ({})", existing.label, id);

            IdentityRecord {
                id: id.to_string(),
                label: existing.label.clone(),
                geometry: geometry.clone(),
                note: note.map(str::to_string),
                last_seen: Some(seen_at),
            }
        }
        None => {
            conn.execute(
                "INSERT INTO dogs (id, name, keypoints, note, last_seen) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, label, keypoints, note, last_seen],
            ).context("Failed to insert dog")?;

            log::debug!("Inserted new dog {} ({})", label, id);

            IdentityRecord {
                id: id.to_string(),
                label: label.to_string(),
                geometry: geometry.clone(),
                note: note.map(str::to_string),
                last_seen: Some(seen_at),
            }
        }
    };

    Ok(UpsertOutcome { record, previous })
}

fn list_dogs_impl(conn: &Connection) -> Result<Vec<IdentityRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, keypoints, note, last_seen FROM dogs ORDER BY rowid"
    ).context("Failed to prepare list_dogs query")?;

    let rows = stmt.query_map([], DogRow::from_row)
        .context("Failed to query dogs")?;

    let mut results = Vec::new();
    for row in rows {
        let row = row.context("Failed to read dog row")?;
        match row.into_record() {
            Ok(record) => results.push(record),
            Err(e) => log::warn!("Skipping dog record: {:#}", e),
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_id;
    use chrono::Duration;
    use std::path::Path;
    use tempfile::tempdir;

    fn create_test_db(dir: &Path) -> DatabaseManager {
        DatabaseManager::new(dir.join("test.db")).unwrap()
    }

    fn geometry(values: &[f32]) -> GeometryRecord {
        GeometryRecord::from_values(values.to_vec()).unwrap()
    }

    #[test]
    fn test_get_missing_dog() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());
        assert!(db.get_dog("nope").unwrap().is_none());
    }

    #[test]
    fn test_first_sighting_inserts() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());
        let id = derive_id("Rex");
        let now = Utc::now();

        let outcome = db
            .upsert_dog(id.as_str(), "Rex", &geometry(&[1.0, 2.0]), Some("park"), now)
            .unwrap();

        assert!(!outcome.was_existing());
        assert_eq!(outcome.record.label, "Rex");
        assert_eq!(outcome.record.note.as_deref(), Some("park"));

        let stored = db.get_dog(id.as_str()).unwrap().unwrap();
        assert_eq!(stored, outcome.record);
    }

    #[test]
    fn test_second_sighting_updates_but_keeps_label() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());
        let id = derive_id("Rex");
        let first_seen = Utc::now() - Duration::hours(2);
        let second_seen = Utc::now();

        db.upsert_dog(id.as_str(), "Rex", &geometry(&[1.0, 2.0]), Some("park"), first_seen)
            .unwrap();
        // Label passed on update is ignored; the stored one stands
        let outcome = db
            .upsert_dog(id.as_str(), "Rexy", &geometry(&[3.0, 4.0]), Some("beach"), second_seen)
            .unwrap();

        assert!(outcome.was_existing());
        let previous = outcome.previous.as_ref().unwrap();
        assert_eq!(previous.note.as_deref(), Some("park"));
        assert_eq!(previous.geometry, Some(geometry(&[1.0, 2.0])));

        let stored = db.get_dog(id.as_str()).unwrap().unwrap();
        assert_eq!(stored.id, id.as_str());
        assert_eq!(stored.label, "Rex");
        assert_eq!(stored.geometry, geometry(&[3.0, 4.0]));
        assert_eq!(stored.note.as_deref(), Some("beach"));
        assert_eq!(stored, outcome.record);
        assert!(stored.last_seen.unwrap() > previous.last_seen.unwrap());
        assert_eq!(db.list_dogs().unwrap().len(), 1);
    }

    #[test]
    fn test_update_can_clear_note() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());

        db.upsert_dog("k", "Rex", &geometry(&[1.0, 2.0]), Some("park"), Utc::now()).unwrap();
        db.upsert_dog("k", "Rex", &geometry(&[1.0, 2.0]), None, Utc::now()).unwrap();

        assert!(db.get_dog("k").unwrap().unwrap().note.is_none());
    }

    #[test]
    fn test_list_dogs_in_insertion_order() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());

        for name in ["Rex", "Bella", "Max"] {
            let id = derive_id(name);
            db.upsert_dog(id.as_str(), name, &geometry(&[1.0, 1.0]), None, Utc::now()).unwrap();
        }
        // Updating does not move a record
        let rex = derive_id("Rex");
        db.upsert_dog(rex.as_str(), "Rex", &geometry(&[2.0, 2.0]), None, Utc::now()).unwrap();

        let labels: Vec<_> = db.list_dogs().unwrap().into_iter().map(|d| d.label).collect();
        assert_eq!(labels, vec!["Rex", "Bella", "Max"]);
    }

    #[test]
    fn test_timestamp_survives_storage() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());
        let seen = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();

        db.upsert_dog("k", "Rex", &geometry(&[1.0, 2.0]), None, seen).unwrap();
        assert_eq!(db.get_dog("k").unwrap().unwrap().last_seen, Some(seen));
    }

    #[test]
    fn test_parse_legacy_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01 10:00:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-05-01 10:00:00.250000"),
            Some(expected + Duration::milliseconds(250))
        );
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_concurrent_distinct_identities() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());

        std::thread::scope(|s| {
            for name in ["Rex", "Bella", "Max", "Luna"] {
                let db = &db;
                s.spawn(move || {
                    let id = derive_id(name);
                    db.upsert_dog(id.as_str(), name, &geometry(&[5.0, 6.0]), None, Utc::now())
                        .unwrap();
                });
            }
        });

        assert_eq!(db.list_dogs().unwrap().len(), 4);
    }

    #[test]
    fn test_concurrent_same_identity_inserts_once() {
        let dir = tempdir().unwrap();
        let db = create_test_db(dir.path());
        let id = derive_id("Rex");

        let outcomes: Vec<UpsertOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (db, id) = (&db, &id);
                    s.spawn(move || {
                        db.upsert_dog(id.as_str(), "Rex", &geometry(&[i as f32, 1.0]), None, Utc::now())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|o| !o.was_existing()).count(), 1);
        assert_eq!(db.list_dogs().unwrap().len(), 1);
    }

    #[test]
    fn test_open_legacy_store_and_upsert() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dogs.db");
        let rex = derive_id("Rex");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute(
                "CREATE TABLE dogs (id TEXT PRIMARY KEY, name TEXT NOT NULL, keypoints TEXT NOT NULL)",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO dogs (id, name, keypoints) VALUES (?1, 'Rex', '[ 10.5,  20. ,   0. ,   0. ]')",
                params![rex.as_str()],
            ).unwrap();
        }

        let db = DatabaseManager::new(db_path).unwrap();
        let stored = db.get_dog(rex.as_str()).unwrap().unwrap();
        assert_eq!(stored.label, "Rex");
        assert_eq!(stored.geometry, geometry(&[10.5, 20.0, 0.0, 0.0]));
        assert!(stored.note.is_none());
        assert!(stored.last_seen.is_none());

        let outcome = db
            .upsert_dog(rex.as_str(), "Rex", &geometry(&[1.0, 2.0]), Some("garden"), Utc::now())
            .unwrap();
        assert!(outcome.was_existing());

        let stored = db.get_dog(rex.as_str()).unwrap().unwrap();
        assert_eq!(stored.note.as_deref(), Some("garden"));
        assert!(stored.last_seen.is_some());
    }

    #[test]
    fn test_unreadable_legacy_keypoints_are_skipped_and_overwritten() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dogs.db");
        let (rex, max) = (derive_id("Rex"), derive_id("Max"));
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute(
                "CREATE TABLE dogs (id TEXT PRIMARY KEY, name TEXT NOT NULL, keypoints TEXT NOT NULL)",
                [],
            ).unwrap();
            conn.execute(
                "INSERT INTO dogs (id, name, keypoints) VALUES (?1, 'Rex', '[1.,2.]')",
                params![rex.as_str()],
            ).unwrap();
            // numpy summarizes long arrays with an ellipsis
            conn.execute(
                "INSERT INTO dogs (id, name, keypoints) VALUES (?1, 'Max', '[ 1., 2., ..., 3., 4.]')",
                params![max.as_str()],
            ).unwrap();
        }

        let db = DatabaseManager::new(db_path).unwrap();
        let labels: Vec<_> = db.list_dogs().unwrap().into_iter().map(|d| d.label).collect();
        assert_eq!(labels, vec!["Rex"]);

        let outcome = db
            .upsert_dog(max.as_str(), "Max", &geometry(&[5.0, 6.0]), Some("field"), Utc::now())
            .unwrap();
        assert!(outcome.was_existing());
        let previous = outcome.previous.unwrap();
        assert_eq!(previous.label, "Max");
        assert!(previous.geometry.is_none());

        let stored = db.get_dog(max.as_str()).unwrap().unwrap();
        assert_eq!(stored.geometry, geometry(&[5.0, 6.0]));
        assert_eq!(db.list_dogs().unwrap().len(), 2);
    }
}
