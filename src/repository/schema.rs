use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JOB_TYPE: &str = "Job";
pub const JOB_VERSION: u32 = 3;

/// Versioned wrapper around every persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub data: Value,
}

/// Upgrades the `data` of a record by exactly one version.
pub type Migration = fn(Value) -> Result<Value, String>;

/// Known record types, their current versions and the migrations that
/// bring older records up to date.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    current: HashMap<String, u32>,
    migrations: HashMap<(String, u32), Migration>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            current: HashMap::new(),
            migrations: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut schema = Self::empty();
        schema.declare(JOB_TYPE, JOB_VERSION);
        schema.register(JOB_TYPE, 1, job_v1_to_v2);
        schema.register(JOB_TYPE, 2, job_v2_to_v3);
        schema
    }

    pub fn declare(&mut self, kind: &str, version: u32) {
        self.current.insert(kind.to_string(), version);
    }

    pub fn register(&mut self, kind: &str, from_version: u32, migration: Migration) {
        self.migrations
            .insert((kind.to_string(), from_version), migration);
    }

    pub fn current_version(&self, kind: &str) -> Option<u32> {
        self.current.get(kind).copied()
    }

    pub fn encode<T: Serialize>(&self, kind: &str, value: &T) -> serde_json::Result<Vec<u8>> {
        let envelope = Envelope {
            kind: kind.to_string(),
            version: self.current_version(kind).unwrap_or(1),
            data: serde_json::to_value(value)?,
        };
        serde_json::to_vec_pretty(&envelope)
    }

    /// Parse a record, applying every migration between its version and the
    /// current one. Any failure is reported as a message; the caller decides
    /// whether to fall back or to mark the record inaccessible.
    pub fn decode<T: DeserializeOwned>(&self, kind: &str, bytes: &[u8]) -> Result<T, String> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| format!("malformed record: {}", e))?;
        if envelope.kind != kind {
            return Err(format!(
                "expected a {} record, found {}",
                kind, envelope.kind
            ));
        }
        let data = self.migrate(envelope)?;
        serde_json::from_value(data).map_err(|e| format!("invalid {} record: {}", kind, e))
    }

    pub fn migrate(&self, envelope: Envelope) -> Result<Value, String> {
        let current = self
            .current_version(&envelope.kind)
            .ok_or_else(|| format!("unknown record type {}", envelope.kind))?;

        if envelope.version > current {
            return Err(format!(
                "{} record version {} is newer than supported version {}",
                envelope.kind, envelope.version, current
            ));
        }

        let mut data = envelope.data;
        for version in envelope.version..current {
            let migration = self
                .migrations
                .get(&(envelope.kind.clone(), version))
                .ok_or_else(|| {
                    format!(
                        "no migration for {} record from version {}",
                        envelope.kind, version
                    )
                })?;
            data = migration(data)
                .map_err(|e| format!("migration from version {} failed: {}", version, e))?;
        }
        Ok(data)
    }
}

fn object(data: Value) -> Result<Map<String, Value>, String> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected an object, found {}", other)),
    }
}

/// Version 1 stored plugin references as bare type names.
fn job_v1_to_v2(data: Value) -> Result<Value, String> {
    let mut map = object(data)?;
    for field in ["application", "backend"] {
        match map.remove(field) {
            Some(Value::String(kind)) => {
                map.insert(field.to_string(), json!({ "kind": kind, "settings": {} }));
            }
            Some(other @ Value::Object(_)) => {
                map.insert(field.to_string(), other);
            }
            Some(other) => return Err(format!("{} has unexpected form {}", field, other)),
            None => return Err(format!("missing {}", field)),
        }
    }
    Ok(Value::Object(map))
}

/// Version 2 called the status timestamps `time` and stored the subjob
/// count under `subjobs`.
fn job_v2_to_v3(data: Value) -> Result<Value, String> {
    let mut map = object(data)?;
    if let Some(times) = map.remove("time") {
        map.insert("status_times".to_string(), times);
    }
    match map.remove("subjobs") {
        Some(Value::Number(n)) => {
            map.insert("subjob_count".to_string(), Value::Number(n));
        }
        Some(Value::Null) | None => {}
        Some(other) => return Err(format!("subjobs has unexpected form {}", other)),
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ApplicationRef, BackendRef, Job, JobSpec, JobStatus};

    fn sample_job() -> Job {
        let mut job = Job::from_spec(
            &JobSpec::new(ApplicationRef::executable("true"), BackendRef::new("local"))
                .with_name("sample"),
        );
        job.assign_id(11);
        job
    }

    #[test]
    fn encode_wraps_in_envelope() {
        let schema = SchemaRegistry::standard();
        let bytes = schema.encode(JOB_TYPE, &sample_job()).unwrap();
        let envelope: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.kind, "Job");
        assert_eq!(envelope.version, JOB_VERSION);
        assert_eq!(envelope.data["status"], "new");
    }

    #[test]
    fn decode_current_version() {
        let schema = SchemaRegistry::standard();
        let job = sample_job();
        let bytes = schema.encode(JOB_TYPE, &job).unwrap();
        let decoded: Job = schema.decode(JOB_TYPE, &bytes).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn decode_migrates_version_one() {
        let schema = SchemaRegistry::standard();
        let v1 = json!({
            "type": "Job",
            "version": 1,
            "data": {
                "id": 4,
                "status": "completed",
                "name": "legacy",
                "application": "executable",
                "backend": "local",
                "created_at": "2024-03-01T10:00:00Z",
                "time": { "new": "2024-03-01T10:00:00Z" },
                "subjobs": 2
            }
        });
        let job: Job = schema
            .decode(JOB_TYPE, &serde_json::to_vec(&v1).unwrap())
            .unwrap();
        assert_eq!(job.id, 4);
        assert_eq!(job.own_status(), JobStatus::Completed);
        assert_eq!(job.backend().kind, "local");
        assert_eq!(job.declared_subjobs(), 2);
        assert!(job.status_time(JobStatus::New).is_some());
    }

    #[test]
    fn decode_rejects_newer_and_unknown() {
        let schema = SchemaRegistry::standard();
        let newer = json!({ "type": "Job", "version": 9, "data": {} });
        let err = schema
            .decode::<Job>(JOB_TYPE, &serde_json::to_vec(&newer).unwrap())
            .unwrap_err();
        assert!(err.contains("newer"));

        let wrong = json!({ "type": "Box", "version": 1, "data": {} });
        assert!(schema
            .decode::<Job>(JOB_TYPE, &serde_json::to_vec(&wrong).unwrap())
            .is_err());

        assert!(schema.decode::<Job>(JOB_TYPE, b"{ not json").is_err());
    }

    #[test]
    fn failing_migration_is_reported() {
        let schema = SchemaRegistry::standard();
        let broken = json!({
            "type": "Job",
            "version": 1,
            "data": { "id": 1, "application": 5, "backend": "local" }
        });
        let err = schema
            .decode::<Job>(JOB_TYPE, &serde_json::to_vec(&broken).unwrap())
            .unwrap_err();
        assert!(err.contains("migration from version 1 failed"));
    }
}
