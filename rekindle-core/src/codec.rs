/*!
Snapshot codecs: local store to a text document and back.

The canonical form is the table snapshot, a JSON object with one array of
records per table plus the reserved `timestamp` and `metadata` keys:

```json
{
  "timestamp": "2024-05-01T08:30:00Z",
  "metadata": { "content_hash": "…", "encoding": "tables", … },
  "vehicles": [ { "id": 1, "plate": "AB123" } ]
}
```

`timestamp` and `metadata` are optional on read. When metadata is present
the content hash must match. It is computed over the table arrays alone,
with tables and record keys in sorted order.

[`RawFileCodec`] is the alternative: the whole database file base64 encoded.
It round-trips anything SQLite can hold but hides the rows from a reader of
the remote blob.
*/

use crate::compression::{compressor_for, CompressionAdapter, GzipCompressor, NoCompression};
use crate::metadata::{SnapshotEncoding, SnapshotMetadata};
use crate::store::{insert_record, select_records, LocalStore, Record, RESERVED_NAMES};
use crate::{RekindleError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

/// Records of one table in primary key order
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    pub name: String,
    pub records: Vec<Record>,
}

/// A full copy of the store's tables at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub created_at: DateTime<Utc>,
    pub tables: Vec<TableRows>,
    pub metadata: Option<SnapshotMetadata>,
}

impl Snapshot {
    pub fn table(&self, name: &str) -> Option<&TableRows> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.records.len()).sum()
    }

    fn payload(&self) -> Map<String, Value> {
        self.tables
            .iter()
            .map(|t| {
                let records = t.records.iter().cloned().map(Value::Object).collect();
                (t.name.clone(), Value::Array(records))
            })
            .collect()
    }

    /// Hash input: tables sorted by name, record keys sorted, compact
    ///
    /// Independent of the key order of the document it was read from.
    fn payload_bytes(&self) -> Result<Vec<u8>> {
        let mut tables: Vec<&TableRows> = self.tables.iter().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        let canonical: Map<String, Value> = tables
            .into_iter()
            .map(|t| {
                let records = t
                    .records
                    .iter()
                    .map(|record| {
                        let mut fields: Vec<_> = record.iter().collect();
                        fields.sort_by(|a, b| a.0.cmp(b.0));
                        Value::Object(
                            fields
                                .into_iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                        )
                    })
                    .collect();
                (t.name.clone(), Value::Array(records))
            })
            .collect();
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Serialize to the snapshot document
    pub fn to_document(&self) -> Result<String> {
        let mut document = Map::new();
        document.insert(
            "timestamp".to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        if let Some(metadata) = &self.metadata {
            document.insert("metadata".to_string(), serde_json::to_value(metadata)?);
        }
        document.extend(self.payload());
        Ok(serde_json::to_string_pretty(&Value::Object(document))?)
    }

    /// Parse a snapshot document.
    ///
    /// A document without `timestamp` gets the Unix epoch as its creation time.
    pub fn from_document(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        let Value::Object(mut document) = document else {
            return Err(RekindleError::invalid_format(
                "snapshot document must be a JSON object",
            ));
        };

        let created_at = match document.shift_remove("timestamp") {
            None | Some(Value::Null) => DateTime::<Utc>::UNIX_EPOCH,
            Some(Value::String(s)) => parse_timestamp(&s)?,
            Some(other) => {
                return Err(RekindleError::codec(format!(
                    "timestamp must be a string, got {other}"
                )))
            }
        };
        let metadata = match document.shift_remove("metadata") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value::<SnapshotMetadata>(value)?),
        };

        let mut tables = Vec::with_capacity(document.len());
        for (name, value) in document {
            let Value::Array(rows) = value else {
                return Err(RekindleError::codec(format!(
                    "table '{name}' must be an array of records"
                )));
            };
            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                match row {
                    Value::Object(record) => records.push(record),
                    other => {
                        return Err(RekindleError::codec(format!(
                            "record in '{name}' must be an object, got {other}"
                        )))
                    }
                }
            }
            tables.push(TableRows { name, records });
        }

        let snapshot = Snapshot {
            created_at,
            tables,
            metadata,
        };
        if let Some(metadata) = &snapshot.metadata {
            metadata.ensure_compatible()?;
            metadata.verify_integrity(&snapshot.payload_bytes()?)?;
        }
        Ok(snapshot)
    }
}

/// Summary of a completed decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeReport {
    pub tables: usize,
    pub rows: usize,
}

/// Converts between the local store and table snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Read every schema table, in schema order, under one store lock
    pub fn encode(store: &LocalStore, at: DateTime<Utc>) -> Result<Snapshot> {
        let schema = store.schema();
        let tables = store.read(|conn| {
            schema
                .tables
                .iter()
                .map(|table| {
                    Ok(TableRows {
                        name: table.name.clone(),
                        records: select_records(conn, table)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut snapshot = Snapshot {
            created_at: at,
            tables,
            metadata: None,
        };
        let payload = snapshot.payload_bytes()?;
        snapshot.metadata = Some(
            SnapshotMetadata::new(SnapshotEncoding::Tables, at, &payload)
                .with_counts(snapshot.tables.len(), snapshot.row_count()),
        );
        debug!(
            tables = snapshot.tables.len(),
            rows = snapshot.row_count(),
            bytes = payload.len(),
            "Encoded table snapshot"
        );
        Ok(snapshot)
    }

    /// Replace the store's contents with the snapshot in one transaction.
    ///
    /// Every schema table is emptied, then each record is written with its
    /// explicit id. Tables missing from the snapshot end up empty. On any
    /// error nothing is applied.
    pub fn decode(snapshot: &Snapshot, store: &LocalStore) -> Result<DecodeReport> {
        let schema = store.schema();
        let mut seen = HashSet::new();
        for table in &snapshot.tables {
            if RESERVED_NAMES.contains(&table.name.as_str()) || schema.table_def(&table.name).is_none() {
                return Err(RekindleError::codec(format!(
                    "snapshot table '{}' is not in the store schema",
                    table.name
                )));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(RekindleError::codec(format!(
                    "snapshot table '{}' appears twice",
                    table.name
                )));
            }
        }

        let report = store.write(|tx| {
            for table in &schema.tables {
                tx.execute(&format!("DELETE FROM \"{}\"", table.name), [])?;
            }
            let mut report = DecodeReport::default();
            for rows in &snapshot.tables {
                let Some(def) = schema.table_def(&rows.name) else {
                    continue;
                };
                for record in &rows.records {
                    insert_record(tx, def, record, true)?;
                }
                report.tables += 1;
                report.rows += rows.records.len();
            }
            Ok(report)
        })?;

        debug!(tables = report.tables, rows = report.rows, "Decoded table snapshot");
        Ok(report)
    }
}

/// Document written by [`RawFileCodec`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub timestamp: String,
    #[serde(alias = "database_base64")]
    pub content_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SnapshotMetadata>,
}

/// Whole-file snapshot codec
pub struct RawFileCodec {
    compressor: Box<dyn CompressionAdapter>,
}

impl std::fmt::Debug for RawFileCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFileCodec")
            .field("compression", &self.compressor.algorithm_name())
            .finish()
    }
}

impl RawFileCodec {
    pub fn new(compress: bool) -> Self {
        let compressor: Box<dyn CompressionAdapter> = if compress {
            Box::new(GzipCompressor::new())
        } else {
            Box::new(NoCompression)
        };
        Self { compressor }
    }

    /// Produce the raw snapshot document for the store
    pub fn encode(&self, store: &LocalStore, at: DateTime<Utc>) -> Result<String> {
        let bytes = store.export_bytes()?;
        let compressed = self.compressor.compress(&bytes)?;
        let algorithm = self.compressor.algorithm_name().to_string();

        let mut metadata = SnapshotMetadata::new(SnapshotEncoding::RawSqlite, at, &bytes)
            .with_counts(store.schema().tables.len(), store.total_rows()?)
            .with_compression_algorithm(algorithm.clone());
        if algorithm != "none" {
            metadata = metadata.with_compressed_size(compressed.len());
        }

        let document = RawSnapshot {
            timestamp: at.to_rfc3339(),
            content_base64: BASE64.encode(&compressed),
            compression: (algorithm != "none").then_some(algorithm),
            metadata: Some(metadata),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Replace the store from a raw snapshot document.
    ///
    /// The payload is staged in a temporary file and integrity-checked
    /// before any row of the live store changes.
    pub fn decode(document: &str, store: &LocalStore) -> Result<usize> {
        let raw: RawSnapshot = serde_json::from_str(document)?;
        let compressed = BASE64
            .decode(raw.content_base64.trim())
            .map_err(|e| RekindleError::codec(format!("invalid base64 payload: {e}")))?;
        let compressor = compressor_for(raw.compression.as_deref().unwrap_or("none"))?;
        let bytes = compressor.decompress(&compressed)?;

        if let Some(metadata) = &raw.metadata {
            metadata.ensure_compatible()?;
            metadata.verify_integrity(&bytes)?;
        }

        let dir = tempfile::tempdir()?;
        let staged = dir.path().join("restore.db");
        std::fs::write(&staged, &bytes)?;
        store.replace_from_file(&staged)
    }
}

/// Parse RFC 3339, falling back to a naive ISO 8601 time taken as UTC
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| RekindleError::codec(format!("invalid timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreSchema;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn seeded_store() -> LocalStore {
        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        store
            .insert("vehicles", &record(json!({"id": 1, "plate": "AB123", "model": "Unimog"})))
            .unwrap();
        store
            .insert("vehicles", &record(json!({"id": 4, "plate": "CD456", "is_active": false})))
            .unwrap();
        store
            .insert("personnel", &record(json!({"full_name": "Rossi Mario", "qualification": null})))
            .unwrap();
        store
    }

    #[test]
    fn test_round_trip_into_empty_store() {
        let source = seeded_store();
        let snapshot = SnapshotCodec::encode(&source, at()).unwrap();
        let document = snapshot.to_document().unwrap();

        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let parsed = Snapshot::from_document(&document).unwrap();
        SnapshotCodec::decode(&parsed, &target).unwrap();

        for table in &StoreSchema::operations().tables {
            assert_eq!(
                source.records(&table.name).unwrap(),
                target.records(&table.name).unwrap(),
                "table {}",
                table.name
            );
        }
        assert_eq!(parsed.created_at, at());
    }

    #[test]
    fn test_encode_is_schema_and_id_ordered() {
        let snapshot = SnapshotCodec::encode(&seeded_store(), at()).unwrap();
        let names: Vec<_> = snapshot.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            ["interventions", "personnel", "vehicles", "users", "access_requests", "admins"]
        );

        let ids: Vec<_> = snapshot.table("vehicles").unwrap().records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, [json!(1), json!(4)]);

        let metadata = snapshot.metadata.as_ref().unwrap();
        assert_eq!(metadata.row_count, 3);
        assert_eq!(metadata.table_count, 6);
        assert_eq!(metadata.encoding, SnapshotEncoding::Tables);
    }

    #[test]
    fn test_bare_document_without_timestamp_or_metadata() {
        let snapshot = Snapshot::from_document(r#"{"vehicles":[{"id":1,"plate":"AB123"}]}"#).unwrap();
        assert_eq!(snapshot.created_at, DateTime::<Utc>::UNIX_EPOCH);
        assert!(snapshot.metadata.is_none());

        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let report = SnapshotCodec::decode(&snapshot, &store).unwrap();
        assert_eq!(report, DecodeReport { tables: 1, rows: 1 });

        let rows = store.records("vehicles").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["plate"], json!("AB123"));
    }

    #[test]
    fn test_decode_twice_is_idempotent() {
        let snapshot = SnapshotCodec::encode(&seeded_store(), at()).unwrap();
        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();

        SnapshotCodec::decode(&snapshot, &store).unwrap();
        let first = store.records("vehicles").unwrap();
        SnapshotCodec::decode(&snapshot, &store).unwrap();

        assert_eq!(first, store.records("vehicles").unwrap());
        assert_eq!(store.total_rows().unwrap(), 3);
    }

    #[test]
    fn test_failed_decode_leaves_store_untouched() {
        let store = seeded_store();
        let before = SnapshotCodec::encode(&store, at()).unwrap();

        // Second record has an unknown column; the first table was already written
        let bad = Snapshot::from_document(
            r#"{"personnel":[{"id":9,"full_name":"New"}],
                "vehicles":[{"id":1,"plate":"ZZ"},{"id":2,"colour":"red"}]}"#,
        )
        .unwrap();
        assert!(SnapshotCodec::decode(&bad, &store).is_err());

        let after = SnapshotCodec::encode(&store, at()).unwrap();
        assert_eq!(before.tables, after.tables);
    }

    #[test]
    fn test_decode_rejects_unknown_table_and_missing_id() {
        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();

        let unknown = Snapshot::from_document(r#"{"ghosts":[{"id":1}]}"#).unwrap();
        assert!(matches!(
            SnapshotCodec::decode(&unknown, &store),
            Err(RekindleError::Codec(_))
        ));

        let no_id = Snapshot::from_document(r#"{"vehicles":[{"plate":"AB123"}]}"#).unwrap();
        assert!(matches!(
            SnapshotCodec::decode(&no_id, &store),
            Err(RekindleError::Codec(_))
        ));
    }

    #[test]
    fn test_written_document_reads_back_in_table_order() {
        let snapshot = SnapshotCodec::encode(&seeded_store(), at()).unwrap();
        let parsed = Snapshot::from_document(&snapshot.to_document().unwrap()).unwrap();

        let names: Vec<_> = parsed.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            ["interventions", "personnel", "vehicles", "users", "access_requests", "admins"]
        );
        assert_eq!(parsed.metadata, snapshot.metadata);
    }

    #[test]
    fn test_integrity_check_ignores_key_order() {
        let snapshot = SnapshotCodec::encode(&seeded_store(), at()).unwrap();
        let document: Value = serde_json::from_str(&snapshot.to_document().unwrap()).unwrap();
        let Value::Object(document) = document else {
            unreachable!()
        };

        // Reserved keys last, tables and record fields reversed
        let mut reordered = Map::new();
        for (name, value) in document.iter().rev() {
            let Value::Array(rows) = value else { continue };
            let rows = rows
                .iter()
                .map(|row| match row {
                    Value::Object(fields) => Value::Object(
                        fields.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    ),
                    other => other.clone(),
                })
                .collect();
            reordered.insert(name.clone(), Value::Array(rows));
        }
        reordered.insert("timestamp".to_string(), document["timestamp"].clone());
        reordered.insert("metadata".to_string(), document["metadata"].clone());

        let parsed = Snapshot::from_document(&Value::Object(reordered).to_string()).unwrap();
        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        assert_eq!(SnapshotCodec::decode(&parsed, &target).unwrap().rows, 3);
        assert_eq!(
            target.records("vehicles").unwrap(),
            seeded_store().records("vehicles").unwrap()
        );
    }

    #[test]
    fn test_tampered_document_fails_integrity() {
        let snapshot = SnapshotCodec::encode(&seeded_store(), at()).unwrap();
        let document = snapshot.to_document().unwrap().replace("AB123", "AB124");
        assert!(matches!(
            Snapshot::from_document(&document),
            Err(RekindleError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(Snapshot::from_document("not json").is_err());
        assert!(Snapshot::from_document("[1, 2]").is_err());
        assert!(Snapshot::from_document(r#"{"vehicles": {"id": 1}}"#).is_err());
        assert!(Snapshot::from_document(r#"{"vehicles": [1]}"#).is_err());
        assert!(Snapshot::from_document(r#"{"timestamp": "yesterday"}"#).is_err());
    }

    #[test]
    fn test_naive_timestamps_are_utc() {
        let parsed = parse_timestamp("2024-05-01T08:30:00.123456").unwrap();
        assert_eq!(parsed.timestamp(), at().timestamp());
    }

    #[test]
    fn test_raw_codec_round_trip_with_compression() {
        let source = seeded_store();
        let document = RawFileCodec::new(true).encode(&source, at()).unwrap();
        let raw: RawSnapshot = serde_json::from_str(&document).unwrap();
        assert_eq!(raw.compression.as_deref(), Some("gzip"));

        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let rows = RawFileCodec::decode(&document, &target).unwrap();

        assert_eq!(rows, 3);
        assert_eq!(source.records("vehicles").unwrap(), target.records("vehicles").unwrap());
    }

    #[test]
    fn test_raw_codec_accepts_legacy_document() {
        let bytes = seeded_store().export_bytes().unwrap();
        let legacy = json!({
            "timestamp": "2024-05-01T08:30:00.000001",
            "database_base64": BASE64.encode(&bytes),
        })
        .to_string();

        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        assert_eq!(RawFileCodec::decode(&legacy, &target).unwrap(), 3);
    }

    #[test]
    fn test_raw_codec_rejects_garbage_payload() {
        let store = seeded_store();
        let garbage = json!({
            "timestamp": "2024-05-01T08:30:00Z",
            "content_base64": BASE64.encode(b"not a database, only bytes, nothing more to see here"),
        })
        .to_string();

        assert!(RawFileCodec::decode(&garbage, &store).is_err());
        assert_eq!(store.total_rows().unwrap(), 3);
    }
}
