//! Parquet snapshot of the active corpus for the market-analytics side.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jobscope_core::JobRecord;
use jobscope_storage::{ArtifactStore, KnowledgeStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::normalize::technology_category;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub jobs: usize,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `jobs.parquet`, `technologies.parquet` and `manifest.json` into `out_dir`.
pub async fn export_corpus(store: &KnowledgeStore, out_dir: &Path) -> Result<PathBuf> {
    let records = store
        .active_records()
        .await
        .context("loading active corpus")?;
    let manifest_path = write_snapshot(&records, out_dir)?;
    info!(
        jobs = records.len(),
        manifest = %manifest_path.display(),
        "corpus exported"
    );
    Ok(manifest_path)
}

pub fn write_snapshot(records: &[JobRecord], out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let jobs_path = out_dir.join("jobs.parquet");
    let technologies_path = out_dir.join("technologies.parquet");
    write_jobs_parquet(&jobs_path, records)?;
    write_technologies_parquet(&technologies_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        jobs: records.len(),
        files: vec![
            manifest_entry("jobs", out_dir, &jobs_path)?,
            manifest_entry("technologies", out_dir, &technologies_path)?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a, F>(records: &'a [JobRecord], field: F) -> StringArray
where
    F: Fn(&'a JobRecord) -> Option<&'a str>,
{
    StringArray::from(records.iter().map(field).collect::<Vec<_>>())
}

fn write_jobs_parquet(path: &Path, records: &[JobRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("remote_type", DataType::Utf8, false),
        ArrowField::new("experience_level", DataType::Utf8, false),
        ArrowField::new("contract_type", DataType::Utf8, false),
        ArrowField::new("salary_min", DataType::UInt32, true),
        ArrowField::new("salary_max", DataType::UInt32, true),
        ArrowField::new("quality_score", DataType::Float64, false),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("collected_at", DataType::Utf8, false),
    ]));

    let bounds = records
        .iter()
        .map(|r| r.salary.as_ref().and_then(|s| s.bounds()))
        .collect::<Vec<_>>();
    let collected_at = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.collected_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(records, |r| Some(r.fingerprint.as_str()))),
            Arc::new(strings(records, |r| Some(r.source_id.as_str()))),
            Arc::new(strings(records, |r| Some(r.title.as_str()))),
            Arc::new(strings(records, |r| Some(r.company.as_str()))),
            Arc::new(strings(records, |r| Some(r.location.as_str()))),
            Arc::new(strings(records, |r| Some(r.remote_type.as_str()))),
            Arc::new(strings(records, |r| Some(r.experience_level.as_str()))),
            Arc::new(strings(records, |r| Some(r.contract_type.as_str()))),
            Arc::new(UInt32Array::from(
                bounds.iter().map(|b| b.map(|(min, _)| min)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                bounds.iter().map(|b| b.map(|(_, max)| max)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.quality_score).collect::<Vec<_>>(),
            )),
            Arc::new(strings(records, |r| r.url.as_deref())),
            Arc::new(collected_at),
        ],
    )
    .context("building jobs record batch")?;
    write_parquet(path, batch)
}

fn write_technologies_parquet(path: &Path, records: &[JobRecord]) -> Result<()> {
    let rows = records
        .iter()
        .flat_map(|r| {
            r.technologies
                .iter()
                .map(move |tech| (r.fingerprint.as_str(), tech.as_str()))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("technology", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, true),
    ]));
    let fingerprints = StringArray::from(rows.iter().map(|(f, _)| Some(*f)).collect::<Vec<_>>());
    let technologies = StringArray::from(rows.iter().map(|(_, t)| Some(*t)).collect::<Vec<_>>());
    let categories = StringArray::from(
        rows.iter()
            .map(|(_, t)| {
                technology_category(t)
                    .and_then(|c| serde_json::to_value(c).ok())
                    .and_then(|v| v.as_str().map(str::to_string))
            })
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(fingerprints),
            Arc::new(technologies),
            Arc::new(categories),
        ],
    )
    .context("building technologies record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: ArtifactStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::normalized;

    #[tokio::test]
    async fn exports_active_corpus_with_checksummed_manifest() {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        let kept = normalized("wttj", "Data Engineer", "Qonto", "Python, Spark. Salaire: 45k€ - 55k€");
        let retired = normalized("indeed", "Data Analyst", "Alan", "SQL");
        store.store(&kept).await.expect("store");
        store.store(&retired).await.expect("store");
        store
            .set_active(&retired.fingerprint, false)
            .await
            .expect("retire");

        let dir = tempfile::tempdir().expect("tempdir");
        let manifest_path = export_corpus(&store, dir.path()).await.expect("export");
        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("json");

        assert_eq!(manifest.jobs, 1);
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).expect("parquet");
            assert_eq!(bytes.len() as u64, file.bytes);
            assert_eq!(ArtifactStore::sha256_hex(&bytes), file.sha256);
            assert_eq!(&bytes[..4], b"PAR1");
        }
    }

    #[test]
    fn empty_corpus_still_writes_valid_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest_path = write_snapshot(&[], dir.path()).expect("snapshot");
        assert!(manifest_path.is_file());
        assert!(dir.path().join("jobs.parquet").is_file());
    }
}
