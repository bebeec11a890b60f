use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use polars::prelude::*;
use tracing::{debug, info, trace};

use crate::domain::FdError;

/// The two backing collections a record can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTag {
    Hospital,
    Clinic,
}

impl SourceTag {
    pub const ALL: [SourceTag; 2] = [SourceTag::Hospital, SourceTag::Clinic];

    pub fn collection(&self) -> &'static str {
        match self {
            SourceTag::Hospital => "hospital_patients",
            SourceTag::Clinic => "clinic_patients",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceTag::Hospital => "Hospital",
            SourceTag::Clinic => "Clinic",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub source: SourceTag,
    pub admission_code: String,
    pub patient_name: String,
    pub surgery_date: Option<NaiveDate>,
    pub status: String,
    pub collection: String,
}

impl Record {
    /// Text shown in the given table column. Column filters match against this.
    pub fn column_text(&self, column: usize) -> String {
        match column {
            0 => self.source.label().to_string(),
            1 => self.admission_code.clone(),
            2 => self.patient_name.clone(),
            3 => self
                .surgery_date
                .map(|d| d.format("%d/%m/%Y").to_string())
                .unwrap_or_default(),
            4 => self.status.clone(),
            _ => String::new(),
        }
    }

    /// Object store prefix holding this record's files.
    pub fn folder(&self) -> String {
        format!("{}/{}/", self.collection, self.admission_code)
    }
}

/// A document as returned by the record store, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub id: String,
    pub admission_code: Option<String>,
    pub patient_name: Option<String>,
    pub surgery_date: Option<String>,
    pub status: Option<String>,
}

pub trait RecordStore: Send + Sync {
    /// All documents of `collection` owned by `owner_id`.
    fn query(&self, collection: &str, owner_id: &str) -> Result<Vec<RawRecord>, FdError>;
}

/// Accepts ISO dates and the day-first format used by the clinic's exports.
pub fn parse_surgery_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
}

fn normalize(raw: RawRecord, source: SourceTag) -> Record {
    let surgery_date = raw.surgery_date.as_deref().and_then(parse_surgery_date);
    Record {
        admission_code: raw.admission_code.unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        source,
        patient_name: raw.patient_name.unwrap_or_default(),
        surgery_date,
        status: raw.status.unwrap_or_default(),
        collection: source.collection().to_string(),
    }
}

/// Fetch the records of `owner_id` from both collections and tag them with their source.
///
/// Both queries run in parallel and are joined before anything is returned, so a failure
/// in either collection yields no partial result.
pub fn load_records(store: &dyn RecordStore, owner_id: &str) -> Result<Vec<Record>, FdError> {
    let start_time = Instant::now();
    let (hospital, clinic) = rayon::join(
        || store.query(SourceTag::Hospital.collection(), owner_id),
        || store.query(SourceTag::Clinic.collection(), owner_id),
    );

    let mut records = Vec::new();
    for (source, raw) in [(SourceTag::Hospital, hospital?), (SourceTag::Clinic, clinic?)] {
        records.extend(raw.into_iter().map(|r| normalize(r, source)));
    }
    info!(
        "Loaded {} records for {} in {}ms",
        records.len(),
        owner_id,
        start_time.elapsed().as_millis()
    );
    Ok(records)
}

/// Record store reading one CSV file per collection from a directory.
///
/// Every collection file carries an `owner_id` column; all other columns are optional.
#[derive(Debug)]
pub struct CsvRecordStore {
    dir: PathBuf,
}

impl CsvRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.csv"))
    }

    fn scan(path: &Path) -> Result<LazyFrame, PolarsError> {
        LazyCsvReader::new(PlPath::Local(path.into()))
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .finish()
    }

    fn string_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<String>>>, PolarsError> {
        let Ok(column) = df.column(name) else {
            return Ok(None);
        };
        let values = column
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string).filter(|s| !s.is_empty()))
            .collect();
        Ok(Some(values))
    }
}

impl RecordStore for CsvRecordStore {
    fn query(&self, collection: &str, owner_id: &str) -> Result<Vec<RawRecord>, FdError> {
        let path = self.collection_path(collection);
        if !path.is_file() {
            debug!("Collection {} has no file at {:?}", collection, path);
            return Ok(Vec::new());
        }

        let df = Self::scan(&path)
            .and_then(|lf| lf.filter(col("owner_id").eq(lit(owner_id))).collect())
            .map_err(|e| FdError::Data(format!("query on {collection} failed: {e}")))?;
        trace!("Collection {} returned {} rows", collection, df.height());

        let nrows = df.height();
        let ids = Self::string_column(&df, "id")?.unwrap_or_else(|| vec![None; nrows]);
        let admission = Self::string_column(&df, "admission_code")?;
        let names = Self::string_column(&df, "patient_name")?;
        let dates = Self::string_column(&df, "surgery_date")?;
        let status = Self::string_column(&df, "status")?;

        let pick = |values: &Option<Vec<Option<String>>>, idx: usize| {
            values.as_ref().and_then(|v| v[idx].clone())
        };

        Ok((0..nrows)
            .map(|idx| RawRecord {
                id: ids[idx]
                    .clone()
                    .unwrap_or_else(|| format!("{collection}-{}", idx + 1)),
                admission_code: pick(&admission, idx),
                patient_name: pick(&names, idx),
                surgery_date: pick(&dates, idx),
                status: pick(&status, idx),
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    /// In-memory store keyed by collection name.
    #[derive(Default)]
    pub(crate) struct MemoryRecordStore {
        pub collections: HashMap<String, Vec<(String, RawRecord)>>,
        pub fail: bool,
    }

    impl RecordStore for MemoryRecordStore {
        fn query(&self, collection: &str, owner_id: &str) -> Result<Vec<RawRecord>, FdError> {
            if self.fail {
                return Err(FdError::Data("backend unavailable".into()));
            }
            Ok(self
                .collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|(owner, _)| owner == owner_id)
                        .map(|(_, r)| r.clone())
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    pub(crate) fn record(name: &str, date: Option<&str>, status: &str) -> Record {
        Record {
            id: name.to_lowercase(),
            source: SourceTag::Hospital,
            admission_code: format!("ADM-{}", name.len()),
            patient_name: name.to_string(),
            surgery_date: date.and_then(parse_surgery_date),
            status: status.to_string(),
            collection: SourceTag::Hospital.collection().to_string(),
        }
    }

    #[test]
    fn parses_both_date_formats() {
        assert_eq!(
            parse_surgery_date("2025-08-15"),
            NaiveDate::from_ymd_opt(2025, 8, 15)
        );
        assert_eq!(
            parse_surgery_date("15/08/2025"),
            NaiveDate::from_ymd_opt(2025, 8, 15)
        );
        assert_eq!(parse_surgery_date(""), None);
        assert_eq!(parse_surgery_date("soon"), None);
        assert_eq!(parse_surgery_date("2025-13-01"), None);
    }

    #[test]
    fn load_tags_and_normalizes() {
        let mut store = MemoryRecordStore::default();
        store.collections.insert(
            "hospital_patients".into(),
            vec![(
                "u1".into(),
                RawRecord {
                    id: "a".into(),
                    admission_code: Some("ADM001".into()),
                    ..Default::default()
                },
            )],
        );
        store.collections.insert(
            "clinic_patients".into(),
            vec![
                (
                    "u1".into(),
                    RawRecord {
                        id: "b".into(),
                        patient_name: Some("Juan Pérez".into()),
                        surgery_date: Some("2025-08-15".into()),
                        status: Some("Done".into()),
                        ..Default::default()
                    },
                ),
                ("u2".into(), RawRecord { id: "c".into(), ..Default::default() }),
            ],
        );

        let records = load_records(&store, "u1").unwrap();
        assert_eq!(records.len(), 2);

        let a = &records[0];
        assert_eq!(a.source, SourceTag::Hospital);
        assert_eq!(a.surgery_date, None);
        assert_eq!(a.patient_name, "");
        assert_eq!(a.status, "");

        let b = &records[1];
        assert_eq!(b.source, SourceTag::Clinic);
        assert_eq!(b.collection, "clinic_patients");
        assert_eq!(b.admission_code, "b");
        assert_eq!(b.column_text(3), "15/08/2025");
    }

    #[test]
    fn load_failure_is_data_error() {
        let store = MemoryRecordStore { fail: true, ..Default::default() };
        assert!(matches!(load_records(&store, "u1"), Err(FdError::Data(_))));
    }

    #[test]
    fn csv_store_filters_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hospital_patients.csv"),
            "id,owner_id,admission_code,patient_name,surgery_date,status\n\
             1,u1,ADM001,Juan Pérez,15/08/2025,Scheduled\n\
             2,u2,ADM002,María Gómez,16/08/2025,Done\n\
             3,u1,ADM003,Carlos López,,\n",
        )
        .unwrap();

        let store = CsvRecordStore::new(dir.path());
        let raw = store.query("hospital_patients", "u1").unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].patient_name.as_deref(), Some("Juan Pérez"));
        assert_eq!(raw[1].surgery_date, None);
        assert_eq!(raw[1].status, None);

        // A collection without a file is simply empty.
        assert!(store.query("clinic_patients", "u1").unwrap().is_empty());
    }
}
