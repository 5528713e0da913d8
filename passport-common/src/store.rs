//! The transactions workbook and the adapter that appends rows to it.
//!
//! The workbook is a single JSON document of named sheets, each a list of rows
//! of typed cells. Appending a row is a full read-modify-write of the file, so
//! a `WorkbookStore` must only ever be driven by one writer at a time.
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::record::{header_row, EnrichedRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to parse workbook {path}: {error}")]
    ParseError {
        path: PathBuf,
        error: serde_json::Error,
    },
    #[error("failed to read workbook {path}: {error}")]
    ReadError { path: PathBuf, error: io::Error },
    #[error("failed to write workbook {path}: {error}")]
    WriteError { path: PathBuf, error: io::Error },
    #[error("failed to serialize workbook: {0}")]
    SerializeError(serde_json::Error),
}

/// Persistence for enriched records. Implementations are driven by a single
/// writer, hence `&mut self`.
#[async_trait]
pub trait TabularStore: Send {
    async fn append_row(&mut self, record: &EnrichedRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Value>>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    /// Find the named sheet, creating it with the transactions header if missing.
    pub fn sheet_or_create(&mut self, name: &str) -> &mut Sheet {
        let position = match self.sheets.iter().position(|sheet| sheet.name == name) {
            Some(position) => position,
            None => {
                info!(sheet = name, "creating new worksheet");
                self.sheets.push(Sheet {
                    name: name.to_owned(),
                    rows: vec![header_row()],
                });
                self.sheets.len() - 1
            }
        };
        &mut self.sheets[position]
    }
}

pub struct WorkbookStore {
    path: PathBuf,
    sheet_name: String,
}

impl WorkbookStore {
    pub fn new(path: impl Into<PathBuf>, sheet_name: &str) -> Self {
        Self {
            path: path.into(),
            sheet_name: sheet_name.to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the workbook. `Ok(None)` when the file does not exist.
    pub async fn load(&self) -> Result<Option<Workbook>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(StoreError::ReadError {
                    path: self.path.clone(),
                    error,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|error| StoreError::ParseError {
                path: self.path.clone(),
                error,
            })
    }

    /// Load the workbook, treating an unparseable file as absent. The bad file
    /// is moved aside so its rows can still be recovered by hand.
    async fn load_or_recover(&self) -> Result<Workbook, StoreError> {
        match self.load().await {
            Ok(Some(workbook)) => Ok(workbook),
            Ok(None) => Ok(Workbook::default()),
            Err(StoreError::ParseError { path, error }) => {
                let quarantine = corrupt_path(&path);
                error!(
                    path = %path.display(),
                    quarantine = %quarantine.display(),
                    "workbook is unreadable, starting a new one; \
                     existing rows are no longer in the store: {}",
                    error
                );
                metrics::counter!("passport_store_parse_recoveries_total").increment(1);

                if let Err(error) = tokio::fs::rename(&path, &quarantine).await {
                    warn!(
                        path = %path.display(),
                        "failed to move unreadable workbook aside: {}",
                        error
                    );
                }
                Ok(Workbook::default())
            }
            Err(error) => Err(error),
        }
    }

    /// Replace the workbook on disk, going through a sibling temporary file.
    async fn save(&self, workbook: &Workbook) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(workbook).map_err(StoreError::SerializeError)?;

        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        tokio::fs::write(&temporary, bytes)
            .await
            .map_err(|error| StoreError::WriteError {
                path: temporary.clone(),
                error,
            })?;

        tokio::fs::rename(&temporary, &self.path)
            .await
            .map_err(|error| StoreError::WriteError {
                path: self.path.clone(),
                error,
            })
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    let mut quarantine = path.as_os_str().to_owned();
    quarantine.push(format!(".corrupt-{}", millis));
    PathBuf::from(quarantine)
}

#[async_trait]
impl TabularStore for WorkbookStore {
    #[instrument(skip_all, fields(imei = %record.imei_number))]
    async fn append_row(&mut self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let mut workbook = self.load_or_recover().await?;

        let sheet = workbook.sheet_or_create(&self.sheet_name);
        if sheet.rows.first() != Some(&header_row()) {
            warn!(
                sheet = %sheet.name,
                "worksheet header does not match the transactions columns, appending anyway"
            );
        }
        sheet.rows.push(record.to_row());

        self.save(&workbook).await
    }
}
