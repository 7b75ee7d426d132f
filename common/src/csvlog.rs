use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use sensorlog_model::{normalize_header, Reading, Schema};

use crate::{Error, Result};

/// Append-only CSV file of sensor readings.
///
/// The header is written once, when the file is created or found empty. Every
/// row is flushed and synced to disk before [`CsvLog::append`] returns.
pub struct CsvLog {
    path: PathBuf,
    schema: Schema,
    writer: csv::Writer<File>,
}

impl CsvLog {
    /// Opens `path` for appending, creating it if needed.
    ///
    /// A non-empty file must already start with the header of `schema`,
    /// otherwise rows of different widths would end up in one log.
    pub fn open(path: impl Into<PathBuf>, schema: Schema) -> Result<Self> {
        let path = path.into();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;
        if !is_empty {
            check_header(&path, schema)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        if is_empty {
            writer.write_record(schema.header())?;
            sync(&mut writer)?;
            log::info!("Created {} with header", path.display());
        } else {
            log::info!("Appending to {}", path.display());
        }

        Ok(Self {
            path,
            schema,
            writer,
        })
    }

    /// Writes one reading as a row and makes it durable.
    pub fn append(&mut self, reading: &Reading) -> Result<()> {
        if reading.len() != self.schema.arity() {
            return Err(Error::RowArity {
                expected: self.schema.arity(),
                found: reading.len(),
            });
        }
        self.writer.write_record(reading.fields())?;
        sync(&mut self.writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    /// Current size of the file on disk.
    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.writer.get_ref().metadata()?.len())
    }
}

fn sync(writer: &mut csv::Writer<File>) -> Result<()> {
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(())
}

fn check_header(path: &Path, schema: Schema) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut record = csv::ByteRecord::new();
    let found: Vec<String> = if reader.read_byte_record(&mut record)? {
        record
            .iter()
            .map(|name| normalize_header(&String::from_utf8_lossy(name)))
            .collect()
    } else {
        Vec::new()
    };

    if found.iter().map(String::as_str).eq(schema.header().iter().copied()) {
        Ok(())
    } else {
        Err(Error::SchemaMismatch {
            path: path.to_path_buf(),
            expected: schema.header().iter().map(|h| h.to_string()).collect(),
            found,
        })
    }
}
