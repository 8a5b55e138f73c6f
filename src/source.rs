use crate::record::{MerchantRecordView, MerchantUpdateRecord};
use crate::types::SourceError;
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use log::{debug, error};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const FIELDS_PER_LINE: usize = 2;

/// Lazy, fail-fast sequence of update records read from headerless
/// `retailer_id,branch_count` lines.
///
/// Yields at most one error, after which the sequence is exhausted.
/// The reader is owned by the source and released when it is dropped.
pub struct RecordSource<R> {
    records: StringRecordsIntoIter<R>,
    /// Line in the input where the last record started.
    line: u64,
    failed: bool,
}

impl RecordSource<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(target: "source", "Opened {}", path.display());
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> RecordSource<R> {
    pub fn from_reader(input: R) -> Self {
        // Width is checked per record below, so every line is held to two fields.
        let reader = ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(input);

        Self {
            records: reader.into_records(),
            line: 0,
            failed: false,
        }
    }

    fn parse(&self, record: &StringRecord) -> Result<MerchantUpdateRecord, SourceError> {
        if record.len() != FIELDS_PER_LINE {
            return Err(SourceError::FieldCount {
                line: self.line,
                found: record.len(),
            });
        }
        let view: MerchantRecordView = record.deserialize(None)?;
        MerchantUpdateRecord::try_from(view).map_err(|value| SourceError::BranchCountOutOfRange {
            line: self.line,
            value,
        })
    }

    fn fail(&mut self, err: SourceError) -> Option<Result<MerchantUpdateRecord, SourceError>> {
        error!(target: "source", "Stopped reading at line {}: {err}", self.line);
        self.failed = true;
        Some(Err(err))
    }
}

impl<R: Read> Iterator for RecordSource<R> {
    type Item = Result<MerchantUpdateRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(err) => {
                if let Some(position) = err.position() {
                    self.line = position.line();
                }
                return self.fail(err.into());
            }
        };
        if let Some(position) = record.position() {
            self.line = position.line();
        }
        match self.parse(&record) {
            Ok(record) => Some(Ok(record)),
            Err(err) => self.fail(err),
        }
    }
}
