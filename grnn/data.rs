//! # Dataset Loading
//!
//! Reads the training table (a header row followed by comma-separated decimal rows) from
//! a storage stream and packs it into a dense, bounded `TrainingMatrix`.
//!
//! - Bounded memory: the stream is pulled through a scratch buffer whose size comes from
//!   the configuration, never from the dataset.
//! - Pull-style rows: `RowSource` hands out one parsed row at a time. There is no shared
//!   state between the parser and the matrix builder.
//! - Shape is checked, content is not: every row must have the same column count, and
//!   both rows and columns are capped by the configuration. A numeric field that does not
//!   parse reads as 0 unless `strict_numbers` is set.

use crate::config::EngineConfig;
use crate::error::{GrnnError, ParseError};
use crate::storage::{OpenMode, Storage, StorageError, StreamHandle, StreamReader};
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2, s};
use std::io::Read;

/// The in-memory training table. The last column is the label.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMatrix {
    values: Array2<f64>,
}

impl TrainingMatrix {
    /// Builds a matrix from owned rows. Used by tests and by artifact recovery.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ParseError> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(ParseError::RaggedRow {
                    line: i as u64 + 1,
                    found: row.len(),
                    expected: cols,
                });
            }
            data.extend_from_slice(row);
        }
        Self::from_flat(rows.len(), cols, data)
    }

    fn from_flat(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, ParseError> {
        Array2::from_shape_vec((rows, cols), data)
            .map(|values| Self { values })
            .map_err(|e| ParseError::Malformed(e.to_string()))
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    /// Column count including the label column.
    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn n_features(&self) -> usize {
        self.ncols().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.nrows() == 0
    }

    /// The full row, label included.
    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.values.row(i)
    }

    pub fn features(&self, i: usize) -> ArrayView1<'_, f64> {
        self.values.slice(s![i, ..self.n_features()])
    }

    pub fn label(&self, i: usize) -> f64 {
        self.values[[i, self.n_features()]]
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

/// A single-pass, pull-style sequence of numeric rows read from delimited text.
///
/// The header record is consumed and discarded on the first pull. Restarting means
/// reopening the underlying stream.
pub struct RowSource<R: Read> {
    reader: csv::Reader<R>,
    record: csv::ByteRecord,
    row: Vec<f64>,
    line: u64,
    strict_numbers: bool,
}

impl<R: Read> RowSource<R> {
    pub fn new(input: R, buffer_bytes: usize, strict_numbers: bool) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .buffer_capacity(buffer_bytes.max(1))
            .from_reader(input);
        Self {
            reader,
            record: csv::ByteRecord::new(),
            row: Vec::new(),
            line: 0,
            strict_numbers,
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.reader.get_mut()
    }

    /// Pulls the next row together with its line number in the source text.
    pub fn next_row(&mut self) -> Result<Option<(u64, &[f64])>, RowError> {
        if !self.reader.read_byte_record(&mut self.record)? {
            return Ok(None);
        }
        self.line = self.record.position().map_or(self.line + 1, |p| p.line());

        self.row.clear();
        for (column, field) in self.record.iter().enumerate() {
            let value = if self.strict_numbers {
                lexical_core::parse::<f64>(field).map_err(|_| ParseError::InvalidNumber {
                    line: self.line,
                    column: column + 1,
                    token: String::from_utf8_lossy(field).into_owned(),
                })?
            } else {
                // Same leniency as strtod: take the longest numeric prefix, 0 if there is none.
                lexical_core::parse_partial::<f64>(field).map_or(0.0, |(value, _)| value)
            };
            self.row.push(value);
        }
        Ok(Some((self.line, &self.row)))
    }
}

/// Why a row could not be pulled.
#[derive(Debug)]
pub enum RowError {
    Csv(csv::Error),
    Parse(ParseError),
}

impl From<csv::Error> for RowError {
    fn from(e: csv::Error) -> Self {
        RowError::Csv(e)
    }
}

impl From<ParseError> for RowError {
    fn from(e: ParseError) -> Self {
        RowError::Parse(e)
    }
}

/// Accumulates rows into a flat buffer while enforcing the configured capacity.
struct MatrixBuilder {
    max_rows: usize,
    max_cols: usize,
    cols: Option<usize>,
    rows: usize,
    data: Vec<f64>,
}

impl MatrixBuilder {
    fn new(config: &EngineConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            max_cols: config.max_cols,
            cols: None,
            rows: 0,
            data: Vec::new(),
        }
    }

    fn push_row(&mut self, row: &[f64], line: u64) -> Result<(), GrnnError> {
        if row.len() > self.max_cols {
            return Err(ParseError::TooManyColumns {
                line,
                found: row.len(),
                capacity: self.max_cols,
            }
            .into());
        }
        match self.cols {
            Some(expected) if expected != row.len() => {
                return Err(ParseError::RaggedRow {
                    line,
                    found: row.len(),
                    expected,
                }
                .into());
            }
            Some(_) => {}
            None => {
                self.cols = Some(row.len());
                self.data.reserve(self.max_rows * row.len());
            }
        }
        if self.rows == self.max_rows {
            return Err(GrnnError::ResourceExhausted {
                capacity: self.max_rows,
            });
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    fn finish(self) -> Result<TrainingMatrix, GrnnError> {
        let cols = self.cols.unwrap_or(0);
        Ok(TrainingMatrix::from_flat(self.rows, cols, self.data)?)
    }
}

/// Loads the dataset stream `dataset_id` into a bounded training matrix.
///
/// A read error aborts the load; there is no retry.
pub fn load_training_matrix<S: Storage + ?Sized>(
    storage: &S,
    dataset_id: &str,
    config: &EngineConfig,
) -> Result<TrainingMatrix, GrnnError> {
    info!("Loading dataset '{dataset_id}'");
    let mut handle = storage.open(dataset_id, OpenMode::Read)?;
    let loaded = read_rows(handle.as_mut(), config);
    let closed = handle.close();
    let matrix = loaded?;
    closed?;
    info!(
        "Loaded {} rows x {} columns from '{dataset_id}'",
        matrix.nrows(),
        matrix.ncols()
    );
    Ok(matrix)
}

fn read_rows(handle: &mut dyn StreamHandle, config: &EngineConfig) -> Result<TrainingMatrix, GrnnError> {
    let mut reader = StreamReader::new(handle);
    let stream = reader.stream_name().to_string();
    let mut source = RowSource::new(&mut reader, config.read_buffer_bytes, config.strict_numbers);
    let mut builder = MatrixBuilder::new(config);

    loop {
        match source.next_row() {
            Ok(Some((line, row))) => builder.push_row(row, line)?,
            Ok(None) => break,
            Err(RowError::Parse(e)) => return Err(e.into()),
            Err(RowError::Csv(e)) => {
                let failure = source.get_mut().take_failure();
                return Err(csv_failure(e, failure, stream));
            }
        }
    }

    debug!("Dataset stream '{stream}' exhausted after {} rows", builder.rows);
    builder.finish()
}

/// Recovers the typed storage error hidden behind a csv I/O error, if there is one.
fn csv_failure(error: csv::Error, failure: Option<StorageError>, stream: String) -> GrnnError {
    if let Some(storage_error) = failure {
        return storage_error.into();
    }
    match error.into_kind() {
        csv::ErrorKind::Io(source) => StorageError::Io { stream, source }.into(),
        other => ParseError::Malformed(format!("{other:?}")).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use approx::assert_abs_diff_eq;

    fn storage_with(name: &str, content: &str) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.insert(name, content.as_bytes().to_vec());
        storage
    }

    #[test]
    fn header_is_discarded_and_rows_are_dense() {
        let storage = storage_with("d.csv", "x,y\n1.0,10.0\n2.0,20.0\n3.0,30.0\n");
        let m = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap();
        assert_eq!(m.nrows(), 3);
        assert_eq!(m.ncols(), 2);
        assert_eq!(m.n_features(), 1);
        assert_abs_diff_eq!(m.label(2), 30.0);
        assert_abs_diff_eq!(m.features(1)[0], 2.0);
    }

    #[test]
    fn tolerates_crlf_and_whitespace() {
        let storage = storage_with("d.csv", "a, b ,c\r\n 1.5 ,2,3\r\n4, 5 ,6\r\n");
        let m = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap();
        assert_eq!(m.view().shape(), &[2, 3]);
        assert_abs_diff_eq!(m.row(0)[0], 1.5);
        assert_abs_diff_eq!(m.row(1)[1], 5.0);
    }

    #[test]
    fn unparseable_token_reads_as_zero_by_default() {
        let storage = storage_with("d.csv", "a,b\nabc,1\n7.5kg,2\n");
        let m = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap();
        assert_abs_diff_eq!(m.row(0)[0], 0.0);
        assert_abs_diff_eq!(m.row(1)[0], 7.5);
    }

    #[test]
    fn strict_mode_rejects_unparseable_token() {
        let storage = storage_with("d.csv", "a,b\n1,2\nabc,1\n");
        let config = EngineConfig {
            strict_numbers: true,
            ..EngineConfig::default()
        };
        let err = load_training_matrix(&storage, "d.csv", &config).unwrap_err();
        match err {
            GrnnError::Parse(ParseError::InvalidNumber { line, column, token }) => {
                assert_eq!(line, 3);
                assert_eq!(column, 1);
                assert_eq!(token, "abc");
            }
            other => panic!("Expected InvalidNumber, got {other:?}"),
        }
    }

    #[test]
    fn ragged_row_is_a_parse_error() {
        let storage = storage_with("d.csv", "a,b\n1,2\n3,4,5\n");
        let err = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            GrnnError::Parse(ParseError::RaggedRow {
                found: 3,
                expected: 2,
                ..
            })
        ));
    }

    #[test]
    fn too_many_columns_is_a_parse_error() {
        let storage = storage_with("d.csv", "a,b,c,d\n1,2,3,4\n");
        let config = EngineConfig {
            max_cols: 3,
            ..EngineConfig::default()
        };
        let err = load_training_matrix(&storage, "d.csv", &config).unwrap_err();
        assert!(matches!(
            err,
            GrnnError::Parse(ParseError::TooManyColumns {
                found: 4,
                capacity: 3,
                ..
            })
        ));
    }

    #[test]
    fn row_overflow_is_resource_exhausted() {
        let storage = storage_with("d.csv", "a,b\n1,1\n2,2\n3,3\n");
        let config = EngineConfig {
            max_rows: 2,
            ..EngineConfig::default()
        };
        let err = load_training_matrix(&storage, "d.csv", &config).unwrap_err();
        assert!(matches!(err, GrnnError::ResourceExhausted { capacity: 2 }));
    }

    #[test]
    fn small_read_buffer_gives_same_matrix() {
        let content = "a,b,c\n0.125,2,3\n4,5.5,6\n7,8,9.75\n";
        let storage = storage_with("d.csv", content);
        let config = EngineConfig {
            read_buffer_bytes: 3,
            ..EngineConfig::default()
        };
        let small = load_training_matrix(&storage, "d.csv", &config).unwrap();
        let large = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap();
        assert_eq!(small, large);
    }

    #[test]
    fn header_only_yields_empty_matrix() {
        let storage = storage_with("d.csv", "a,b\n");
        let m = load_training_matrix(&storage, "d.csv", &EngineConfig::default()).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn missing_dataset_is_a_storage_error() {
        let storage = MemoryStorage::new();
        let err = load_training_matrix(&storage, "absent.csv", &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, GrnnError::Storage(StorageError::NotFound(_))));
    }

    #[test]
    fn read_fault_aborts_with_the_typed_storage_error() {
        let content = "x,y\n1.0,10.0\n2.0,20.0\n3.0,30.0\n";
        for (budget, buffer) in [(0, 40960), (6, 4)] {
            let storage = MemoryStorage::new().with_read_fault_after(budget);
            storage.insert("d.csv", content.as_bytes().to_vec());
            let config = EngineConfig {
                read_buffer_bytes: buffer,
                ..EngineConfig::default()
            };
            let err = load_training_matrix(&storage, "d.csv", &config).unwrap_err();
            assert!(
                matches!(err, GrnnError::Storage(StorageError::Io { ref stream, .. }) if stream == "d.csv"),
                "unexpected error: {err:?}"
            );
        }
    }
}
