//! In-memory result tables and their CSV persistence.
//!
//! Values are kept as the text the profiler wrote; numeric interpretation
//! happens only where a computation needs it.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Table I/O and shape errors.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("{}: no header row", path.display())]
    Empty { path: PathBuf },

    #[error("{}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("row {row} has {found} fields, header has {expected}")]
    RowLength {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("column {name} has {found} values, table has {expected} rows")]
    ColumnLength {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// A header plus rows of equal width.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, rejecting rows whose width differs from the header.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != headers.len() {
                return Err(TableError::RowLength {
                    row: i,
                    expected: headers.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Values of column `idx`, one per row.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &str> {
        self.rows.iter().map(move |row| row[idx].as_str())
    }

    /// Values of the named column, if present.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        self.column_index(name)
            .map(|idx| self.column_values(idx).collect())
    }

    /// Append a column at the end.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) -> Result<(), TableError> {
        if values.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                name: name.to_string(),
                expected: self.rows.len(),
                found: values.len(),
            });
        }
        self.headers.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Replace the values of column `idx` in place.
    pub fn set_column(&mut self, idx: usize, values: Vec<String>) -> Result<(), TableError> {
        if values.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                name: self.headers[idx].clone(),
                expected: self.rows.len(),
                found: values.len(),
            });
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
        Ok(())
    }

    /// Keep only the columns whose name satisfies `keep`, preserving order.
    pub fn retain_columns(&mut self, mut keep: impl FnMut(&str) -> bool) {
        let mask: Vec<bool> = self.headers.iter().map(|h| keep(h.as_str())).collect();
        if mask.iter().all(|k| *k) {
            return;
        }

        let filter = |values: &mut Vec<String>| {
            let mut it = mask.iter();
            values.retain(|_| *it.next().unwrap_or(&true));
        };
        filter(&mut self.headers);
        for row in &mut self.rows {
            filter(row);
        }
    }

    /// Drop the named columns; absent names are ignored.
    pub fn drop_columns(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.retain_columns(|h| !names.iter().any(|n| n == h));
    }

    /// Parse CSV with a header row.
    ///
    /// In strict mode a row of the wrong width is an error; otherwise such
    /// rows are skipped.
    pub fn from_reader<R: Read>(reader: R, path: &Path, strict: bool) -> Result<Self, TableError> {
        let csv_err = |source| TableError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() {
            return Err(TableError::Empty {
                path: path.to_path_buf(),
            });
        }

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for (i, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_err)?;
            if record.len() != headers.len() {
                if strict {
                    return Err(TableError::RowLength {
                        row: i,
                        expected: headers.len(),
                        found: record.len(),
                    });
                }
                skipped += 1;
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        if skipped > 0 {
            debug!(path = %path.display(), skipped, "skipped malformed rows");
        }

        Ok(Self { headers, rows })
    }

    /// Read a CSV file; see [`Table::from_reader`].
    pub fn read_csv(path: &Path, strict: bool) -> Result<Self, TableError> {
        let file = File::open(path).map_err(|source| TableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(io::BufReader::new(file), path, strict)
    }

    /// Serialize as CSV.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<W, csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
    }

    /// Write to `path` via a temporary sibling that is fsynced and then
    /// renamed into place, so a crash never leaves a partial file at `path`.
    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        let io_err = |source| TableError::Io {
            path: path.to_path_buf(),
            source,
        };

        let tmp = tmp_path(path);
        let file = File::create(&tmp).map_err(io_err)?;
        let file = self.to_writer(file).map_err(|source| TableError::Csv {
            path: tmp.clone(),
            source,
        })?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, path).map_err(io_err)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![
                vec!["1".into(), "2".into(), "3".into()],
                vec!["4".into(), "5".into(), "6".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = Table::new(vec!["a".into()], vec![vec!["1".into(), "2".into()]]).unwrap_err();
        assert!(matches!(err, TableError::RowLength { row: 0, .. }));
    }

    #[test]
    fn test_column_access() {
        let table = sample();
        assert_eq!(table.column("b").unwrap(), ["2", "5"]);
        assert!(table.column("z").is_none());
        assert_eq!(table.column_index("c"), Some(2));
    }

    #[test]
    fn test_retain_and_drop_columns() {
        let mut table = sample();
        table.drop_columns(&["b".to_string(), "missing".to_string()]);
        assert_eq!(table.headers(), ["a", "c"]);
        assert_eq!(table.rows()[1], ["4", "6"]);
    }

    #[test]
    fn test_push_column_checks_length() {
        let mut table = sample();
        assert!(table.push_column("d", vec!["x".into()]).is_err());
        table.push_column("d", vec!["x".into(), "y".into()]).unwrap();
        assert_eq!(table.column("d").unwrap(), ["x", "y"]);
    }

    #[test]
    fn test_lenient_read_skips_bad_rows() {
        let data = "a,b\n1,2\n3\n4,5\n";
        let path = Path::new("mem.csv");
        let table = Table::from_reader(data.as_bytes(), path, false).unwrap();
        assert_eq!(table.len(), 2);
        assert!(Table::from_reader(data.as_bytes(), path, true).is_err());
    }

    #[test]
    fn test_empty_input() {
        let err = Table::from_reader("".as_bytes(), Path::new("e.csv"), true).unwrap_err();
        assert!(matches!(err, TableError::Empty { .. }));
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let table = Table::new(
            vec!["Name".into(), "v".into()],
            vec![vec!["foo<int, float>(int)".into(), "1".into()]],
        )
        .unwrap();

        table.write_csv(&path).unwrap();

        assert!(!dir.path().join("out.csv.tmp").exists());
        assert_eq!(Table::read_csv(&path, true).unwrap(), table);
    }
}
