//! CSV reading and writing for count matrices, cell metadata, gene pairs and result tables

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;

use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::Serialize;

use crate::data::{CellMetadata, CountMatrix};
use crate::error::{MementoError, Result};

/// On-disk format of result tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = MementoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(MementoError::config(format!(
                "Unknown output format '{}' (expected csv or json)",
                other
            ))),
        }
    }
}

/// Tab when the header line contains one, comma otherwise
fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    if header.trim().is_empty() {
        return Err(MementoError::EmptyData {
            reason: "Empty CSV file".to_string(),
        });
    }
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

fn reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<File>> {
    let delimiter = detect_delimiter(&path)?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?)
}

/// Read a dense count matrix
///
/// Expected format: one row per cell, first column is the cell ID, the header
/// holds the gene IDs. Zeros are not stored.
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let mut rdr = reader(&path)?;
    let header = rdr.headers()?.clone();
    if header.len() < 2 {
        return Err(MementoError::InvalidCountMatrix {
            reason: "Not enough columns in header".to_string(),
        });
    }
    let gene_ids: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let n_genes = gene_ids.len();

    let mut cell_ids = Vec::new();
    let mut entries: Vec<(usize, usize, f64)> = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        if record.len() != n_genes + 1 {
            return Err(MementoError::InvalidCountMatrix {
                reason: format!("Row {} has {} columns, expected {}", row + 1, record.len(), n_genes + 1),
            });
        }
        cell_ids.push(record[0].to_string());
        for (j, field) in record.iter().skip(1).enumerate() {
            let value: f64 = field.parse().map_err(|_| MementoError::InvalidCountMatrix {
                reason: format!("Invalid count value '{}' for cell '{}'", field, &record[0]),
            })?;
            if value != 0.0 {
                entries.push((row, j, value));
            }
        }
    }

    if cell_ids.is_empty() {
        return Err(MementoError::EmptyData {
            reason: "No cells found in count matrix".to_string(),
        });
    }

    let mut coo = CooMatrix::new(cell_ids.len(), n_genes);
    for (i, j, v) in entries {
        coo.push(i, j, v);
    }
    log::info!("Read {} cells x {} genes", cell_ids.len(), n_genes);
    CountMatrix::new(CscMatrix::from(&coo), gene_ids, cell_ids)
}

/// Read per-cell metadata
///
/// Expected format: first column is the cell ID, remaining columns are
/// labels. Every column is available as a categorical label; columns whose
/// values all parse as numbers are also stored as numeric columns.
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<CellMetadata> {
    let mut rdr = reader(&path)?;
    let header = rdr.headers()?.clone();
    let names: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut cell_ids = Vec::new();
    let mut columns: Vec<Vec<String>> = vec![Vec::new(); names.len()];
    for record in rdr.records() {
        let record = record?;
        if record.len() != names.len() + 1 {
            return Err(MementoError::InvalidMetadata {
                reason: format!("Row has {} columns, expected {}", record.len(), names.len() + 1),
            });
        }
        cell_ids.push(record[0].to_string());
        for (column, field) in columns.iter_mut().zip(record.iter().skip(1)) {
            column.push(field.to_string());
        }
    }

    if cell_ids.is_empty() {
        return Err(MementoError::EmptyData {
            reason: "No cells found in metadata".to_string(),
        });
    }

    let mut metadata = CellMetadata::new(cell_ids);
    for (name, values) in names.iter().zip(columns) {
        let numeric: Option<Vec<f64>> = values.iter().map(|v| v.parse::<f64>().ok()).collect();
        if let Some(numeric) = numeric {
            metadata.add_continuous(name, numeric)?;
        }
        metadata.add_condition(name, values)?;
    }
    Ok(metadata)
}

/// Read gene pairs, one pair per row after a header line
pub fn read_gene_pairs<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>> {
    let mut rdr = reader(&path)?;
    let mut pairs = Vec::new();
    for record in rdr.records() {
        let record = record?;
        if record.len() < 2 {
            return Err(MementoError::config(format!(
                "Gene pair row has {} columns, expected 2",
                record.len()
            )));
        }
        pairs.push((record[0].to_string(), record[1].to_string()));
    }
    Ok(pairs)
}

/// Write serializable rows as CSV (with header) or a JSON array
pub fn write_table<P: AsRef<Path>, T: Serialize>(path: P, rows: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_path(path)?;
            for row in rows {
                wtr.serialize(row)?;
            }
            wtr.flush()?;
        }
        OutputFormat::Json => {
            let mut file = File::create(path)?;
            serde_json::to_writer_pretty(&mut file, rows)?;
            writeln!(file)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::OneDResult;
    use crate::testing::TestStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_count_matrix() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cell,g1,g2,g3").unwrap();
        writeln!(file, "c1,0,2,1").unwrap();
        writeln!(file, "c2,3,0,0").unwrap();

        let matrix = read_count_matrix(file.path()).unwrap();
        assert_eq!(matrix.n_cells(), 2);
        assert_eq!(matrix.n_genes(), 3);
        assert_eq!(matrix.gene_column(0), (&[1usize][..], &[3.0][..]));
        assert_eq!(matrix.cell_ids(), &["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn test_read_count_matrix_rejects_bad_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cell\tg1").unwrap();
        writeln!(file, "c1\tabc").unwrap();
        assert!(matches!(
            read_count_matrix(file.path()),
            Err(MementoError::InvalidCountMatrix { .. })
        ));
    }

    #[test]
    fn test_read_metadata_detects_numeric_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cell,stim,q").unwrap();
        writeln!(file, "c1,ctrl,0.1").unwrap();
        writeln!(file, "c2,stim,0.2").unwrap();

        let meta = read_metadata(file.path()).unwrap();
        assert_eq!(meta.n_cells(), 2);
        assert_eq!(meta.condition("stim").unwrap(), &vec!["ctrl".to_string(), "stim".to_string()]);
        assert_eq!(meta.continuous("q").unwrap(), &vec![0.1, 0.2]);
        assert!(meta.continuous("stim").is_none());
        assert!(meta.condition("q").is_some());
    }

    #[test]
    fn test_read_gene_pairs() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "gene_1,gene_2").unwrap();
        writeln!(file, "A,B").unwrap();
        writeln!(file, "B,C").unwrap();
        let pairs = read_gene_pairs(file.path()).unwrap();
        assert_eq!(pairs, vec![("A".into(), "B".into()), ("B".into(), "C".into())]);
    }

    #[test]
    fn test_write_table_csv_and_json() {
        let rows = vec![OneDResult {
            gene: "A".into(),
            de_coef: 0.5,
            de_pval: 0.01,
            dv_coef: f64::NAN,
            dv_pval: f64::NAN,
            de_status: TestStatus::AslComputed,
            dv_status: TestStatus::AslComputed,
        }];

        let csv_file = NamedTempFile::new().unwrap();
        write_table(csv_file.path(), &rows, OutputFormat::Csv).unwrap();
        let text = std::fs::read_to_string(csv_file.path()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "gene,de_coef,de_pval,dv_coef,dv_pval,de_status,dv_status");
        assert_eq!(lines.next().unwrap(), "A,0.5,0.01,NaN,NaN,asl_computed,asl_computed");

        let json_file = NamedTempFile::new().unwrap();
        write_table(json_file.path(), &rows, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(json_file.path()).unwrap()).unwrap();
        assert_eq!(value[0]["gene"], "A");
        assert_eq!(value[0]["de_pval"], 0.01);
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("tsv".parse::<OutputFormat>().unwrap_err().is_configuration());
    }
}
