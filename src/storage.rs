//! CSV output for sequence results.
//!
//! Rows are any `Serialize` struct; the header comes from its field names.
//! `write_csv_with_metadata` prefixes the file with the run parameters as
//! `# `-commented JSON so a file can be traced back to its configuration.

use crate::error::{DaqError, DaqResult};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<dir>/<prefix>_<YYYYMMDD_HHMMSS>.csv` using local time.
pub fn timestamped_path(dir: impl AsRef<Path>, prefix: &str) -> PathBuf {
    let file_name = format!(
        "{}_{}.csv",
        prefix,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    dir.as_ref().join(file_name)
}

/// Write `rows` to `path`, creating parent directories. Returns the number
/// of rows written.
pub fn write_csv<R: Serialize>(path: impl AsRef<Path>, rows: &[R]) -> DaqResult<usize> {
    let file = create(path.as_ref())?;
    write_rows(path.as_ref(), file, rows)
}

/// Like [`write_csv`], with `metadata` written first as commented JSON.
pub fn write_csv_with_metadata<M: Serialize, R: Serialize>(
    path: impl AsRef<Path>,
    metadata: &M,
    rows: &[R],
) -> DaqResult<usize> {
    let path = path.as_ref();
    let mut file = create(path)?;

    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| DaqError::Storage(format!("Failed to serialize metadata: {}", e)))?;
    for line in json.lines() {
        writeln!(file, "# {}", line).map_err(|e| DaqError::Storage(e.to_string()))?;
    }

    write_rows(path, file, rows)
}

#[cfg(feature = "storage_csv")]
fn write_rows<R: Serialize>(path: &Path, file: File, rows: &[R]) -> DaqResult<usize> {
    let mut writer = csv::Writer::from_writer(file);
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| DaqError::Storage(e.to_string()))?;
    tracing::info!(path = %path.display(), rows = rows.len(), "wrote CSV");
    Ok(rows.len())
}

#[cfg(not(feature = "storage_csv"))]
fn write_rows<R: Serialize>(_path: &Path, _file: File, _rows: &[R]) -> DaqResult<usize> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

fn create(path: &Path) -> DaqResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| DaqError::Storage(e.to_string()))?;
        }
    }
    File::create(path).map_err(|e| {
        DaqError::Storage(format!("Failed to create '{}': {}", path.display(), e))
    })
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Row {
        index: usize,
        resistance_ohm: f64,
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let rows = [
            Row {
                index: 0,
                resistance_ohm: 12.5,
            },
            Row {
                index: 1,
                resistance_ohm: 13.0,
            },
        ];

        assert_eq!(write_csv(&path, &rows).unwrap(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "index,resistance_ohm\n0,12.5\n1,13.0\n");
    }

    #[test]
    fn metadata_is_commented() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let metadata = serde_json::json!({ "current": 0.001 });
        let rows = [Row {
            index: 0,
            resistance_ohm: 1.0,
        }];

        write_csv_with_metadata(&path, &metadata, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("# {"));
        assert!(text.contains("#   \"current\": 0.001"));
        assert!(text.contains("index,resistance_ohm\n0,1.0\n"));
    }

    #[test]
    fn timestamped_names() {
        let path = timestamped_path("data", "four_wire");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("four_wire_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "four_wire_".len() + 15 + 4);
        assert_eq!(path.parent(), Some(Path::new("data")));
    }
}
