use std::path::Path;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::error::DataLoadError;
use crate::types::{ClassLabel, LabelScheme};

/// マニフェストの列名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestColumns {
    pub slide_id: String,
    pub tile_id: String,
    pub label: String,
}

impl Default for ManifestColumns {
    fn default() -> Self {
        Self {
            slide_id: "subject_id".to_string(),
            tile_id: "slice_id".to_string(),
            label: "label".to_string(),
        }
    }
}

/// マニフェストの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub slide_id: String,
    pub tile_id: String,
    pub label: ClassLabel,
}

fn column_position(
    headers: &csv::StringRecord,
    name: &str,
    path: &Path,
) -> Result<usize, DataLoadError> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| DataLoadError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

/// マニフェストCSVを読み込む
///
/// 余分な列（インデックス列など）は無視します。行番号はヘッダを除いた1始まりです。
pub fn load_manifest(
    path: &Path,
    columns: &ManifestColumns,
    labels: &LabelScheme,
) -> Result<Vec<ManifestRow>, DataLoadError> {
    let file = std::fs::File::open(path).map_err(|source| DataLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = reader.headers()?.clone();
    let slide_col = column_position(&headers, &columns.slide_id, path)?;
    let tile_col = column_position(&headers, &columns.tile_id, path)?;
    let label_col = column_position(&headers, &columns.label, path)?;

    let mut rows = Vec::new();

    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let row = i + 1;

        let field = |col: usize| record.get(col).unwrap_or("").trim().to_string();

        let raw_label = field(label_col);
        let label = labels
            .parse(&raw_label)
            .ok_or_else(|| DataLoadError::UnknownLabel {
                row,
                value: raw_label.clone(),
                positive: labels.positive.clone(),
                negative: labels.negative.clone(),
            })?;

        rows.push(ManifestRow {
            slide_id: field(slide_col),
            tile_id: field(tile_col),
            label,
        });
    }

    if rows.is_empty() {
        return Err(DataLoadError::Empty(path.to_path_buf()));
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("manifest.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_manifest_with_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            ",subject_id,slice_id,label\n0,P1,t1,MSI\n1,P1,t2,MSI\n2,P2,t9,MSS\n",
        );

        let rows = load_manifest(&path, &ManifestColumns::default(), &LabelScheme::default()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].slide_id, "P1");
        assert_eq!(rows[2].tile_id, "t9");
        assert_eq!(rows[2].label, ClassLabel::Negative);
    }

    #[test]
    fn test_unknown_label_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "subject_id,slice_id,label\nP1,t1,MSI\nP1,t2,???\n");

        let err = load_manifest(&path, &ManifestColumns::default(), &LabelScheme::default()).unwrap_err();
        match err {
            DataLoadError::UnknownLabel { row, value, .. } => {
                assert_eq!(row, 2);
                assert_eq!(value, "???");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file_and_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.csv");
        assert!(matches!(
            load_manifest(&missing, &ManifestColumns::default(), &LabelScheme::default()),
            Err(DataLoadError::Io { .. })
        ));

        let empty = write_manifest(dir.path(), "subject_id,slice_id,label\n");
        assert!(matches!(
            load_manifest(&empty, &ManifestColumns::default(), &LabelScheme::default()),
            Err(DataLoadError::Empty(_))
        ));
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "subject_id,label\nP1,MSI\n");

        let err = load_manifest(&path, &ManifestColumns::default(), &LabelScheme::default()).unwrap_err();
        assert!(matches!(err, DataLoadError::MissingColumn { ref column, .. } if column == "slice_id"));
    }
}
