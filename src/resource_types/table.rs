//! Table-like resource validation / 表格类资源验证
//!
//! Tables are delimited text files whose first row is a header and whose first
//! column holds row identifiers. Validation infers a primitive type per data
//! column, enforces the shape rules of the concrete table kind and rewrites
//! the file into canonical tab-delimited form.
//! 表格是分隔文本文件：首行为表头，首列为行标识符。验证会推断每列的类型，
//! 检查具体表格类型的形状规则，并将文件重写为规范的制表符分隔格式。

use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{ColumnDefinition, ResourceMetadata, ResourceValidationError, ResourceValidator};
use crate::attributes::{Element, ElementSet};

/// Tokens treated as missing values / 视为缺失值的标记
const MISSING_TOKENS: &[&str] = &["", "NA", "NaN", "nan", "null", "NULL"];

/// Primitive column type, ordered from most to least specific
/// 列的基本类型，从最具体到最不具体排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
}

impl ColumnType {
    fn of_cell(cell: &str) -> Option<ColumnType> {
        if is_missing(cell) {
            return None;
        }
        if cell.parse::<i64>().is_ok() {
            Some(ColumnType::Integer)
        } else if cell.parse::<f64>().is_ok() {
            Some(ColumnType::Float)
        } else if matches!(cell.to_ascii_lowercase().as_str(), "true" | "false") {
            Some(ColumnType::Boolean)
        } else {
            Some(ColumnType::String)
        }
    }

    /// Least general type covering both / 覆盖两者的最小通用类型
    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    fn typed_value(self, cell: &str) -> Value {
        if is_missing(cell) {
            return Value::Null;
        }
        match self {
            ColumnType::Integer => cell.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            ColumnType::Float => cell.parse::<f64>().map(Value::from).unwrap_or(Value::Null),
            ColumnType::Boolean => Value::Bool(cell.eq_ignore_ascii_case("true")),
            ColumnType::String => Value::String(cell.to_string()),
        }
    }
}

/// Requirement on matrix data cells / 矩阵数据单元格的要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRequirement {
    /// Any number; missing values allowed / 任意数字，允许缺失值
    Numeric,
    /// Integers only / 仅整数
    Integer,
    /// Nonnegative integers only / 仅非负整数
    NonnegativeInteger,
}

impl CellRequirement {
    fn check(self, cell: &str) -> bool {
        match self {
            CellRequirement::Numeric => is_missing(cell) || cell.parse::<f64>().is_ok(),
            CellRequirement::Integer => cell.parse::<i64>().is_ok(),
            CellRequirement::NonnegativeInteger => cell.parse::<u64>().is_ok(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            CellRequirement::Numeric => "numeric",
            CellRequirement::Integer => "an integer",
            CellRequirement::NonnegativeInteger => "a nonnegative integer",
        }
    }
}

/// Concrete table layout / 具体表格布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Features in rows, observations in columns / 行为特征、列为观测
    Matrix(CellRequirement),
    /// Observations in rows with annotation columns / 行为观测并带注释列
    Annotation,
    /// Features in rows with annotation columns / 行为特征并带注释列
    FeatureTable,
}

#[derive(Debug, Clone)]
pub struct TableValidator {
    kind: TableKind,
    description: String,
}

impl TableValidator {
    pub fn new(kind: TableKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

fn is_missing(cell: &str) -> bool {
    MISSING_TOKENS.contains(&cell)
}

/// Pick the delimiter from the file extension / 根据文件扩展名选择分隔符
fn delimiter_for(path: &Path) -> Result<u8, ResourceValidationError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(b','),
        "tsv" | "tab" | "txt" => Ok(b'\t'),
        _ => Err(ResourceValidationError::Extension {
            path: path.display().to_string(),
            expected: ".csv, .tsv, .tab, .txt".to_string(),
        }),
    }
}

/// Parsed table: header (with index column) and rows / 解析后的表格
struct ParsedTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    padded_header: bool,
}

fn read_table(path: &Path, delimiter: u8) -> Result<ParsedTable, ResourceValidationError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .map_err(|e| ResourceValidationError::Format {
            message: e.to_string(),
        })?;

    let mut records = reader.records();
    let header: Vec<String> = match records.next() {
        Some(r) => r
            .map_err(|e| ResourceValidationError::Format {
                message: e.to_string(),
            })?
            .iter()
            .map(str::to_string)
            .collect(),
        None => {
            return Err(ResourceValidationError::Format {
                message: format!("'{}' is empty", path.display()),
            })
        }
    };

    let named: Vec<&String> = header.iter().filter(|h| !h.is_empty()).collect();
    if named.is_empty() || named.iter().all(|h| h.parse::<f64>().is_ok()) {
        return Err(ResourceValidationError::MissingHeader {
            path: path.display().to_string(),
            row: header.join(","),
        });
    }

    let mut rows = Vec::new();
    for record in records {
        let record = record.map_err(|e| ResourceValidationError::Format {
            message: e.to_string(),
        })?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    if rows.is_empty() {
        return Err(ResourceValidationError::Format {
            message: format!("'{}' has a header but no rows", path.display()),
        });
    }

    // Header without an index column name (one field short) / 缺少索引列名的表头
    let width = rows[0].len();
    let mut header = header;
    let mut padded_header = false;
    if header.len() + 1 == width {
        header.insert(0, String::new());
        padded_header = true;
    }
    if header.len() < 2 {
        return Err(ResourceValidationError::Format {
            message: "a table needs an identifier column and at least one data column".to_string(),
        });
    }
    for (i, row) in rows.iter().enumerate() {
        if row.len() != header.len() {
            return Err(ResourceValidationError::RaggedRow {
                line: i + 2,
                expected: header.len(),
                found: row.len(),
            });
        }
    }
    Ok(ParsedTable {
        header,
        rows,
        padded_header,
    })
}

fn write_canonical(table: &ParsedTable, target: &Path) -> Result<(), ResourceValidationError> {
    let tmp = target.with_extension("tsv.tmp");
    {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&tmp)
            .map_err(|e| ResourceValidationError::Format {
                message: e.to_string(),
            })?;
        let write_err = |e: csv::Error| ResourceValidationError::Format {
            message: e.to_string(),
        };
        writer.write_record(&table.header).map_err(write_err)?;
        for row in &table.rows {
            writer.write_record(row).map_err(write_err)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, target)?;
    Ok(())
}

/// Tab-delimited path the table is rewritten to. A different file already
/// holding the `.tsv` name is never overwritten; a numbered name is used.
/// 表格重写后的制表符分隔路径；已占用`.tsv`名称的其他文件不会被覆盖，改用带编号的名称。
fn canonical_target(path: &Path) -> Result<PathBuf, ResourceValidationError> {
    let canonical = path.with_extension("tsv");
    if canonical == path || !canonical.exists() {
        return Ok(canonical);
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table")
        .to_string();
    (1..1000)
        .map(|n| path.with_file_name(format!("{}_{}.tsv", stem, n)))
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| ResourceValidationError::Format {
            message: format!("no free name to normalize '{}' to", path.display()),
        })
}

impl ResourceValidator for TableValidator {
    fn description(&self) -> &str {
        &self.description
    }

    fn validate(&self, path: &Path) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError> {
        let delimiter = delimiter_for(path)?;
        let table = read_table(path, delimiter)?;

        let mut seen = HashSet::new();
        for row in &table.rows {
            let id = &row[0];
            if id.is_empty() {
                return Err(ResourceValidationError::Format {
                    message: "empty row identifier".to_string(),
                });
            }
            if !seen.insert(id.as_str()) {
                return Err(ResourceValidationError::DuplicateIdentifier { id: id.clone() });
            }
        }

        let data_columns = &table.header[1..];
        let mut seen_columns = HashSet::new();
        for name in data_columns {
            if name.is_empty() || !seen_columns.insert(name.as_str()) {
                return Err(ResourceValidationError::DuplicateIdentifier { id: name.clone() });
            }
        }
        let mut column_types: Vec<Option<ColumnType>> = vec![None; data_columns.len()];
        for (line, row) in table.rows.iter().enumerate() {
            for (col, cell) in row[1..].iter().enumerate() {
                if let TableKind::Matrix(requirement) = self.kind {
                    if !requirement.check(cell) {
                        return Err(ResourceValidationError::CellType {
                            line: line + 2,
                            column: data_columns[col].clone(),
                            value: cell.clone(),
                            expected: requirement.describe().to_string(),
                        });
                    }
                }
                if let Some(t) = ColumnType::of_cell(cell) {
                    column_types[col] = Some(match column_types[col] {
                        Some(prev) => prev.widen(t),
                        None => t,
                    });
                }
            }
        }
        let columns: Vec<ColumnDefinition> = data_columns
            .iter()
            .zip(column_types.iter())
            .map(|(name, t)| ColumnDefinition {
                name: name.clone(),
                column_type: t.unwrap_or(ColumnType::String),
            })
            .collect();

        let row_elements = || {
            table
                .rows
                .iter()
                .map(|row| {
                    let mut element = Element::new(row[0].clone());
                    for (col, cell) in row[1..].iter().enumerate() {
                        element = element.with_attribute(
                            columns[col].name.clone(),
                            columns[col].column_type.typed_value(cell),
                        );
                    }
                    element
                })
                .collect::<Vec<_>>()
        };

        let metadata = match self.kind {
            TableKind::Matrix(_) => ResourceMetadata {
                observation_set: Some(ElementSet::from_ids(data_columns.iter().cloned())),
                feature_set: Some(ElementSet::from_ids(table.rows.iter().map(|r| r[0].clone()))),
                columns: Vec::new(),
            },
            TableKind::Annotation => ResourceMetadata {
                observation_set: Some(ElementSet {
                    multiple: true,
                    elements: row_elements(),
                }),
                feature_set: None,
                columns,
            },
            TableKind::FeatureTable => ResourceMetadata {
                observation_set: None,
                feature_set: Some(ElementSet {
                    multiple: true,
                    elements: row_elements(),
                }),
                columns,
            },
        };

        let canonical = canonical_target(path)?;
        if canonical != path || table.padded_header {
            write_canonical(&table, &canonical)?;
        }
        Ok((metadata, canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    fn mtx() -> TableValidator {
        TableValidator::new(TableKind::Matrix(CellRequirement::Numeric), "mtx")
    }

    #[test]
    fn test_matrix_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "gene\tS1\tS2\ng1\t1.5\t2\ng2\t0\tNA\n");
        let (meta, out) = mtx().validate(&p).unwrap();
        assert_eq!(out, p);
        assert_eq!(meta.observation_set.unwrap().ids(), vec!["S1", "S2"]);
        assert_eq!(meta.feature_set.unwrap().ids(), vec!["g1", "g2"]);
    }

    #[test]
    fn test_numeric_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "1\t2\t3\ng1\t1\t2\n");
        assert!(matches!(
            mtx().validate(&p),
            Err(ResourceValidationError::MissingHeader { .. })
        ));
    }

    #[test]
    fn test_numeric_looking_but_string_header_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "gene\t1\t2\ng1\t1\t2\n");
        let (meta, _) = mtx().validate(&p).unwrap();
        assert_eq!(meta.observation_set.unwrap().ids(), vec!["1", "2"]);
    }

    #[test]
    fn test_integer_matrix_rejects_float_cells() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "gene\tS1\ng1\t1.5\n");
        let v = TableValidator::new(TableKind::Matrix(CellRequirement::Integer), "imtx");
        match v.validate(&p) {
            Err(ResourceValidationError::CellType { line, column, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(column, "S1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_count_matrix_rejects_negative() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "gene\tS1\ng1\t-3\n");
        let v = TableValidator::new(TableKind::Matrix(CellRequirement::NonnegativeInteger), "cnt");
        assert!(v.validate(&p).is_err());
    }

    #[test]
    fn test_ragged_and_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ragged = write(dir.path(), "r.tsv", "gene\tS1\tS2\ng1\t1\n");
        assert!(matches!(
            mtx().validate(&ragged),
            Err(ResourceValidationError::RaggedRow { .. })
        ));
        let dup = write(dir.path(), "d.tsv", "gene\tS1\ng1\t1\ng1\t2\n");
        assert!(matches!(
            mtx().validate(&dup),
            Err(ResourceValidationError::DuplicateIdentifier { .. })
        ));
    }

    #[test]
    fn test_csv_is_normalized_to_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.csv", "gene,S1,S2\ng1,1,2\n");
        let (_, out) = mtx().validate(&p).unwrap();
        assert_eq!(out, dir.path().join("m.tsv"));
        let content = std::fs::read_to_string(&out).unwrap();
        assert_eq!(content, "gene\tS1\tS2\ng1\t1\t2\n");
    }

    #[test]
    fn test_duplicate_or_blank_column_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dup = write(dir.path(), "d.tsv", "gene\tS1\tS1\ng1\t1\t2\n");
        assert!(matches!(
            mtx().validate(&dup),
            Err(ResourceValidationError::DuplicateIdentifier { id }) if id == "S1"
        ));
        let blank = write(dir.path(), "b.tsv", "gene\tS1\t\ng1\t1\t2\n");
        assert!(matches!(
            mtx().validate(&blank),
            Err(ResourceValidationError::DuplicateIdentifier { id }) if id.is_empty()
        ));
        let ann = TableValidator::new(TableKind::Annotation, "annotations");
        let dup_ann = write(dir.path(), "a.tsv", "sample\tgroup\tgroup\nS1\tA\tB\n");
        assert!(ann.validate(&dup_ann).is_err());
    }

    #[test]
    fn test_normalization_keeps_existing_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let existing = write(dir.path(), "m.tsv", "gene\tS9\ng9\t9\n");
        let p = write(dir.path(), "m.csv", "gene,S1,S2\ng1,1,2\n");
        let (_, out) = mtx().validate(&p).unwrap();
        assert_eq!(out, dir.path().join("m_1.tsv"));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "gene\tS9\ng9\t9\n");
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "gene\tS1\tS2\ng1\t1\t2\n");

        // The normalized copy validates in place
        let (_, again) = mtx().validate(&out).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn test_short_header_padded() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.tsv", "S1\tS2\ng1\t1\t2\n");
        let (meta, out) = mtx().validate(&p).unwrap();
        assert_eq!(meta.observation_set.unwrap().ids(), vec!["S1", "S2"]);
        assert_eq!(std::fs::read_to_string(out).unwrap(), "\tS1\tS2\ng1\t1\t2\n");
    }

    #[test]
    fn test_annotation_types_inferred() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(
            dir.path(),
            "ann.csv",
            "sample,condition,age,score\nA,treated,4,0.5\nB,control,6,1\n",
        );
        let v = TableValidator::new(TableKind::Annotation, "ann");
        let (meta, _) = v.validate(&p).unwrap();
        let types: Vec<ColumnType> = meta.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![ColumnType::String, ColumnType::Integer, ColumnType::Float]
        );
        let obs = meta.observation_set.unwrap();
        assert_eq!(obs.ids(), vec!["A", "B"]);
        assert_eq!(obs.elements[0].attributes["age"], json!(4));
        assert_eq!(obs.elements[1].attributes["score"], json!(1.0));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.xlsx", "gene\tS1\ng1\t1\n");
        assert!(matches!(
            mtx().validate(&p),
            Err(ResourceValidationError::Extension { .. })
        ));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(dir.path(), "m.csv", "gene,S1,S2\ng1,1,2\ng2,3,4\n");
        let first = mtx().validate(&p).unwrap();
        let second = mtx().validate(&p).unwrap();
        assert_eq!(first, second);
    }
}
