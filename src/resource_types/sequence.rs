//! Sequence, JSON and generic validators / 序列、JSON及通用验证器
//!
//! Sequence files are typically too large to parse in full, so they only get
//! an existence and extension check.
//! 序列文件通常太大无法完整解析，因此只检查存在性和扩展名。

use std::path::{Path, PathBuf};

use super::{ResourceMetadata, ResourceValidationError, ResourceValidator};

#[derive(Debug, Clone)]
pub struct SequenceValidator {
    description: String,
    extensions: Vec<String>,
}

impl SequenceValidator {
    pub fn new(description: impl Into<String>, extensions: &[&str]) -> Self {
        Self {
            description: description.into(),
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }
}

impl ResourceValidator for SequenceValidator {
    fn description(&self) -> &str {
        &self.description
    }

    fn validate(&self, path: &Path) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            return Err(ResourceValidationError::Extension {
                path: path.display().to_string(),
                expected: self.extensions.join(", "),
            });
        }
        Ok((ResourceMetadata::default(), path.to_path_buf()))
    }
}

/// JSON document validator / JSON文档验证器
#[derive(Debug, Clone, Copy)]
pub struct JsonValidator;

impl ResourceValidator for JsonValidator {
    fn description(&self) -> &str {
        "JSON document"
    }

    fn validate(&self, path: &Path) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader::<_, serde_json::Value>(std::io::BufReader::new(file)).map_err(
            |e| ResourceValidationError::Format {
                message: format!("invalid JSON: {}", e),
            },
        )?;
        Ok((ResourceMetadata::default(), path.to_path_buf()))
    }
}

/// Generic type accepting any existing file / 接受任意已存在文件的通用类型
#[derive(Debug, Clone, Copy)]
pub struct GenericValidator;

impl ResourceValidator for GenericValidator {
    fn description(&self) -> &str {
        "General file"
    }

    fn validate(&self, path: &Path) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError> {
        Ok((ResourceMetadata::default(), path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastq_extension_check() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("reads_R1.FASTQ.GZ");
        let bad = dir.path().join("reads.txt");
        std::fs::write(&good, b"not really gzip").unwrap();
        std::fs::write(&bad, b"@r1").unwrap();

        let v = SequenceValidator::new("FASTQ", &[".fastq", ".fq", ".fastq.gz", ".fq.gz"]);
        assert!(v.validate(&good).is_ok());
        assert!(matches!(
            v.validate(&bad),
            Err(ResourceValidationError::Extension { .. })
        ));
    }

    #[test]
    fn test_json_validator() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.json");
        let bad = dir.path().join("b.json");
        std::fs::write(&good, br#"{"a": [1, 2]}"#).unwrap();
        std::fs::write(&bad, b"{not json").unwrap();
        assert!(JsonValidator.validate(&good).is_ok());
        assert!(JsonValidator.validate(&bad).is_err());
    }
}
