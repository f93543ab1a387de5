//! Line-aligned dataset streams.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{DecodeError, Result};

/// Line `index` of every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub index: usize,
    pub source: String,
    pub target: String,
    pub additional: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    /// Read the three streams; missing target or additional streams reuse the source.
    ///
    /// # Errors
    /// Returns an error if a file cannot be read or the line counts differ.
    pub fn load(source: &Path, target: Option<&Path>, additional: Option<&Path>) -> Result<Self> {
        let source_lines = read_lines(source)?;
        let target_lines = target.map(read_lines).transpose()?;
        let additional_lines = additional.map(read_lines).transpose()?;
        Self::from_lines(source_lines, target_lines, additional_lines)
    }

    /// Zip in-memory streams.
    ///
    /// # Errors
    /// Returns [`DecodeError::MisalignedData`] if the line counts differ.
    pub fn from_lines(
        source: Vec<String>,
        target: Option<Vec<String>>,
        additional: Option<Vec<String>>,
    ) -> Result<Self> {
        let target = target.unwrap_or_else(|| source.clone());
        let additional = additional.unwrap_or_else(|| source.clone());
        if target.len() != source.len() || additional.len() != source.len() {
            return Err(DecodeError::MisalignedData {
                source_lines: source.len(),
                target_lines: target.len(),
                additional_lines: additional.len(),
            });
        }
        let examples = source
            .into_iter()
            .zip(target)
            .zip(additional)
            .enumerate()
            .map(|(index, ((source, target), additional))| Example {
                index,
                source,
                target,
                additional,
            })
            .collect();
        Ok(Self { examples })
    }

    #[must_use]
    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let lines = reader
        .lines()
        .map(|line| line.map(|l| l.trim_end_matches('\r').to_string()))
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_missing_streams_default_to_source() {
        let data = Dataset::from_lines(lines(&["a", "b"]), None, None).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.examples()[1].target, "b");
        assert_eq!(data.examples()[1].additional, "b");
        assert_eq!(data.examples()[1].index, 1);
    }

    #[test]
    fn test_misaligned_streams_are_rejected() {
        let err = Dataset::from_lines(lines(&["a", "b"]), Some(lines(&["x"])), None).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MisalignedData { source_lines: 2, target_lines: 1, additional_lines: 2 }
        ));
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        let target = dir.path().join("target.txt");
        writeln!(File::create(&source).unwrap(), "hello\r\nworld").unwrap();
        writeln!(File::create(&target).unwrap(), "HELLO\nWORLD").unwrap();
        let data = Dataset::load(&source, Some(&target), None).unwrap();
        assert_eq!(data.examples()[0].source, "hello");
        assert_eq!(data.examples()[1].target, "WORLD");
        assert!(Dataset::load(&dir.path().join("missing.txt"), None, None).is_err());
    }
}
