//! Genome list files: one FASTA path per line, `#` comments and blanks ignored.

use crate::error::{KmxError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Ordered genome paths; position in the list is the matrix row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomeList {
    source: PathBuf,
    genomes: Vec<PathBuf>,
}

impl GenomeList {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| KmxError::io_error(format!("Could not read genome list file '{}': {}", path.display(), e)))?;
        Self::from_reader(BufReader::new(file), path)
    }

    pub fn from_reader<R: BufRead>(reader: R, source: &Path) -> Result<Self> {
        let mut genomes = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            genomes.push(PathBuf::from(entry));
        }

        if genomes.is_empty() {
            return Err(KmxError::EmptyGenomeList(source.to_path_buf()));
        }

        Ok(Self {
            source: source.to_path_buf(),
            genomes,
        })
    }

    /// The list file itself, handed to the oracle for the combined count
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn genomes(&self) -> &[PathBuf] {
        &self.genomes
    }

    pub fn len(&self) -> usize {
        self.genomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genomes.is_empty()
    }

    /// Upper occurrence bound used when none is given: half the genome count, at least 1
    pub fn default_max_count(&self) -> u64 {
        (self.genomes.len() as u64 / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_skips_comments_and_blanks() {
        let content = "# header\n/data/a.fa\n\n  /data/b.fa  \n#/data/c.fa\n";
        let list = GenomeList::from_reader(Cursor::new(content), Path::new("list.txt")).unwrap();
        assert_eq!(list.genomes(), &[PathBuf::from("/data/a.fa"), PathBuf::from("/data/b.fa")]);
        assert_eq!(list.source(), Path::new("list.txt"));
    }

    #[test]
    fn test_default_max_count() {
        let one = GenomeList::from_reader(Cursor::new("a.fa\n"), Path::new("l")).unwrap();
        assert_eq!(one.default_max_count(), 1);

        let five = GenomeList::from_reader(Cursor::new("a\nb\nc\nd\ne\n"), Path::new("l")).unwrap();
        assert_eq!(five.default_max_count(), 2);
    }

    #[test]
    fn test_empty_list_rejected() {
        let err = GenomeList::from_reader(Cursor::new("# nothing\n\n"), Path::new("l")).unwrap_err();
        assert!(matches!(err, KmxError::EmptyGenomeList(_)));
    }
}
