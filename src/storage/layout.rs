use std::fs;
use std::path::PathBuf;

use crate::core::error::Result;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf, // Root directory
    pub log_dir: PathBuf,  // Append-only record logs, one file per generation
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let log_dir = base_dir.join("log");

        fs::create_dir_all(&log_dir)?;

        Ok(StorageLayout { base_dir, log_dir })
    }

    pub fn log_path(&self, generation: u64) -> PathBuf {
        self.log_dir.join(format!("records_{:08}.dat", generation))
    }

    /// Find all log generations on disk, sorted ascending.
    /// Filename format: records_00000000.dat
    pub fn find_generations(&self) -> Result<Vec<u64>> {
        let mut generations = Vec::new();

        if self.log_dir.exists() {
            for entry in fs::read_dir(&self.log_dir)? {
                let entry = entry?;
                let path = entry.path();

                if path.extension().and_then(|s| s.to_str()) == Some("dat") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if let Some(gen_str) = stem.strip_prefix("records_") {
                            if let Ok(gen) = gen_str.parse::<u64>() {
                                generations.push(gen);
                            }
                        }
                    }
                }
            }
        }

        generations.sort();
        Ok(generations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        assert!(layout.log_dir.exists());
        assert!(layout
            .log_path(3)
            .to_string_lossy()
            .ends_with("records_00000003.dat"));
    }

    #[test]
    fn test_find_generations_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        std::fs::write(layout.log_path(2), b"").unwrap();
        std::fs::write(layout.log_path(0), b"").unwrap();
        std::fs::write(layout.log_dir.join("notes.txt"), b"").unwrap();

        assert_eq!(layout.find_generations().unwrap(), vec![0, 2]);
    }
}
