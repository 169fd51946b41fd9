use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CLUBPRINT_DATA_DIR: &str = "/home/clubprint/.local/share/clubprint";
pub const DEFAULT_CLUBPRINT_RUN_DIR: &str = "/var/run/clubprint";

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ClubPrintPaths {
    pub data_dir: PathBuf, // persistent application state, survives upgrades
    pub run_dir: PathBuf,  // runtime dir, cleared after each boot
}

impl Default for ClubPrintPaths {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_CLUBPRINT_DATA_DIR.into(),
            run_dir: DEFAULT_CLUBPRINT_RUN_DIR.into(),
        }
    }
}

impl ClubPrintPaths {
    // sqlite edge database
    pub fn db(&self) -> PathBuf {
        self.data_dir.join("clubprint.db")
    }

    // health snapshot, rewritten every reporting interval; the out-of-process
    // watchdog keys on this file's mtime
    pub fn health_file(&self) -> PathBuf {
        self.run_dir.join("service-health.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let paths = ClubPrintPaths {
            data_dir: "/tmp/data".into(),
            run_dir: "/tmp/run".into(),
        };
        assert_eq!(paths.db(), PathBuf::from("/tmp/data/clubprint.db"));
        assert_eq!(
            paths.health_file(),
            PathBuf::from("/tmp/run/service-health.json")
        );
    }
}
