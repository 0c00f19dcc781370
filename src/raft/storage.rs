//! On-disk raft state under `<meta folder>/raft`.
//!
//! The whole [`HardState`] is rewritten on every change through a temporary
//! file and a rename, so a crash leaves either the old or the new state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{MasterError, Result};
use crate::raft::state::HardState;

const RAFT_DIR: &str = "raft";
const STATE_FILE: &str = "state.json";

#[derive(Debug)]
pub struct RaftStorage {
    dir: PathBuf,
}

impl RaftStorage {
    /// Open (or create) the raft directory and load any saved state.
    ///
    /// A fresh directory gets an empty state written immediately so that an
    /// unusable folder is reported here rather than at the first election.
    pub fn open(meta_folder: &Path) -> Result<(Self, HardState)> {
        let dir = meta_folder.join(RAFT_DIR);
        let init_err = |reason: String| MasterError::RaftInit {
            path: meta_folder.to_path_buf(),
            reason,
        };

        fs::create_dir_all(&dir)
            .map_err(|e| init_err(format!("cannot create {}: {}", dir.display(), e)))?;

        let storage = Self { dir };
        let state_path = storage.state_path();

        let hard = if state_path.exists() {
            let bytes = fs::read(&state_path)
                .map_err(|e| init_err(format!("cannot read {}: {}", state_path.display(), e)))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| init_err(format!("corrupt {}: {}", state_path.display(), e)))?
        } else {
            let hard = HardState::default();
            storage
                .save(&hard)
                .map_err(|e| init_err(format!("cannot write {}: {}", state_path.display(), e)))?;
            hard
        };

        tracing::debug!(
            dir = %storage.dir.display(),
            term = hard.current_term,
            log_len = hard.log.len(),
            "Opened raft storage"
        );

        Ok((storage, hard))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn save(&self, hard: &HardState) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(hard)?;
        let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.state_path())
    }
}
