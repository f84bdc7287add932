//! File-backed session store: one JSON file per match.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{SessionStore, StoreError};
use crate::core::MatchId;

/// Session store keeping `<dir>/<match_id>.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the match files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, match_id: MatchId) -> PathBuf {
        self.dir.join(format!("{}.json", match_id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, match_id: MatchId) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(match_id)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, match_id: MatchId, blob: &[u8]) -> Result<(), StoreError> {
        // Readers never see a half-written file.
        let path = self.path_for(match_id);
        let tmp = self.dir.join(format!("{}.json.tmp", match_id));
        fs::write(&tmp, blob).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
