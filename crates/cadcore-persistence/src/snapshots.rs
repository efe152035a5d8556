use async_trait::async_trait;
use cadcore::{SequenceNumber, Snapshot, SnapshotReadError, SnapshotStore, SnapshotWriteError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::atomic::{blocking, replace_file, sync_dir};

const PREFIX: &str = "snapshot-";
const SUFFIX: &str = ".json";

#[derive(Serialize)]
struct SnapshotRef<'a, S> {
    state: &'a S,
    sequence: SequenceNumber,
}

fn file_name(sequence: SequenceNumber) -> String {
    format!("{PREFIX}{:020}{SUFFIX}", sequence.value())
}

fn parse_file_name(name: &str) -> Option<SequenceNumber> {
    let digits = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    SequenceNumber::new(digits.parse().ok()?).ok()
}

/// Snapshot files in `dir`, sorted by sequence, oldest first.
fn list(dir: &Path) -> io::Result<Vec<(SequenceNumber, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(sequence) = entry.file_name().to_str().and_then(parse_file_name) {
            found.push((sequence, entry.path()));
        }
    }
    found.sort_by_key(|(sequence, _)| *sequence);
    Ok(found)
}

/// A [`SnapshotStore`] keeping one JSON file per snapshot.
pub struct FileSnapshotStore<S> {
    dir: PathBuf,
    _state: PhantomData<fn() -> S>,
}

impl<S> FileSnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            _state: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequences of the snapshot files on disk, oldest first.
    pub async fn sequences(&self) -> io::Result<Vec<SequenceNumber>> {
        let dir = self.dir.clone();
        let found = blocking(move || list(&dir)).await?;
        Ok(found.into_iter().map(|(sequence, _)| sequence).collect())
    }
}

#[async_trait]
impl<S> SnapshotStore<S> for FileSnapshotStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create_snapshot(
        &self,
        state: &S,
        up_to: SequenceNumber,
    ) -> Result<(), SnapshotWriteError> {
        let contents = serde_json::to_vec(&SnapshotRef {
            state,
            sequence: up_to,
        })?;
        let bytes = contents.len();
        let dir = self.dir.clone();
        let path = dir.join(file_name(up_to));
        blocking(move || replace_file(&dir, &path, &contents)).await?;
        info!(sequence = %up_to, bytes, "snapshot durable");
        Ok(())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot<S>>, SnapshotReadError> {
        let dir = self.dir.clone();
        let found = blocking(move || list(&dir)).await?;
        if found.is_empty() {
            return Ok(None);
        }

        for (sequence, path) in found.iter().rev() {
            let bytes = tokio::fs::read(path).await?;
            match serde_json::from_slice::<Snapshot<S>>(&bytes) {
                Ok(snapshot) if snapshot.sequence() == *sequence => {
                    debug!(%sequence, "snapshot loaded");
                    return Ok(Some(snapshot));
                }
                Ok(snapshot) => warn!(
                    path = %path.display(),
                    recorded = %snapshot.sequence(),
                    "snapshot sequence does not match its file name, skipping"
                ),
                Err(err) => warn!(
                    path = %path.display(),
                    error = %err,
                    "unreadable snapshot, trying an older one"
                ),
            }
        }

        Err(SnapshotReadError::Invalid {
            reason: format!(
                "none of {} snapshot files in {} is readable",
                found.len(),
                self.dir.display()
            ),
        })
    }

    async fn purge_older_snapshots(
        &self,
        keep_after: SequenceNumber,
    ) -> Result<usize, SnapshotWriteError> {
        let dir = self.dir.clone();
        let removed = blocking(move || {
            let mut removed = 0;
            for (sequence, path) in list(&dir)? {
                if sequence.is_before(keep_after) {
                    std::fs::remove_file(path)?;
                    removed += 1;
                }
            }
            if removed > 0 {
                sync_dir(&dir)?;
            }
            Ok::<_, io::Error>(removed)
        })
        .await?;
        if removed > 0 {
            info!(removed, %keep_after, "older snapshots purged");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    type State = BTreeMap<String, u32>;

    fn seq(value: u64) -> SequenceNumber {
        SequenceNumber::new(value).unwrap()
    }

    fn state(entries: &[(&str, u32)]) -> State {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn file_names_sort_by_sequence() {
        assert_eq!(file_name(seq(42)), "snapshot-00000000000000000042.json");
        assert_eq!(parse_file_name(&file_name(seq(42))), Some(seq(42)));
        assert_eq!(parse_file_name("snapshot-42.json"), None);
        assert_eq!(parse_file_name(".tmpAbc123"), None);
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::<State>::open(dir.path()).await.unwrap();
        assert!(store.load_latest_snapshot().await.unwrap().is_none());

        store.create_snapshot(&state(&[("a", 1)]), seq(5)).await.unwrap();
        store.create_snapshot(&state(&[("a", 2)]), seq(12)).await.unwrap();

        let latest = store.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.sequence(), seq(12));
        assert_eq!(latest.state(), &state(&[("a", 2)]));
    }

    #[tokio::test]
    async fn corrupt_newest_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::<State>::open(dir.path()).await.unwrap();
        store.create_snapshot(&state(&[("a", 1)]), seq(5)).await.unwrap();
        std::fs::write(dir.path().join(file_name(seq(9))), b"{\"state\":").unwrap();

        let latest = store.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.sequence(), seq(5));
    }

    #[tokio::test]
    async fn only_unreadable_snapshots_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::<State>::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join(file_name(seq(9))), b"garbage").unwrap();

        let err = store.load_latest_snapshot().await.unwrap_err();
        assert!(matches!(err, SnapshotReadError::Invalid { .. }));
    }

    #[tokio::test]
    async fn purge_removes_strictly_older_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::<State>::open(dir.path()).await.unwrap();
        for value in [3, 6, 9] {
            store.create_snapshot(&State::new(), seq(value)).await.unwrap();
        }

        assert_eq!(store.purge_older_snapshots(seq(6)).await.unwrap(), 1);
        assert_eq!(store.sequences().await.unwrap(), vec![seq(6), seq(9)]);
        assert_eq!(store.purge_older_snapshots(seq(6)).await.unwrap(), 0);
    }
}
