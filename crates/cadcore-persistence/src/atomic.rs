use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Replace `path` with `contents` so readers see either the old file or the
/// complete new one.
pub(crate) fn replace_file(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    persist_file(dir, path, contents)?;
    sync_dir(dir)
}

/// Rename a synced temp file holding `contents` over `path` and return an
/// open read-write handle to it. The rename is not durable until
/// [`sync_dir`] runs.
pub(crate) fn persist_file(dir: &Path, path: &Path, contents: &[u8]) -> io::Result<File> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)
}

/// Make a rename or removal inside `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Run blocking file work off the async workers.
///
/// The work runs to completion even if the returned future is dropped.
pub(crate) async fn blocking<T, E, F>(work: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<io::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}
