//! Streaming `.tar.gz` export of a mirror's working tree.
//!
//! The mirror is checked out into a disposable temporary directory, which is
//! then walked depth-first and written through a gzip encoder into a bounded
//! channel.  The HTTP layer turns the receiving end into the response body,
//! so the archive is never held in memory as a whole.  The temporary
//! directory is removed when the writer finishes, whether it succeeded, failed
//! or the client hung up.

use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::git::{parse_repository_name, MirrorStore, RepoResult};

/// Chunks produced by the archive writer.
pub type ArchiveStream = ReceiverStream<Result<Bytes, io::Error>>;

const CHANNEL_DEPTH: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

/// Check out `full_name` into a temporary directory and start streaming it
/// as a gzipped tarball.
pub async fn export(store: &dyn MirrorStore, full_name: &str) -> RepoResult<ArchiveStream> {
    export_in(store, full_name, &std::env::temp_dir()).await
}

/// Same as [`export`], with the temporary directory created under `tmp_root`.
#[instrument(skip(store), fields(tmp_root = %tmp_root.display()))]
pub async fn export_in(
    store: &dyn MirrorStore,
    full_name: &str,
    tmp_root: &Path,
) -> RepoResult<ArchiveStream> {
    let tmp = tempfile::Builder::new()
        .prefix("doppelganger-")
        .tempdir_in(tmp_root)
        .context("failed to create temporary checkout directory")?;

    let (_, name) = parse_repository_name(full_name);
    let name = if name.is_empty() { full_name } else { name };
    let checkout = tmp.path().join(name);

    store.checkout(full_name, &checkout).await?;

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let full_name = full_name.to_string();

    tokio::task::spawn_blocking(move || {
        let writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx: tx.clone() });
        match write_tarball(&checkout, writer) {
            Ok(()) => debug!(repo = %full_name, "archive streamed"),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(repo = %full_name, "client went away before the archive was complete");
            }
            Err(e) => {
                warn!(repo = %full_name, error = %e, "failed to write archive");
                let _ = tx.blocking_send(Err(e));
            }
        }
        // Removes the checkout.
        drop(tmp);
    });

    Ok(ReceiverStream::new(rx))
}

/// Write every entry under `root` into a gzipped tarball, with paths
/// relative to `root`.
fn write_tarball<W: Write>(root: &Path, out: W) -> io::Result<()> {
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
        builder.append_path_with_name(entry.path(), rel)?;
    }

    let gz = builder.into_inner()?;
    gz.finish()?.flush()
}

/// Blocking [`Write`] adapter feeding an async channel.
struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::git::{RepoError, Repository};

    /// Checks out a fixed tree for `a/b`; everything else is not mirrored.
    struct TreeStore;

    #[async_trait]
    impl MirrorStore for TreeStore {
        async fn all(&self) -> RepoResult<Vec<Repository>> {
            unreachable!()
        }

        async fn get(&self, _full_name: &str) -> RepoResult<Repository> {
            unreachable!()
        }

        async fn create(&self, _full_name: &str, _git_url: &str) -> RepoResult<()> {
            unreachable!()
        }

        async fn update(&self, _full_name: &str) -> RepoResult<()> {
            unreachable!()
        }

        async fn checkout(&self, full_name: &str, dest: &Path) -> RepoResult<()> {
            if full_name != "a/b" {
                return Err(RepoError::NotMirrored);
            }
            std::fs::create_dir_all(dest.join("src")).unwrap();
            std::fs::write(dest.join("README"), "hello").unwrap();
            std::fs::write(dest.join("src/lib.rs"), "fn main() {}").unwrap();
            Ok(())
        }
    }

    async fn collect(mut stream: ArchiveStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn entries(gz: &[u8]) -> Vec<(PathBuf, String)> {
        let mut archive = tar::Archive::new(GzDecoder::new(gz));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            out.push((path, body));
        }
        out
    }

    #[tokio::test]
    async fn export_streams_relative_entries_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();

        let stream = export_in(&TreeStore, "a/b", tmp.path()).await.unwrap();
        let bytes = collect(stream).await;
        let entries = entries(&bytes);

        let names: Vec<_> = entries.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("README"),
                PathBuf::from("src"),
                PathBuf::from("src/lib.rs"),
            ]
        );
        assert_eq!(entries[0].1, "hello");

        // The writer drops the checkout once the stream is exhausted.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn export_of_unknown_mirror_fails_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();

        let result = export_in(&TreeStore, "x/y", tmp.path()).await;
        assert!(matches!(result, Err(RepoError::NotMirrored)));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn write_tarball_of_empty_directory_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        write_tarball(tmp.path(), &mut out).unwrap();
        assert!(entries(&out).is_empty());
    }
}
