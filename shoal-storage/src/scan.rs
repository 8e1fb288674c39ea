use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use crate::layout::FileSpec;
use crate::{Error, Result};

const READ_BUF_BYTES: usize = 65536;

#[derive(Clone, Debug, Default)]
pub struct ScanProgress {
    pub position: u64,
    pub length: u64,
}

/// Hash a set of slot extents with a small worker pool. Read-only; used by
/// the untrusted-resume startup path before any mutation begins.
pub async fn hash_slots(
    root: &Path,
    files: &[FileSpec],
    work: Vec<(u32, u64, usize)>,
    progress: Option<watch::Sender<ScanProgress>>,
) -> Result<Vec<(u32, [u8; 32])>> {
    let length: u64 = work.iter().map(|(_, _, extent)| *extent as u64).sum();
    if work.is_empty() {
        return Ok(vec![]);
    }
    let n_workers = num_cpus::get().min(work.len()).max(1);
    debug!(slots = work.len(), n_workers, "hashing preallocated slots");

    let (work_tx, work_rx) = flume::unbounded();
    for item in work {
        work_tx.send(item)?;
    }
    drop(work_tx);
    let (done_tx, done_rx) = flume::unbounded();

    let mut tasks = JoinSet::new();
    for _ in 0..n_workers {
        let work_rx = work_rx.clone();
        let done_tx = done_tx.clone();
        let root = root.to_path_buf();
        let files = files.to_vec();
        tasks.spawn(async move {
            let mut reader = SlotReader::new(root, &files);
            while let Ok((slot, offset, extent)) = work_rx.recv_async().await {
                let digest = reader.digest(offset, extent).await?;
                if done_tx.send_async((slot, extent, digest)).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        });
    }
    drop(done_tx);

    let mut out = Vec::new();
    let mut position = 0u64;
    while let Ok((slot, extent, digest)) = done_rx.recv_async().await {
        position += extent as u64;
        if let Some(tx) = &progress {
            tx.send_replace(ScanProgress { position, length });
        }
        out.push((slot, digest));
    }
    while let Some(res) = tasks.join_next().await {
        res??;
    }
    out.sort_by_key(|(slot, _)| *slot);
    Ok(out)
}

/// Read-only view over the file set, opened lazily per worker.
struct SlotReader {
    root: PathBuf,
    spans: Vec<(u64, FileSpec, Option<File>)>,
}

impl SlotReader {
    fn new(root: PathBuf, files: &[FileSpec]) -> SlotReader {
        let mut spans = Vec::with_capacity(files.len());
        let mut start = 0u64;
        for spec in files {
            spans.push((start, spec.clone(), None));
            start += spec.length;
        }
        SlotReader { root, spans }
    }

    async fn digest(&mut self, offset: u64, extent: usize) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_BUF_BYTES.min(extent)];
        let mut pos = 0usize;
        while pos < extent {
            let take = buf.len().min(extent - pos);
            self.read_at(offset + pos as u64, &mut buf[..take]).await?;
            hasher.update(&buf[..take]);
            pos += take;
        }
        Ok(hasher.finalize().into())
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        let mut pos = offset;
        for (start, spec, file) in &mut self.spans {
            let span_end = *start + spec.length;
            if pos >= span_end || pos >= end {
                continue;
            }
            let take = (end.min(span_end) - pos) as usize;
            let dst = &mut buf[(pos - offset) as usize..(pos - offset) as usize + take];
            if file.is_none() {
                *file = Some(File::open(self.root.join(&spec.path)).await?);
            }
            let fh = file.as_mut().unwrap();
            fh.seek(SeekFrom::Start(pos - *start)).await?;
            let mut filled = 0usize;
            while filled < dst.len() {
                let rd = fh.read(&mut dst[filled..]).await?;
                if rd == 0 {
                    for b in dst[filled..].iter_mut() {
                        *b = 0;
                    }
                    break;
                }
                filled += rd;
            }
            pos += take as u64;
        }
        Ok(())
    }
}
