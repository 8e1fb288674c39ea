use std::io::SeekFrom;
use std::path::Path;

use anyhow::Context;
use tokio::fs::{create_dir_all, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

use crate::layout::FileSpec;
use crate::Result;

struct Span {
    spec: FileSpec,
    start: u64,
    /// Bytes present when the set was opened; allocation state is judged
    /// against this, not the current length.
    preexisting: u64,
    file: File,
}

/// Positional reads and writes across the ordered file set, addressed by
/// payload offset. Reads past a file's current end are zero-filled; writes
/// extend files sparsely.
pub struct FileSet {
    spans: Vec<Span>,
    total_length: u64,
}

impl FileSet {
    /// Open the file set under `root`, creating missing files and parent
    /// directories. Pre-open lengths are recorded for preallocation checks.
    pub async fn create(root: &Path, files: &[FileSpec]) -> Result<FileSet> {
        let mut spans = Vec::with_capacity(files.len());
        let mut start = 0u64;
        for spec in files {
            let path = root.join(&spec.path);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await
                .with_context(|| format!("open {:?}", path))?;
            let preexisting = file.metadata().await?.len().min(spec.length);
            trace!(?path, preexisting, length = spec.length, "opened");
            spans.push(Span {
                spec: spec.clone(),
                start,
                preexisting,
                file,
            });
            start += spec.length;
        }
        Ok(FileSet {
            spans,
            total_length: start,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Whether the byte range was entirely backed by data at open time.
    pub fn preallocated(&self, offset: u64, length: usize) -> bool {
        let end = offset + length as u64;
        if end > self.total_length {
            return false;
        }
        let mut pos = offset;
        for span in &self.spans {
            let span_end = span.start + span.spec.length;
            if pos >= span_end {
                continue;
            }
            let covered_end = span.start + span.preexisting;
            let need_end = end.min(span_end);
            if need_end > covered_end {
                return false;
            }
            pos = need_end;
            if pos >= end {
                return true;
            }
        }
        pos >= end
    }

    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        anyhow::ensure!(end <= self.total_length, "read past end of file set");
        let mut pos = offset;
        for span in &mut self.spans {
            let span_end = span.start + span.spec.length;
            if pos >= span_end || pos >= end {
                continue;
            }
            let take = (end.min(span_end) - pos) as usize;
            let dst = &mut buf[(pos - offset) as usize..(pos - offset) as usize + take];
            read_exact_or_zero(&mut span.file, pos - span.start, dst).await?;
            pos += take as u64;
        }
        Ok(())
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        anyhow::ensure!(end <= self.total_length, "write past end of file set");
        let mut pos = offset;
        for span in &mut self.spans {
            let span_end = span.start + span.spec.length;
            if pos >= span_end || pos >= end {
                continue;
            }
            let take = (end.min(span_end) - pos) as usize;
            let src = &data[(pos - offset) as usize..(pos - offset) as usize + take];
            span.file.seek(SeekFrom::Start(pos - span.start)).await?;
            span.file.write_all(src).await?;
            pos += take as u64;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        for span in &mut self.spans {
            span.file.flush().await?;
        }
        Ok(())
    }
}

/// Read into `buf` at `offset`, zero-filling whatever lies past the file's
/// current end.
async fn read_exact_or_zero(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut filled = 0usize;
    while filled < buf.len() {
        let rd = file.read(&mut buf[filled..]).await?;
        if rd == 0 {
            for b in buf[filled..].iter_mut() {
                *b = 0;
            }
            break;
        }
        filled += rd;
    }
    Ok(())
}
