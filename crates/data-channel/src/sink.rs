//! Destinations for received file bodies.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use filechat_protocol::{StateError, TransferHeader, validate_filename};

use crate::error::DataChannelError;
use crate::{DEFAULT_RECEIVED_PREFIX, TCP_BUFFER_SIZE};

/// A boxed future returned by sink methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DataChannelError>> + Send + 'a>>;

/// A completed transfer as stored by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Filename announced by the sender.
    pub filename: String,
    pub size: u64,
    /// Where the body was written, for filesystem sinks.
    pub path: Option<PathBuf>,
}

/// Receives file bodies chosen by the caller of a [`Receiver`](crate::Receiver).
///
/// Called as `begin`, any number of `write`s, then `finish` on success
/// or `abort` on failure. One transfer is open at a time.
pub trait FileSink: Send {
    fn begin<'a>(&'a mut self, header: &'a TransferHeader) -> SinkFuture<'a, ()>;

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> SinkFuture<'a, ()>;

    fn finish(&mut self) -> SinkFuture<'_, StoredFile>;

    /// Discards the open transfer, if any.
    fn abort(&mut self) -> SinkFuture<'_, ()>;
}

fn no_open_file() -> DataChannelError {
    DataChannelError::State(StateError {
        operation: "write file data",
        state: "no transfer is open",
    })
}

struct OpenFile {
    header: TransferHeader,
    path: PathBuf,
    file: BufWriter<tokio::fs::File>,
}

/// Writes each file to `<dir>/<prefix><filename>`, replacing any existing
/// file of that name.
pub struct DirectorySink {
    dir: PathBuf,
    prefix: String,
    open: Option<OpenFile>,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_prefix(dir, DEFAULT_RECEIVED_PREFIX)
    }

    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            open: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a transfer named `filename` is stored at.
    pub fn target_path(&self, filename: &str) -> PathBuf {
        self.dir.join(format!("{}{filename}", self.prefix))
    }
}

impl FileSink for DirectorySink {
    fn begin<'a>(&'a mut self, header: &'a TransferHeader) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            if self.open.is_some() {
                return Err(DataChannelError::State(StateError {
                    operation: "begin a transfer",
                    state: "another transfer is open",
                }));
            }
            // Headers are validated upstream; this sink joins the name onto
            // a directory and checks again.
            validate_filename(&header.filename)?;

            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| DataChannelError::file(&self.dir, e))?;

            let path = self.target_path(&header.filename);
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| DataChannelError::file(&path, e))?;

            debug!(path = %path.display(), size = header.size, "receiving file");
            self.open = Some(OpenFile {
                header: header.clone(),
                path,
                file: BufWriter::with_capacity(TCP_BUFFER_SIZE, file),
            });
            Ok(())
        })
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let open = self.open.as_mut().ok_or_else(no_open_file)?;
            open.file
                .write_all(chunk)
                .await
                .map_err(|e| DataChannelError::file(&open.path, e))
        })
    }

    fn finish(&mut self) -> SinkFuture<'_, StoredFile> {
        Box::pin(async move {
            let mut open = self.open.take().ok_or_else(no_open_file)?;
            if let Err(e) = open.file.flush().await {
                remove_partial(&open.path).await;
                return Err(DataChannelError::file(&open.path, e));
            }
            Ok(StoredFile {
                filename: open.header.filename,
                size: open.header.size,
                path: Some(open.path),
            })
        })
    }

    fn abort(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            if let Some(open) = self.open.take() {
                drop(open.file);
                remove_partial(&open.path).await;
            }
            Ok(())
        })
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "partial file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial file: {e}"),
    }
}

/// Keeps received files in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    open: Option<(TransferHeader, Vec<u8>)>,
    files: Vec<(String, Vec<u8>)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed files in arrival order.
    pub fn files(&self) -> &[(String, Vec<u8>)] {
        &self.files
    }

    /// Contents of the most recent completed file named `filename`.
    pub fn get(&self, filename: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .rev()
            .find(|(name, _)| name == filename)
            .map(|(_, data)| data.as_slice())
    }

    pub fn take_files(&mut self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.files)
    }
}

impl FileSink for MemorySink {
    fn begin<'a>(&'a mut self, header: &'a TransferHeader) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let capacity = usize::try_from(header.size)
                .unwrap_or(usize::MAX)
                .min(TCP_BUFFER_SIZE);
            self.open = Some((header.clone(), Vec::with_capacity(capacity)));
            Ok(())
        })
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let (_, data) = self.open.as_mut().ok_or_else(no_open_file)?;
            data.extend_from_slice(chunk);
            Ok(())
        })
    }

    fn finish(&mut self) -> SinkFuture<'_, StoredFile> {
        Box::pin(async move {
            let (header, data) = self.open.take().ok_or_else(no_open_file)?;
            let stored = StoredFile {
                filename: header.filename.clone(),
                size: data.len() as u64,
                path: None,
            };
            self.files.push((header.filename, data));
            Ok(stored)
        })
    }

    fn abort(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            self.open = None;
            Ok(())
        })
    }
}
