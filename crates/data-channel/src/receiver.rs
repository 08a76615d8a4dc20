//! Inbound side of the transfer protocol.
//!
//! [`Receiver::next`] reads one text-channel line and, for a transfer
//! announcement, the whole body that follows it. The [`ChannelState`]
//! held by the receiver decides which reader may touch the stream.

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use filechat_protocol::constants::COPY_BUFFER_SIZE;
use filechat_protocol::{
    BodyProgress, ChannelState, ChatLine, Line, ProtocolError, TransferHeader, validate_filename,
};

use crate::connection::ConnectionReader;
use crate::error::DataChannelError;
use crate::sink::{FileSink, StoredFile};

/// Limits applied to incoming transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivePolicy {
    /// Largest accepted body (`None` = unlimited).
    pub max_file_size: Option<u64>,
}

/// Body progress of the transfer in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub filename: String,
    pub received: u64,
    pub total: u64,
}

/// One event read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A chat line, verbatim.
    Chat(ChatLine),
    /// A file body received in full and stored by the sink.
    File(StoredFile),
    /// A well-formed announcement that was refused. The body was drained,
    /// so the stream is back in text mode.
    Rejected {
        header: TransferHeader,
        reason: String,
    },
    /// A malformed announcement. No body was consumed.
    Malformed(ProtocolError),
}

/// Reads chat lines and file transfers from one connection.
pub struct Receiver<R, S> {
    reader: ConnectionReader<R>,
    sink: S,
    policy: ReceivePolicy,
    state: ChannelState,
    buf: Vec<u8>,
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl<R: AsyncRead + Unpin, S: FileSink> Receiver<R, S> {
    pub fn new(reader: ConnectionReader<R>, sink: S, policy: ReceivePolicy) -> Self {
        Self {
            reader,
            sink,
            policy,
            state: ChannelState::Idle,
            buf: vec![0u8; COPY_BUFFER_SIZE],
            progress_tx: None,
        }
    }

    /// Reports body progress after every chunk (non-blocking, lossy).
    pub fn with_progress(mut self, progress_tx: mpsc::Sender<TransferProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_parts(self) -> (ConnectionReader<R>, S) {
        (self.reader, self.sink)
    }

    /// Reads the next event.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between events.
    /// Errors are fatal to the connection (see
    /// [`DataChannelError::is_fatal`]); recoverable problems are reported
    /// as [`Inbound::Rejected`] or [`Inbound::Malformed`].
    pub async fn next(&mut self) -> Result<Option<Inbound>, DataChannelError> {
        self.state.begin_line()?;
        let line = match self.reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.state.abort();
                return Ok(None);
            }
            Err(e) => {
                self.state.abort();
                return Err(e);
            }
        };

        match self.state.accept_line(&line)? {
            Ok(Line::Chat(chat)) => Ok(Some(Inbound::Chat(chat))),
            Ok(Line::Transfer(header)) => self.receive_body(header).await.map(Some),
            Err(e) => {
                warn!(line = %line, "malformed transfer header: {e}");
                Ok(Some(Inbound::Malformed(e)))
            }
        }
    }

    /// Cleans up after a [`next`](Self::next) future that was dropped
    /// before it finished.
    ///
    /// A body in flight is discarded from the sink and returned as a
    /// [`DataChannelError::ShortTransfer`]. Between events this only resets
    /// the state and returns `None`.
    pub async fn cancel(&mut self) -> Option<DataChannelError> {
        let (header, received) = self.state.abort()?;
        self.abort_sink(true).await;
        warn!(file = %header, received, "transfer cancelled");
        Some(DataChannelError::ShortTransfer {
            expected: header.size,
            received,
        })
    }

    async fn receive_body(
        &mut self,
        header: TransferHeader,
    ) -> Result<Inbound, DataChannelError> {
        // A refused transfer is still drained so the text channel stays in
        // sync with the sender.
        let mut refusal = self.admit(&header).await.err();
        match &refusal {
            Some(e) => warn!(file = %header, "rejecting transfer: {e}"),
            None => info!(file = %header, "receiving file"),
        }

        let mut progress = self.state.record_body(0)?;
        while let BodyProgress::Pending { remaining, .. } = progress {
            let to_read = remaining.min(self.buf.len() as u64) as usize;
            let n = match self.reader.read_chunk(&mut self.buf[..to_read]).await {
                Ok(0) => {
                    let (_, received) = self.state.abort().unwrap_or((header.clone(), 0));
                    self.abort_sink(refusal.is_none()).await;
                    warn!(
                        file = %header,
                        received,
                        "peer closed before the transfer completed"
                    );
                    return Err(DataChannelError::ShortTransfer {
                        expected: header.size,
                        received,
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    self.state.abort();
                    self.abort_sink(refusal.is_none()).await;
                    return Err(e);
                }
            };

            if refusal.is_none() {
                if let Err(e) = self.sink.write(&self.buf[..n]).await {
                    warn!(file = %header, "local write failed, draining the rest: {e}");
                    self.abort_sink(true).await;
                    refusal = Some(e);
                }
            }

            progress = self.state.record_body(n as u64)?;
            if let (Some(tx), BodyProgress::Pending { received, .. }) = (&self.progress_tx, &progress)
            {
                let _ = tx.try_send(TransferProgress {
                    filename: header.filename.clone(),
                    received: *received,
                    total: header.size,
                });
            }
        }

        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(TransferProgress {
                filename: header.filename.clone(),
                received: header.size,
                total: header.size,
            });
        }

        if let Some(e) = refusal {
            return Ok(Inbound::Rejected {
                header,
                reason: e.to_string(),
            });
        }

        match self.sink.finish().await {
            Ok(stored) => {
                info!(file = %header, "file received");
                Ok(Inbound::File(stored))
            }
            Err(e) => {
                warn!(file = %header, "failed to store file: {e}");
                Ok(Inbound::Rejected {
                    header,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Applies the receive policy and opens the sink.
    async fn admit(&mut self, header: &TransferHeader) -> Result<(), DataChannelError> {
        validate_filename(&header.filename)?;
        if let Some(max) = self.policy.max_file_size {
            if header.size > max {
                return Err(DataChannelError::FileTooLarge {
                    size: header.size,
                    max,
                });
            }
        }
        self.sink.begin(header).await
    }

    async fn abort_sink(&mut self, open: bool) {
        if !open {
            return;
        }
        if let Err(e) = self.sink.abort().await {
            debug!("sink abort failed: {e}");
        }
    }
}
