//! Outbound side of the transfer protocol.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::{debug, info};

use filechat_protocol::constants::COPY_BUFFER_SIZE;
use filechat_protocol::{ChatLine, Identity, ProtocolError, TransferHeader};

use crate::connection::ConnectionWriter;
use crate::error::DataChannelError;

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    /// Sends `text` as `<nickname>: <text>`.
    pub async fn send_chat(
        &mut self,
        identity: &Identity,
        text: &str,
    ) -> Result<ChatLine, DataChannelError> {
        let line = identity.chat_line(text)?;
        self.send_line(line.as_str()).await?;
        Ok(line)
    }

    /// Announces and streams a local file.
    ///
    /// The announced name is the file's basename. Errors before the header
    /// is written leave the stream untouched; once the header is out, a
    /// local read failure is [`DataChannelError::SendAborted`] and the
    /// connection must be closed.
    pub async fn send_file(&mut self, path: &Path) -> Result<TransferHeader, DataChannelError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ProtocolError::InvalidFilename {
                name: path.display().to_string(),
                reason: "no UTF-8 file name",
            })?;

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| DataChannelError::file(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| DataChannelError::file(path, e))?
            .len();
        let header = TransferHeader::new(filename, size)?;

        self.send_line(&header.encode()).await?;
        info!(file = %header, "sending file");

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let to_read = ((size - sent) as usize).min(buf.len());
            let n = match file.read(&mut buf[..to_read]).await {
                Ok(0) | Err(_) => {
                    return Err(DataChannelError::SendAborted {
                        filename: header.filename,
                        sent,
                        expected: size,
                    });
                }
                Ok(n) => n,
            };
            self.write_chunk(&buf[..n]).await?;
            sent += n as u64;
        }
        self.flush().await?;

        debug!(file = %header, "file sent");
        Ok(header)
    }

    /// Announces and sends an in-memory file.
    pub async fn send_file_bytes(
        &mut self,
        filename: &str,
        data: &[u8],
    ) -> Result<TransferHeader, DataChannelError> {
        let header = TransferHeader::new(filename, data.len() as u64)?;
        self.send_line(&header.encode()).await?;
        self.send_bytes(data).await?;
        debug!(file = %header, "file sent");
        Ok(header)
    }
}
