//! Network Module
//!
//! Handles TCP communication between members and the transport seam the
//! gateway and replicator send through.

mod client;
mod server;

pub use client::{send_once, NetworkClient, TcpMemberChannel};
pub use server::{MessageHandler, NetworkServer};

use async_trait::async_trait;

use crate::cluster::MemberId;
use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Transport seam: deliver a message to a member and wait for its reply.
///
/// The TCP implementation is [`TcpMemberChannel`]; tests drive in-process
/// implementations through the same trait.
#[async_trait]
pub trait MemberChannel: Send + Sync {
    async fn send(&self, member: &MemberId, message: Message) -> Result<Message>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
