//! Transport seam
//!
//! Rooms never see sockets. A session is an `UnboundedSender<Vec<u8>>`
//! and whatever pumps the paired receiver owns the real wire. This module
//! is the demo-quality TCP pump: packets framed as a 4-byte little-endian
//! length followed by the payload, one connection per session, first
//! packet must be a join.

use log::{debug, info, warn};
use shared::protocol::{decode_client_packet, ClientPacket};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::registry::RoomRegistry;

/// Refuse anything bigger before allocating for it.
pub const MAX_PACKET_LEN: u32 = 1024 * 1024;

/// Reads one length-prefixed packet.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PACKET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Accept loop; one task per connection.
pub async fn serve(listener: TcpListener, registry: Arc<RoomRegistry>) -> io::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("connection from {}", addr);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry).await {
                debug!("connection {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<RoomRegistry>) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let first = read_packet(&mut reader).await?;
    let (room_type, options) = match decode_client_packet(&first) {
        Ok(ClientPacket::Join { room_type, options }) => (room_type, options),
        Ok(other) => {
            warn!("connection sent {:?} before joining, dropping", other);
            return Ok(());
        }
        Err(e) => {
            warn!("undecodable first packet: {}", e);
            return Ok(());
        }
    };

    let room = registry
        .join_or_create(&room_type, options.clone())
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session_id = room
        .join(None, options, out_tx)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    info!(
        "session {} joined room {} over tcp",
        session_id,
        room.room_id()
    );

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_packet(&mut writer, &bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_packet(&mut reader).await {
            Ok(bytes) => {
                if room.message(session_id.clone(), bytes).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    // EOF or error. A voluntary leave already went through the room as a
    // leave packet; this one is a no-op then (leave is idempotent).
    let _ = room.leave(session_id, false);
    writer_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_packet(&mut a, b"hello").await.unwrap();
        write_packet(&mut a, &[]).await.unwrap();
        assert_eq!(read_packet(&mut b).await.unwrap(), b"hello");
        assert_eq!(read_packet(&mut b).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn oversized_packet_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_PACKET_LEN + 1).to_le_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_packet(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
