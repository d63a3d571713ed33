//! Multipart wire framing.
//!
//! ```text
//! +------------------+------------------+-------+------------------+-------+ ...
//! | Frames (4B BE)   | Length (4B BE)   | Bytes | Length (4B BE)   | Bytes |
//! +------------------+------------------+-------+------------------+-------+ ...
//! ```
//!
//! Messages exceeding [`MAX_FRAMES`] or [`MAX_FRAME_SIZE`] are rejected with
//! `InvalidData`, which drops the connection.

use super::Frame;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted single frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Most frames accepted in one message.
pub const MAX_FRAMES: usize = 64;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Encode a message into a single buffer.
pub fn encode(frames: &[Frame]) -> io::Result<Vec<u8>> {
    if frames.len() > MAX_FRAMES {
        return Err(invalid(format!(
            "message has {} frames, limit is {}",
            frames.len(),
            MAX_FRAMES
        )));
    }

    let body: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + body);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit of {}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    Ok(buf)
}

/// Write one message and flush.
pub async fn write_message<W>(writer: &mut W, frames: &[Frame]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(frames)?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one message. Returns `None` on a clean end of stream between messages.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Vec<Frame>>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if count > MAX_FRAMES {
        return Err(invalid(format!(
            "peer announced {} frames, limit is {}",
            count, MAX_FRAMES
        )));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(invalid(format!(
                "peer announced a {} byte frame, limit is {}",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}
