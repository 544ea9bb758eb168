use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{FIXED_HEAD_LENGTH, LENGTH_PREFIX};
use crate::{Error, ErrorKind, Result};

/// Largest frame a peer may send.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one complete frame: the two length fields first, then the rest of
/// the header and the body in a single read.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    r.read_exact(&mut prefix).await?;

    let head_length = BigEndian::read_u32(&prefix[..4]) as usize;
    let body_length = BigEndian::read_u32(&prefix[4..]) as usize;
    if head_length < FIXED_HEAD_LENGTH {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("head length {} is shorter than the fixed header", head_length),
        ));
    }
    let total = head_length
        .checked_add(body_length)
        .filter(|n| *n <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::new(ErrorKind::Protocol, "frame exceeds the maximum length"))?;

    let mut frame = vec![0u8; total];
    frame[..LENGTH_PREFIX].copy_from_slice(&prefix);
    r.read_exact(&mut frame[LENGTH_PREFIX..]).await?;
    Ok(frame)
}

pub async fn write_frame<W>(w: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}
