//! Frame codec for the worker wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬───────────────┬──────────────┬─────────────────┐
//! │ len (4B) │ hdr len (4B)  │ JSON header  │ payload         │
//! │ u32 BE   │ u32 BE        │              │ (opaque bytes)  │
//! └──────────┴───────────────┴──────────────┴─────────────────┘
//! ```
//! `len` counts everything after itself. Requests carry a
//! [`RequestHeader`], replies a [`ResponseHeader`]; the payload is the
//! encoded protobuf message in both directions.

use std::collections::BTreeMap;
use std::io;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Header of a request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Method key, `package.Service/Method`.
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Header of a reply frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerFault>,
}

/// Application error raised by the worker for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFault {
    /// gRPC status code.
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF before the first byte of a frame.
/// `max_frame_bytes` caps the accepted frame length.
pub async fn read_frame<H, R>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<(H, Bytes)>>
where
    H: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {frame_len} bytes"),
        ));
    }
    if frame_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too short: missing header length",
        ));
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).await?;

    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if header_len > frame.len() - 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("header length {header_len} exceeds frame"),
        ));
    }

    let header = serde_json::from_slice(&frame[4..4 + header_len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let payload = Bytes::from(frame).slice(4 + header_len..);

    Ok(Some((header, payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<H, W>(writer: &mut W, header: &H, payload: &[u8]) -> io::Result<()>
where
    H: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let header = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "header too large"))?;
    let frame_len = 4usize + header.len() + payload.len();
    let frame_len = u32::try_from(frame_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&header_len.to_be_bytes()).await?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
