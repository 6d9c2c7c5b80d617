//! JSON-lines protocol between coordinators and networked replicas.
//!
//! Each request and response is one JSON object on its own line. Commands
//! travel in their delimited wire form so that a malformed command reaches the
//! replica intact and is refused there, rather than failing the whole frame.
//!
//! A frame longer than [`MAX_FRAME_BYTES`] is rejected before it is parsed, so
//! a peer that never sends a newline cannot grow the read buffer without
//! bound.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::replica::{ProposalNumber, Refusal};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Upper bound on one frame, newline included. Snapshots of the whole
/// dictionary are the largest frames.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Promise {
        proposal: ProposalNumber,
    },
    Accept {
        proposal: ProposalNumber,
        command: String,
    },
    Get {
        key: String,
    },
    Snapshot,
    UpdateDictionary {
        dictionary: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Promised {
        prior: Option<WirePrior>,
    },
    PromiseRefused {
        promised: ProposalNumber,
    },
    Done {
        proposal: ProposalNumber,
    },
    Refused {
        refusal: Refusal,
    },
    Value {
        value: Option<String>,
    },
    Snapshot {
        dictionary: BTreeMap<String, String>,
    },
    Ack,
    Error {
        message: String,
    },
}

/// A pending command as it appears inside a promise reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePrior {
    pub proposal: ProposalNumber,
    pub command: String,
}

/// Reads the next frame, skipping blank lines. `Ok(None)` means the peer
/// closed the connection.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_bounded(reader, MAX_FRAME_BYTES).await
}

async fn read_bounded<R, T>(reader: &mut R, limit: usize) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut frame = String::new();
    loop {
        frame.clear();
        let read = (&mut *reader)
            .take(limit as u64 + 1)
            .read_line(&mut frame)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if read > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame longer than {limit} bytes"),
            ));
        }

        let body = frame.trim_end_matches(LINE_ENDINGS);
        if !body.is_empty() {
            return serde_json::from_str(body).map(Some).map_err(invalid_frame);
        }
    }
}

/// Writes `message` as one newline-terminated frame and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).map_err(invalid_frame)?;
    frame.push(b'\n');
    if frame.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_BYTES}", frame.len()),
        ));
    }
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_frame(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
