// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire protocol between master and worker: bincode-encoded frames inside
//! length-delimited packets. The handshake connection doubles as the
//! control channel; closure dispatch uses one fresh connection per call.

use crate::closure::Closure;
use crate::model::{NodeId, ServiceId, WorkerMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Worker -> master, first frame of the handshake connection. The
    /// connection itself is the reply channel and, once acknowledged, the
    /// control channel.
    Register {
        service_id: ServiceId,
        worker: NodeId,
    },
    /// Master -> worker on the control channel.
    Control(WorkerMessage),
    /// Master -> worker on a dispatch connection.
    Run { closure: Closure },
    /// Worker -> master: the encoded `Result<T, String>` produced by the
    /// remote function.
    RunResult(Vec<u8>),
    /// Worker -> worker's master: the dispatch itself failed (unknown
    /// function, undecodable argument) before the function could run.
    RunError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("connection closed by peer")]
    Closed,
}

pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

/// Reader half of a registration/control connection.
pub type ControlReader = FrameReader<OwnedReadHalf>;
/// Writer half of a registration/control connection.
pub type ControlWriter = FrameWriter<OwnedWriteHalf>;

pub fn frame_writer<W: AsyncWrite + Unpin>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, LengthDelimitedCodec::new())
}

pub fn frame_reader<R: AsyncRead + Unpin>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, LengthDelimitedCodec::new())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    frame: &Frame,
) -> Result<(), WireError> {
    let bytes = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    writer.send(Bytes::from(bytes)).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Frame, WireError> {
    match reader.next().await {
        Some(Ok(bytes)) => {
            let (frame, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            Ok(frame)
        }
        Some(Err(err)) => Err(WireError::Io(err)),
        None => Err(WireError::Closed),
    }
}

/// Encodes a closure argument or result payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
}

/// Decodes a closure argument or result payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn payloads_round_trip() {
        let bytes = encode_payload(&("service", 42u64)).expect("Failed to encode");
        let decoded: (String, u64) = decode_payload(&bytes).expect("Failed to decode");
        assert_eq!(decoded, ("service".to_string(), 42));
    }

    #[test]
    async fn frames_survive_a_loopback_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to read local addr");

        let client = tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .expect("Failed to connect");
            let (_, write_half) = stream.into_split();
            let mut writer = frame_writer(write_half);
            write_frame(
                &mut writer,
                &Frame::Register {
                    service_id: "abc12".parse().expect("Failed to parse service id"),
                    worker: NodeId::new("127.0.0.1", 12345),
                },
            )
            .await
            .expect("Failed to write frame");
        });

        let (stream, _) = listener.accept().await.expect("Failed to accept");
        let (read_half, _) = stream.into_split();
        let mut reader = frame_reader(read_half);
        let frame = read_frame(&mut reader).await.expect("Failed to read frame");
        match frame {
            Frame::Register { service_id, worker } => {
                assert_eq!(service_id.as_str(), "abc12");
                assert_eq!(worker, NodeId::new("127.0.0.1", 12345));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        client.await.expect("client task failed");
    }
}
