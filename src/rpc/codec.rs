use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;

/// Upper bound on a single frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .big_endian()
        .new_codec()
}

pub fn framed(stream: TcpStream) -> FramedStream {
    Framed::new(stream, frame_codec())
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn send<T: Serialize>(stream: &mut FramedStream, value: &T) -> Result<()> {
    stream.send(encode(value)?).await?;
    Ok(())
}

/// Read the next frame. `Ok(None)` means the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(stream: &mut FramedStream) -> Result<Option<T>> {
    match stream.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}
