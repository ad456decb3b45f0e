//! Length-prefixed, tagged framing.
//!
//! Frames are laid out as:
//! - 4 bytes: length (big-endian u32) = 1 + payload length
//! - 1 byte: message type tag
//! - N bytes: payload
//!
//! [`read_frame`] pulls one frame off an async stream with blocking exact
//! reads; [`FrameCodec`] does the same job for `tokio_util` framed streams.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{IpcError, Result};
use crate::ipc::messages::{MessageType, describe_tag};

/// Bytes in the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a frame's length field (16 MB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// One tagged message as transmitted on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Value of the length prefix for this frame.
    pub fn length(&self) -> usize {
        self.payload.len() + 1
    }

    /// Decoded tag, or `UnknownMessageType` for tags outside the schema.
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.tag)
    }

    pub fn describe(&self) -> String {
        format!("{} ({} bytes)", describe_tag(self.tag), self.payload.len())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.tag, &self.payload)
    }
}

/// Encode a frame: `be32(len(payload) + 1) ++ tag ++ payload`.
pub fn encode(tag: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len() + 1).map_err(|_| IpcError::FrameTooLarge {
        length: payload.len() + 1,
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + 1 + payload.len());
    out.extend_from_slice(&length.to_be_bytes());
    out.push(tag);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Fill `buf` completely, or report how far we got before the peer closed.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(IpcError::ShortRead {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read exactly one frame.
///
/// The length, tag and payload reads must all succeed; on any failure the
/// partial bytes are discarded and nothing is returned. A clean close before
/// the first length byte is reported as `Closed`, a close anywhere later as
/// `ShortRead`.
pub async fn read_frame<R>(reader: &mut R, max_length: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match read_full(reader, &mut len_buf).await {
        Ok(()) => {}
        Err(IpcError::ShortRead { received: 0, .. }) => return Err(IpcError::Closed),
        Err(e) => return Err(e),
    }

    let length = u32::from_be_bytes(len_buf);
    check_length(length, max_length)?;

    let mut tag = [0u8; 1];
    read_full(reader, &mut tag).await?;

    let mut payload = vec![0u8; length as usize - 1];
    read_full(reader, &mut payload).await?;

    Ok(Frame::new(tag[0], payload))
}

fn check_length(length: u32, max_length: usize) -> Result<()> {
    if length < 1 {
        return Err(IpcError::InvalidLength(length));
    }
    if length as usize > max_length {
        return Err(IpcError::FrameTooLarge {
            length: length as usize,
            max: max_length,
        });
    }
    Ok(())
}

/// Frame codec for `FramedRead`/`FramedWrite`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    /// Create a new codec with default max length (16 MB).
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Create a new codec with custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        check_length(length, self.max_length)?;

        let total = LENGTH_PREFIX_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let tag = src.get_u8();
        let payload = src.split_to(length as usize - 1);
        Ok(Some(Frame::new(tag, payload.to_vec())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let expected = if src.len() < LENGTH_PREFIX_LEN {
                    LENGTH_PREFIX_LEN
                } else {
                    LENGTH_PREFIX_LEN + u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
                };
                let received = src.len();
                src.clear();
                Err(IpcError::ShortRead { expected, received })
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.length();
        if length > self.max_length {
            return Err(IpcError::FrameTooLarge {
                length,
                max: self.max_length,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u8(frame.tag);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_bytes() {
        let bytes = encode(7, &[1, 2, 3]).unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x04, 0x07, 0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_read_frame_known_bytes() {
        let bytes = [0x00u8, 0x00, 0x00, 0x04, 0x07, 0x01, 0x02, 0x03];
        let mut reader = &bytes[..];
        let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap();
        assert_eq!(frame, Frame::new(7, vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_roundtrip_assorted_payloads() {
        let cases: Vec<(u8, Vec<u8>)> = vec![
            (14, vec![]),
            (0, vec![0xff]),
            (255, b"{\"role\":\"app\"}".to_vec()),
            (11, vec![0u8; 70_000]),
        ];
        for (tag, payload) in cases {
            let bytes = encode(tag, &payload).unwrap();
            let mut reader = &bytes[..];
            let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap();
            assert_eq!(frame.tag, tag);
            assert_eq!(frame.payload, payload);
            assert!(reader.is_empty());
        }
    }

    #[tokio::test]
    async fn test_read_frame_clean_close() {
        let mut reader: &[u8] = &[];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap_err();
        assert!(matches!(err, IpcError::Closed));
    }

    #[tokio::test]
    async fn test_read_frame_short_length() {
        let mut reader: &[u8] = &[0, 0];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap_err();
        assert!(matches!(
            err,
            IpcError::ShortRead {
                expected: 4,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_read_frame_short_payload() {
        // Length says 10 bytes (tag + 9), only 3 payload bytes follow
        let bytes = [0u8, 0, 0, 10, 5, 1, 2, 3];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap_err();
        assert!(matches!(
            err,
            IpcError::ShortRead {
                expected: 9,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_read_frame_missing_tag() {
        let bytes = [0u8, 0, 0, 1];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap_err();
        assert!(matches!(err, IpcError::ShortRead { expected: 1, received: 0 }));
    }

    #[tokio::test]
    async fn test_read_frame_zero_length_rejected() {
        let bytes = [0u8, 0, 0, 0, 9];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LENGTH).await.unwrap_err();
        assert!(matches!(err, IpcError::InvalidLength(0)));
    }

    #[tokio::test]
    async fn test_read_frame_too_large() {
        let bytes = [0u8, 0, 1, 0, 9];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { length: 256, max: 16 }));
    }

    #[test]
    fn test_codec_partial_then_complete() {
        let mut codec = FrameCodec::new();
        let bytes = encode(11, b"{}").unwrap();

        let mut buf = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[5..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(11, b"{}".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(1, vec![1]), &mut buf).unwrap();
        codec.encode(Frame::new(2, vec![2, 2]), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::new(1, vec![1]));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::new(2, vec![2, 2]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_zero_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(IpcError::InvalidLength(0))));
    }

    #[test]
    fn test_codec_max_length() {
        let mut codec = FrameCodec::with_max_length(4);
        assert_eq!(codec.max_length(), 4);

        let mut buf = BytesMut::new();
        let err = codec.encode(Frame::new(1, vec![0; 10]), &mut buf).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { length: 11, max: 4 }));
    }

    #[test]
    fn test_codec_eof_mid_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 1][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, IpcError::ShortRead { expected: 9, received: 5 }));
    }

    #[test]
    fn test_frame_helpers() {
        let frame = Frame::new(MessageType::Connect.tag(), b"{}".to_vec());
        assert_eq!(frame.length(), 3);
        assert_eq!(frame.message_type().unwrap(), MessageType::Connect);
        assert!(frame.describe().starts_with("Connect(14)"));
        assert_eq!(frame.encode().unwrap().len(), 7);
    }
}
