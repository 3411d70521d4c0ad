//! Frame codec: one logical protocol frame, in either framing mode.
//!
//! Text frames (one frame per LF-terminated line; CR before LF is accepted
//! on read, never produced on write):
//!
//! ```text
//! <key>\t<value>\n            param pair (escaped fields)
//! <func>\a<id>\n              call
//! <func>\a<id>\a<recv-id>\n   call-back addressed to an outstanding call
//! \a<id>\n                    return
//! \n                          anonymous return
//! ```
//!
//! Binary frames (type octet, fixed-width big-endian fields, then bytes):
//!
//! | Type | Payload                                          |
//! |------|--------------------------------------------------|
//! | 1    | u32 keysize, u32 valuesize, key bytes, value bytes |
//! | 2    | u32 id, u32 funcsize, func bytes                 |
//! | 3    | u32 id, u32 recv-id, u32 funcsize, func bytes    |
//! | 4    | u32 id                                           |
//!
//! On the binary wire an id field of 0 encodes "no id" (0 is reserved and
//! never allocated). The binary read path additionally recognizes the text
//! handshake acknowledgement `O\tK\n\a1\n`, because the acknowledgement is
//! emitted as a raw literal after the receiver has already switched modes.

use std::io::{self, BufRead, Write};

use crate::error::{Error, Result};
use crate::params::ParamBag;

use super::escape::{escape, unescape, BELL};

/// Framing mode of one wire direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Line-oriented frames with escaped fields
    Text,
    /// Type-octet frames with length-prefixed fields
    Binary,
}

/// One parsed protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A key/value pair belonging to the frame group in progress
    Param { key: Vec<u8>, value: Vec<u8> },
    /// A call; `recv_id` is set when it is addressed to an outstanding call
    Call {
        func: Vec<u8>,
        id: Option<u32>,
        recv_id: Option<u32>,
    },
    /// A return completing the call with the given id (`None` = anonymous)
    Return { id: Option<u32> },
}

/// Outbound buffer size that triggers a mid-frame flush (~10 KB)
pub const FLUSH_THRESHOLD: usize = 10 * 1024;

const TYPE_PARAM: u8 = 1;
const TYPE_CALL: u8 = 2;
const TYPE_CALLBACK: u8 = 3;
const TYPE_RETURN: u8 = 4;

/// Remainder of the text acknowledgement once its leading `O` has been
/// consumed as a would-be type octet on the binary path
const ACK_TAIL: &[u8] = b"\tK\n\x071\n";

/// Reads one frame at a time in the active mode
pub struct FrameReader<R> {
    inner: R,
    mode: WireMode,
    /// Second frame of a two-frame literal recognized on the binary path
    stashed: Option<Frame>,
}

impl<R: BufRead> FrameReader<R> {
    /// Create a reader starting in the given mode
    pub fn new(inner: R, mode: WireMode) -> Self {
        Self {
            inner,
            mode,
            stashed: None,
        }
    }

    /// Active framing mode
    pub fn mode(&self) -> WireMode {
        self.mode
    }

    /// Switch the read direction to binary framing
    pub fn switch_to_binary(&mut self) {
        self.mode = WireMode::Binary;
    }

    /// Read the next frame. `Ok(None)` means the transport reached a clean
    /// end of stream at a frame boundary.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.stashed.take() {
            return Ok(Some(frame));
        }
        match self.mode {
            WireMode::Text => self.read_text_frame(),
            WireMode::Binary => self.read_binary_frame(),
        }
    }

    fn read_text_frame(&mut self) -> Result<Option<Frame>> {
        let mut line = Vec::new();
        let n = self.inner.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::InvalidResponse(
                "transport closed in the middle of a frame".to_string(),
            ));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        parse_text_line(&line).map(Some)
    }

    fn read_binary_frame(&mut self) -> Result<Option<Frame>> {
        let mut type_octet = [0u8; 1];
        match self.inner.read_exact(&mut type_octet) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match type_octet[0] {
            TYPE_PARAM => {
                let keysize = self.read_u32()?;
                let valuesize = self.read_u32()?;
                let key = self.read_bytes(keysize)?;
                let value = self.read_bytes(valuesize)?;
                Ok(Some(Frame::Param { key, value }))
            }
            TYPE_CALL => {
                let id = self.read_u32()?;
                let funcsize = self.read_u32()?;
                let func = self.read_bytes(funcsize)?;
                Ok(Some(Frame::Call {
                    func,
                    id: nonzero(id),
                    recv_id: None,
                }))
            }
            TYPE_CALLBACK => {
                let id = self.read_u32()?;
                let recv_id = self.read_u32()?;
                let funcsize = self.read_u32()?;
                let func = self.read_bytes(funcsize)?;
                Ok(Some(Frame::Call {
                    func,
                    id: nonzero(id),
                    recv_id: nonzero(recv_id),
                }))
            }
            TYPE_RETURN => {
                let id = self.read_u32()?;
                Ok(Some(Frame::Return { id: nonzero(id) }))
            }
            b'O' => {
                // Text acknowledgement arriving after this side already
                // switched to binary reads.
                let mut tail = [0u8; 6];
                self.inner.read_exact(&mut tail)?;
                if tail != ACK_TAIL {
                    return Err(Error::InvalidResponse(format!(
                        "expected handshake acknowledgement, got {:?}",
                        tail
                    )));
                }
                self.stashed = Some(Frame::Return { id: Some(1) });
                Ok(Some(Frame::Param {
                    key: b"O".to_vec(),
                    value: b"K".to_vec(),
                }))
            }
            other => Err(Error::InvalidResponse(format!(
                "unknown binary frame type {}",
                other
            ))),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, len: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn parse_text_line(line: &[u8]) -> Result<Frame> {
    if line.is_empty() {
        return Ok(Frame::Return { id: None });
    }
    if let Some(pos) = line.iter().position(|&b| b == BELL) {
        let func = &line[..pos];
        let rest = &line[pos + 1..];
        let (id_part, recv_part) = match rest.iter().position(|&b| b == BELL) {
            Some(sep) => (&rest[..sep], Some(&rest[sep + 1..])),
            None => (rest, None),
        };
        let id = parse_id(id_part)?;
        match recv_part {
            None if func.is_empty() => Ok(Frame::Return { id }),
            None => Ok(Frame::Call {
                func: unescape(func),
                id,
                recv_id: None,
            }),
            Some(recv_part) if func.is_empty() => Err(Error::InvalidResponse(format!(
                "callback frame without a function name: {:?}",
                String::from_utf8_lossy(recv_part)
            ))),
            Some(recv_part) => Ok(Frame::Call {
                func: unescape(func),
                id,
                recv_id: parse_id(recv_part)?,
            }),
        }
    } else if let Some(pos) = line.iter().position(|&b| b == b'\t') {
        Ok(Frame::Param {
            key: unescape(&line[..pos]),
            value: unescape(&line[pos + 1..]),
        })
    } else {
        Err(Error::InvalidResponse(format!(
            "unframed line: {:?}",
            String::from_utf8_lossy(line)
        )))
    }
}

fn parse_id(bytes: &[u8]) -> Result<Option<u32>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .map(Some)
        .ok_or_else(|| {
            Error::InvalidResponse(format!(
                "malformed call id: {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

fn nonzero(id: u32) -> Option<u32> {
    (id != 0).then_some(id)
}

/// Writes frames in the active mode, batching param pairs.
///
/// Serialized params accumulate in a buffer that is flushed mid-frame once
/// it exceeds [`FLUSH_THRESHOLD`]; the closing call/return frame is always
/// appended and the whole buffer flushed. Purely a throughput optimization.
pub struct FrameWriter<W> {
    inner: W,
    mode: WireMode,
    buf: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    /// Create a writer starting in the given mode
    pub fn new(inner: W, mode: WireMode) -> Self {
        Self {
            inner,
            mode,
            buf: Vec::new(),
        }
    }

    /// Active framing mode
    pub fn mode(&self) -> WireMode {
        self.mode
    }

    /// Switch the write direction to binary framing
    pub fn switch_to_binary(&mut self) {
        self.mode = WireMode::Binary;
    }

    /// Emit a call frame preceded by its params
    pub fn send_call(
        &mut self,
        func: &[u8],
        params: &ParamBag,
        id: Option<u32>,
        recv_id: Option<u32>,
    ) -> io::Result<()> {
        for (key, value) in params.iter() {
            self.push_param(key, value)?;
        }
        match self.mode {
            WireMode::Text => {
                let escaped = escape(func);
                self.buf.extend_from_slice(&escaped);
                self.buf.push(BELL);
                if let Some(id) = id {
                    self.buf.extend_from_slice(id.to_string().as_bytes());
                }
                if let Some(recv_id) = recv_id {
                    self.buf.push(BELL);
                    self.buf.extend_from_slice(recv_id.to_string().as_bytes());
                }
                self.buf.push(b'\n');
            }
            WireMode::Binary => match recv_id {
                None => {
                    self.buf.push(TYPE_CALL);
                    self.push_u32(id.unwrap_or(0));
                    self.push_u32(func.len() as u32);
                    self.buf.extend_from_slice(func);
                }
                Some(recv_id) => {
                    self.buf.push(TYPE_CALLBACK);
                    self.push_u32(id.unwrap_or(0));
                    self.push_u32(recv_id);
                    self.push_u32(func.len() as u32);
                    self.buf.extend_from_slice(func);
                }
            },
        }
        self.finish()
    }

    /// Emit a return frame preceded by its params. `id` of `None` produces
    /// the anonymous return form (bare LF in text, id 0 in binary).
    pub fn send_return(&mut self, id: Option<u32>, params: &ParamBag) -> io::Result<()> {
        for (key, value) in params.iter() {
            self.push_param(key, value)?;
        }
        match self.mode {
            WireMode::Text => {
                if let Some(id) = id {
                    self.buf.push(BELL);
                    self.buf.extend_from_slice(id.to_string().as_bytes());
                }
                self.buf.push(b'\n');
            }
            WireMode::Binary => {
                self.buf.push(TYPE_RETURN);
                self.push_u32(id.unwrap_or(0));
            }
        }
        self.finish()
    }

    /// Emit raw bytes outside any framing (handshake literals)
    pub fn send_literal(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        self.finish()
    }

    fn push_param(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        match self.mode {
            WireMode::Text => {
                let key = escape(key);
                let value = escape(value);
                self.buf.extend_from_slice(&key);
                self.buf.push(b'\t');
                self.buf.extend_from_slice(&value);
                self.buf.push(b'\n');
            }
            WireMode::Binary => {
                self.buf.push(TYPE_PARAM);
                self.push_u32(key.len() as u32);
                self.push_u32(value.len() as u32);
                self.buf.extend_from_slice(key);
                self.buf.extend_from_slice(value);
            }
        }
        if self.buf.len() > FLUSH_THRESHOLD {
            let written = self.inner.write_all(&self.buf);
            self.buf.clear();
            written?;
        }
        Ok(())
    }

    fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn finish(&mut self) -> io::Result<()> {
        let written = self.inner.write_all(&self.buf);
        self.buf.clear();
        written?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all<R: BufRead>(reader: &mut FrameReader<R>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_text_call_frame() {
        let mut reader = FrameReader::new(Cursor::new(b"echo\x0742\n".to_vec()), WireMode::Text);
        assert_eq!(
            reader.read_frame().unwrap(),
            Some(Frame::Call {
                func: b"echo".to_vec(),
                id: Some(42),
                recv_id: None,
            })
        );
    }

    #[test]
    fn test_text_callback_frame() {
        let mut reader =
            FrameReader::new(Cursor::new(b"notify\x077\x073\n".to_vec()), WireMode::Text);
        assert_eq!(
            reader.read_frame().unwrap(),
            Some(Frame::Call {
                func: b"notify".to_vec(),
                id: Some(7),
                recv_id: Some(3),
            })
        );
    }

    #[test]
    fn test_text_return_frames() {
        let mut reader = FrameReader::new(Cursor::new(b"\x0712\n\n".to_vec()), WireMode::Text);
        assert_eq!(
            read_all(&mut reader),
            vec![Frame::Return { id: Some(12) }, Frame::Return { id: None }]
        );
    }

    #[test]
    fn test_text_param_with_escapes() {
        let mut reader = FrameReader::new(
            Cursor::new(b"k\\x09ey\tva\\x0alue\n".to_vec()),
            WireMode::Text,
        );
        assert_eq!(
            reader.read_frame().unwrap(),
            Some(Frame::Param {
                key: b"k\tey".to_vec(),
                value: b"va\nlue".to_vec(),
            })
        );
    }

    #[test]
    fn test_crlf_tolerated_on_read() {
        let mut reader = FrameReader::new(Cursor::new(b"echo\x075\r\n".to_vec()), WireMode::Text);
        assert_eq!(
            reader.read_frame().unwrap(),
            Some(Frame::Call {
                func: b"echo".to_vec(),
                id: Some(5),
                recv_id: None,
            })
        );
    }

    #[test]
    fn test_text_call_without_id() {
        let mut reader = FrameReader::new(Cursor::new(b"fire\x07\n".to_vec()), WireMode::Text);
        assert_eq!(
            reader.read_frame().unwrap(),
            Some(Frame::Call {
                func: b"fire".to_vec(),
                id: None,
                recv_id: None,
            })
        );
    }

    #[test]
    fn test_unframed_line_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"garbage\n".to_vec()), WireMode::Text);
        assert!(matches!(
            reader.read_frame(),
            Err(crate::Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_malformed_id_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"f\x07abc\n".to_vec()), WireMode::Text);
        assert!(matches!(
            reader.read_frame(),
            Err(crate::Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_truncated_text_frame_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"echo\x075".to_vec()), WireMode::Text);
        assert!(matches!(
            reader.read_frame(),
            Err(crate::Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_clean_eof_yields_none() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), WireMode::Text);
        assert_eq!(reader.read_frame().unwrap(), None);
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), WireMode::Binary);
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn test_binary_round_trip() {
        let mut bag = ParamBag::new();
        bag.insert("key", vec![0u8, 9, 10, 7, 92]);
        let mut wire = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut wire, WireMode::Binary);
            writer.send_call(b"do_it", &bag, Some(9), Some(4)).unwrap();
            writer.send_return(Some(9), &ParamBag::new()).unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(wire), WireMode::Binary);
        assert_eq!(
            read_all(&mut reader),
            vec![
                Frame::Param {
                    key: b"key".to_vec(),
                    value: vec![0, 9, 10, 7, 92],
                },
                Frame::Call {
                    func: b"do_it".to_vec(),
                    id: Some(9),
                    recv_id: Some(4),
                },
                Frame::Return { id: Some(9) },
            ]
        );
    }

    #[test]
    fn test_binary_anonymous_ids_encode_as_zero() {
        let mut wire = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut wire, WireMode::Binary);
            writer
                .send_call(b"f", &ParamBag::new(), None, None)
                .unwrap();
            writer.send_return(None, &ParamBag::new()).unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(wire), WireMode::Binary);
        assert_eq!(
            read_all(&mut reader),
            vec![
                Frame::Call {
                    func: b"f".to_vec(),
                    id: None,
                    recv_id: None,
                },
                Frame::Return { id: None },
            ]
        );
    }

    #[test]
    fn test_binary_path_accepts_text_acknowledgement() {
        let mut reader = FrameReader::new(
            Cursor::new(b"O\tK\n\x071\n".to_vec()),
            WireMode::Binary,
        );
        assert_eq!(
            read_all(&mut reader),
            vec![
                Frame::Param {
                    key: b"O".to_vec(),
                    value: b"K".to_vec(),
                },
                Frame::Return { id: Some(1) },
            ]
        );
    }

    #[test]
    fn test_binary_unknown_type_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![0xEEu8]), WireMode::Binary);
        assert!(matches!(
            reader.read_frame(),
            Err(crate::Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_text_writer_escapes_fields() {
        let mut bag = ParamBag::new();
        bag.insert("ta\tb", "new\nline");
        let mut wire = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut wire, WireMode::Text);
            writer.send_call(b"fu\\nc", &bag, Some(3), None).unwrap();
        }
        assert_eq!(
            wire,
            b"ta\\x09b\tnew\\x0aline\nfu\\x5cnc\x073\n".to_vec()
        );
    }

    #[test]
    fn test_writer_flushes_mid_frame_past_threshold() {
        struct CountingWriter {
            writes: Vec<usize>,
        }
        impl Write for CountingWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.writes.push(buf.len());
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut bag = ParamBag::new();
        for i in 0..20 {
            bag.insert(format!("key-{}", i), "v".repeat(1024));
        }
        let mut sink = CountingWriter { writes: Vec::new() };
        {
            let mut writer = FrameWriter::new(&mut sink, WireMode::Text);
            writer.send_call(b"bulk", &bag, Some(1), None).unwrap();
        }
        // ~20 KB of params must not arrive as a single write.
        assert!(sink.writes.len() > 1);
    }
}
