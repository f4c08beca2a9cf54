//! Minimal OSC 1.0 message codec
//!
//! Supports the argument types the stream protocol uses: `i` (int32),
//! `h` (int64), `f` (float32), `d` (float64), `s` (string), `b` (blob),
//! `t` (time tag), `T`/`F` (booleans) and `N` (nil). All values are big
//! endian; strings and blobs are padded to 4-byte boundaries.
//!
//! Encoding goes through [`OscWriter`], which writes straight into a caller
//! supplied buffer so that hot paths can reuse one allocation. Decoding
//! produces an owned [`OscMessage`].

use thiserror::Error;

use crate::time::NtpTime;

/// Errors produced while decoding OSC data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OscError {
    #[error("message truncated")]
    Truncated,

    #[error("address must start with '/'")]
    BadAddress,

    #[error("missing type tag string")]
    MissingTypeTags,

    #[error("string is not valid UTF-8 or not terminated")]
    BadString,

    #[error("unsupported type tag '{0}'")]
    UnsupportedType(char),

    #[error("argument {index}: expected {expected}")]
    ArgType { index: usize, expected: &'static str },

    #[error("missing argument {0}")]
    MissingArg(usize),
}

/// One OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Time(NtpTime),
    Bool(bool),
    Nil,
}

impl OscArg {
    fn tag(&self) -> u8 {
        match self {
            OscArg::Int(_) => b'i',
            OscArg::Long(_) => b'h',
            OscArg::Float(_) => b'f',
            OscArg::Double(_) => b'd',
            OscArg::String(_) => b's',
            OscArg::Blob(_) => b'b',
            OscArg::Time(_) => b't',
            OscArg::Bool(true) => b'T',
            OscArg::Bool(false) => b'F',
            OscArg::Nil => b'N',
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        OscArg::Int(v)
    }
}

impl From<i64> for OscArg {
    fn from(v: i64) -> Self {
        OscArg::Long(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        OscArg::Float(v)
    }
}

impl From<f64> for OscArg {
    fn from(v: f64) -> Self {
        OscArg::Double(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        OscArg::String(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        OscArg::String(v)
    }
}

impl From<Vec<u8>> for OscArg {
    fn from(v: Vec<u8>) -> Self {
        OscArg::Blob(v)
    }
}

impl From<&[u8]> for OscArg {
    fn from(v: &[u8]) -> Self {
        OscArg::Blob(v.to_vec())
    }
}

impl From<NtpTime> for OscArg {
    fn from(v: NtpTime) -> Self {
        OscArg::Time(v)
    }
}

impl From<bool> for OscArg {
    fn from(v: bool) -> Self {
        OscArg::Bool(v)
    }
}

impl From<Option<Vec<u8>>> for OscArg {
    fn from(v: Option<Vec<u8>>) -> Self {
        v.map_or(OscArg::Nil, OscArg::Blob)
    }
}

fn padded(len: usize) -> usize {
    (len + 4) & !3
}

fn blob_padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Streaming OSC encoder
///
/// The type tag string is written up front, so the caller declares the
/// argument types before writing the values:
///
/// ```ignore
/// let mut w = OscWriter::new(&mut buf, "/jam/sink/1/stop", ",ii");
/// w.int(source_id).int(stream_id);
/// ```
pub struct OscWriter<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> OscWriter<'a> {
    /// Start a message, appending to `out`
    pub fn new(out: &'a mut Vec<u8>, address: &str, type_tags: &str) -> Self {
        let mut writer = Self { out };
        writer.write_str(address);
        writer.write_str(type_tags);
        writer
    }

    fn write_str(&mut self, s: &str) {
        self.out.extend_from_slice(s.as_bytes());
        let pad = padded(s.len()) - s.len();
        self.out.extend(std::iter::repeat(0u8).take(pad));
    }

    pub fn int(&mut self, v: i32) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn long(&mut self, v: i64) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn float(&mut self, v: f32) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn double(&mut self, v: f64) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn time(&mut self, v: NtpTime) -> &mut Self {
        self.out.extend_from_slice(&v.to_bits().to_be_bytes());
        self
    }

    pub fn string(&mut self, v: &str) -> &mut Self {
        self.write_str(v);
        self
    }

    pub fn blob(&mut self, v: &[u8]) -> &mut Self {
        self.out
            .extend_from_slice(&(v.len() as i32).to_be_bytes());
        self.out.extend_from_slice(v);
        let pad = blob_padded(v.len()) - v.len();
        self.out.extend(std::iter::repeat(0u8).take(pad));
        self
    }

    /// Write an already tagged argument
    pub fn arg(&mut self, arg: &OscArg) -> &mut Self {
        match arg {
            OscArg::Int(v) => self.int(*v),
            OscArg::Long(v) => self.long(*v),
            OscArg::Float(v) => self.float(*v),
            OscArg::Double(v) => self.double(*v),
            OscArg::String(v) => self.string(v),
            OscArg::Blob(v) => self.blob(v),
            OscArg::Time(v) => self.time(*v),
            OscArg::Bool(_) | OscArg::Nil => self,
        }
    }
}

/// Decoded OSC message
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    /// Builder-style argument append
    pub fn with(mut self, arg: impl Into<OscArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<OscArg>) {
        self.args.push(arg.into());
    }

    /// Append the encoded message to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        for arg in &self.args {
            tags.push(arg.tag() as char);
        }
        let mut writer = OscWriter::new(out, &self.address, &tags);
        for arg in &self.args {
            writer.arg(arg);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, OscError> {
        let mut reader = ByteReader { data, pos: 0 };
        let address = reader.string()?;
        if !address.starts_with('/') {
            return Err(OscError::BadAddress);
        }
        if reader.remaining() == 0 {
            // Type tags are optional in OSC 1.0; treat as no arguments
            return Ok(Self {
                address: address.to_string(),
                args: Vec::new(),
            });
        }
        let tags = reader.string()?;
        let tags = tags.strip_prefix(',').ok_or(OscError::MissingTypeTags)?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => OscArg::Int(i32::from_be_bytes(reader.array()?)),
                'h' => OscArg::Long(i64::from_be_bytes(reader.array()?)),
                'f' => OscArg::Float(f32::from_be_bytes(reader.array()?)),
                'd' => OscArg::Double(f64::from_be_bytes(reader.array()?)),
                't' => OscArg::Time(NtpTime::from_bits(u64::from_be_bytes(reader.array()?))),
                's' | 'S' => OscArg::String(reader.string()?.to_string()),
                'b' => OscArg::Blob(reader.blob()?.to_vec()),
                'T' => OscArg::Bool(true),
                'F' => OscArg::Bool(false),
                'N' => OscArg::Nil,
                other => return Err(OscError::UnsupportedType(other)),
            };
            args.push(arg);
        }

        Ok(Self {
            address: address.to_string(),
            args,
        })
    }

    /// Sequential typed access to the arguments
    pub fn reader(&self) -> ArgReader<'_> {
        ArgReader {
            args: &self.args,
            index: 0,
        }
    }
}

/// Read just the address pattern of an encoded message
pub fn peek_address(data: &[u8]) -> Result<&str, OscError> {
    let mut reader = ByteReader { data, pos: 0 };
    let address = reader.string()?;
    if !address.starts_with('/') {
        return Err(OscError::BadAddress);
    }
    Ok(address)
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], OscError> {
        if self.remaining() < len {
            return Err(OscError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], OscError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    fn string(&mut self) -> Result<&'a str, OscError> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OscError::BadString)?;
        let bytes = self.take(padded(len))?;
        std::str::from_utf8(&bytes[..len]).map_err(|_| OscError::BadString)
    }

    fn blob(&mut self) -> Result<&'a [u8], OscError> {
        let len = i32::from_be_bytes(self.array()?);
        if len < 0 {
            return Err(OscError::Truncated);
        }
        let len = len as usize;
        let bytes = self.take(blob_padded(len))?;
        Ok(&bytes[..len])
    }
}

/// Typed cursor over decoded arguments
pub struct ArgReader<'a> {
    args: &'a [OscArg],
    index: usize,
}

impl<'a> ArgReader<'a> {
    fn next(&mut self) -> Result<&'a OscArg, OscError> {
        let arg = self
            .args
            .get(self.index)
            .ok_or(OscError::MissingArg(self.index))?;
        self.index += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: &'static str) -> OscError {
        OscError::ArgType {
            index: self.index - 1,
            expected,
        }
    }

    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.index)
    }

    /// Integer argument; 64-bit values are accepted when they fit
    pub fn int(&mut self) -> Result<i32, OscError> {
        match self.next()? {
            OscArg::Int(v) => Ok(*v),
            OscArg::Long(v) => i32::try_from(*v).map_err(|_| self.mismatch("int32")),
            _ => Err(self.mismatch("int32")),
        }
    }

    pub fn long(&mut self) -> Result<i64, OscError> {
        match self.next()? {
            OscArg::Long(v) => Ok(*v),
            OscArg::Int(v) => Ok(i64::from(*v)),
            _ => Err(self.mismatch("int64")),
        }
    }

    pub fn float(&mut self) -> Result<f32, OscError> {
        match self.next()? {
            OscArg::Float(v) => Ok(*v),
            OscArg::Double(v) => Ok(*v as f32),
            _ => Err(self.mismatch("float")),
        }
    }

    pub fn double(&mut self) -> Result<f64, OscError> {
        match self.next()? {
            OscArg::Double(v) => Ok(*v),
            OscArg::Float(v) => Ok(f64::from(*v)),
            _ => Err(self.mismatch("double")),
        }
    }

    pub fn time(&mut self) -> Result<NtpTime, OscError> {
        match self.next()? {
            OscArg::Time(v) => Ok(*v),
            _ => Err(self.mismatch("time tag")),
        }
    }

    pub fn string(&mut self) -> Result<&'a str, OscError> {
        match self.next()? {
            OscArg::String(v) => Ok(v),
            _ => Err(self.mismatch("string")),
        }
    }

    pub fn blob(&mut self) -> Result<&'a [u8], OscError> {
        match self.next()? {
            OscArg::Blob(v) => Ok(v),
            _ => Err(self.mismatch("blob")),
        }
    }

    /// Blob or nil
    pub fn opt_blob(&mut self) -> Result<Option<&'a [u8]>, OscError> {
        match self.next()? {
            OscArg::Blob(v) => Ok(Some(v)),
            OscArg::Nil => Ok(None),
            _ => Err(self.mismatch("blob or nil")),
        }
    }

    /// String or nil
    pub fn opt_string(&mut self) -> Result<Option<&'a str>, OscError> {
        match self.next()? {
            OscArg::String(v) => Ok(Some(v)),
            OscArg::Nil => Ok(None),
            _ => Err(self.mismatch("string or nil")),
        }
    }

    pub fn bool(&mut self) -> Result<bool, OscError> {
        match self.next()? {
            OscArg::Bool(v) => Ok(*v),
            OscArg::Int(v) => Ok(*v != 0),
            _ => Err(self.mismatch("bool")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let msg = OscMessage::new("/a").with(1i32);
        let bytes = msg.to_bytes();
        // "/a\0\0" ",i\0\0" then 4 bytes
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], b"/a\0\0");
        assert_eq!(&bytes[4..8], b",i\0\0");
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_decode_all_types() {
        let msg = OscMessage::new("/jam/test")
            .with(-5i32)
            .with(1i64 << 40)
            .with(0.5f32)
            .with(48000.0f64)
            .with("hello")
            .with(vec![1u8, 2, 3])
            .with(NtpTime::from_bits(0x1234_5678_9abc_def0))
            .with(true)
            .with(None::<Vec<u8>>);

        let decoded = OscMessage::decode(&msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);

        let mut r = decoded.reader();
        assert_eq!(r.int().unwrap(), -5);
        assert_eq!(r.long().unwrap(), 1 << 40);
        assert_eq!(r.float().unwrap(), 0.5);
        assert_eq!(r.double().unwrap(), 48000.0);
        assert_eq!(r.string().unwrap(), "hello");
        assert_eq!(r.blob().unwrap(), &[1, 2, 3]);
        assert_eq!(r.time().unwrap().to_bits(), 0x1234_5678_9abc_def0);
        assert!(r.bool().unwrap());
        assert_eq!(r.opt_blob().unwrap(), None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated_message() {
        let bytes = OscMessage::new("/x").with(7i32).to_bytes();
        let err = OscMessage::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err, OscError::Truncated);
    }

    #[test]
    fn test_unterminated_address() {
        assert_eq!(OscMessage::decode(b"/abc"), Err(OscError::BadString));
    }

    #[test]
    fn test_type_mismatch() {
        let msg = OscMessage::new("/x").with("str");
        let mut r = msg.reader();
        assert!(matches!(r.int(), Err(OscError::ArgType { index: 0, .. })));
        assert!(matches!(r.int(), Err(OscError::MissingArg(1))));
    }

    #[test]
    fn test_peek_address() {
        let bytes = OscMessage::new("/jam/sink/3/data").with(1i32).to_bytes();
        assert_eq!(peek_address(&bytes).unwrap(), "/jam/sink/3/data");
        assert_eq!(peek_address(b"xyz\0"), Err(OscError::BadAddress));
    }

    #[test]
    fn test_writer_matches_message_encoding() {
        let mut buf = Vec::new();
        OscWriter::new(&mut buf, "/w", ",isb")
            .int(3)
            .string("abcd")
            .blob(&[9, 9]);
        let decoded = OscMessage::decode(&buf).unwrap();
        let expected = OscMessage::new("/w").with(3i32).with("abcd").with(vec![9u8, 9]);
        assert_eq!(decoded, expected);
    }
}
