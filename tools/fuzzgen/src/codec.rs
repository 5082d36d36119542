//! Binary value log.
//!
//! A log is a plain concatenation of records:
//!
//! ```text
//! [tag: u8][payload: width(tag) bytes, LE][decision id: u64 LE]
//! ```
//!
//! There is no header, separator, or checksum. The payload width is implied by
//! the tag, so a reader must validate the tag before it consumes anything else.

use crate::errors::FuzzError;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const DECISION_ID_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypeTag {
    I64 = 1,
    U64 = 2,
    F64 = 3,
    I32 = 4,
    U32 = 5,
    I16 = 6,
    U16 = 7,
    I8 = 8,
    U8 = 9,
    F32 = 10,
    Bool = 11,
}

impl TypeTag {
    pub const ALL: [TypeTag; 11] = [
        Self::I64,
        Self::U64,
        Self::F64,
        Self::I32,
        Self::U32,
        Self::I16,
        Self::U16,
        Self::I8,
        Self::U8,
        Self::F32,
        Self::Bool,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_u8() == value)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Payload width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I16 | Self::U16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::F32 => "f32",
            Self::Bool => "bool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == value)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed numeric value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum Scalar {
    I64(i64),
    U64(u64),
    F64(f64),
    I32(i32),
    U32(u32),
    I16(i16),
    U16(u16),
    I8(i8),
    U8(u8),
    F32(f32),
    Bool(bool),
}

impl Scalar {
    pub fn tag(self) -> TypeTag {
        match self {
            Self::I64(_) => TypeTag::I64,
            Self::U64(_) => TypeTag::U64,
            Self::F64(_) => TypeTag::F64,
            Self::I32(_) => TypeTag::I32,
            Self::U32(_) => TypeTag::U32,
            Self::I16(_) => TypeTag::I16,
            Self::U16(_) => TypeTag::U16,
            Self::I8(_) => TypeTag::I8,
            Self::U8(_) => TypeTag::U8,
            Self::F32(_) => TypeTag::F32,
            Self::Bool(_) => TypeTag::Bool,
        }
    }

    pub fn to_raw(self) -> RawValue {
        let bits = match self {
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::F64(v) => v.to_bits(),
            Self::I32(v) => u64::from(v as u32),
            Self::U32(v) => u64::from(v),
            Self::I16(v) => u64::from(v as u16),
            Self::U16(v) => u64::from(v),
            Self::I8(v) => u64::from(v as u8),
            Self::U8(v) => u64::from(v),
            Self::F32(v) => u64::from(v.to_bits()),
            Self::Bool(v) => u64::from(v),
        };
        RawValue {
            tag: self.tag(),
            bits,
        }
    }

    /// Lossy numeric view, used for feature windows.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::I64(v) => v as f64,
            Self::U64(v) => v as f64,
            Self::F64(v) => v,
            Self::I32(v) => f64::from(v),
            Self::U32(v) => f64::from(v),
            Self::I16(v) => f64::from(v),
            Self::U16(v) => f64::from(v),
            Self::I8(v) => f64::from(v),
            Self::U8(v) => f64::from(v),
            Self::F32(v) => f64::from(v),
            Self::Bool(v) => f64::from(u8::from(v)),
        }
    }

    /// Integral view, `None` for floats.
    pub fn as_u64(self) -> Option<u64> {
        match self {
            Self::F32(_) | Self::F64(_) => None,
            Self::I64(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I8(v) => u64::try_from(v).ok(),
            other => Some(other.to_raw().bits),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Bit-exact form of a [`Scalar`]: the LE payload zero-extended into a `u64`.
///
/// Unlike `Scalar` this is `Eq + Hash + Ord`, so it can key tree edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawValue {
    pub tag: TypeTag,
    pub bits: u64,
}

impl RawValue {
    pub fn from_payload(tag: TypeTag, payload: &[u8]) -> Result<Self, FuzzError> {
        if payload.len() != tag.width() {
            return Err(FuzzError::Protocol(format!(
                "{tag} payload must be {} bytes, got {}",
                tag.width(),
                payload.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            tag,
            bits: u64::from_le_bytes(buf),
        })
    }

    pub fn payload(self) -> Vec<u8> {
        self.bits.to_le_bytes()[..self.tag.width()].to_vec()
    }

    pub fn to_scalar(self) -> Scalar {
        let b = self.bits;
        match self.tag {
            TypeTag::I64 => Scalar::I64(b as i64),
            TypeTag::U64 => Scalar::U64(b),
            TypeTag::F64 => Scalar::F64(f64::from_bits(b)),
            TypeTag::I32 => Scalar::I32(b as u32 as i32),
            TypeTag::U32 => Scalar::U32(b as u32),
            TypeTag::I16 => Scalar::I16(b as u16 as i16),
            TypeTag::U16 => Scalar::U16(b as u16),
            TypeTag::I8 => Scalar::I8(b as u8 as i8),
            TypeTag::U8 => Scalar::U8(b as u8),
            TypeTag::F32 => Scalar::F32(f32::from_bits(b as u32)),
            TypeTag::Bool => Scalar::Bool(b != 0),
        }
    }

    pub fn as_f64(self) -> f64 {
        self.to_scalar().as_f64()
    }
}

/// Rust types that can travel through the log.
pub trait LogValue: Copy + PartialOrd + fmt::Debug + Send + 'static {
    const TAG: TypeTag;
    fn into_scalar(self) -> Scalar;
    fn from_scalar(value: Scalar) -> Option<Self>;
}

macro_rules! log_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl LogValue for $ty {
                const TAG: TypeTag = TypeTag::$variant;

                fn into_scalar(self) -> Scalar {
                    Scalar::$variant(self)
                }

                fn from_scalar(value: Scalar) -> Option<Self> {
                    match value {
                        Scalar::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

log_value! {
    i64 => I64,
    u64 => U64,
    f64 => F64,
    i32 => I32,
    u32 => U32,
    i16 => I16,
    u16 => U16,
    i8 => I8,
    u8 => U8,
    f32 => F32,
    bool => Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub value: RawValue,
    pub decision_id: u64,
}

impl LogRecord {
    pub fn tag(&self) -> TypeTag {
        self.value.tag
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.value.tag.width() + DECISION_ID_WIDTH
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} id={}",
            self.value.tag,
            self.value.to_scalar(),
            self.decision_id
        )
    }
}

pub fn encode_record(value: RawValue, decision_id: u64, out: &mut Vec<u8>) {
    out.push(value.tag.as_u8());
    out.extend_from_slice(&value.payload());
    out.extend_from_slice(&decision_id.to_le_bytes());
}

/// Append-only record sink.
pub struct LogWriter<W> {
    inner: W,
    label: String,
    flush_each_record: bool,
    records: u64,
    scratch: Vec<u8>,
}

impl LogWriter<BufWriter<File>> {
    /// Creates (truncating) the log file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, FuzzError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FuzzError::file_access(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| FuzzError::file_access(path, e))?;
        Ok(Self::new(BufWriter::new(file), path.display().to_string()))
    }
}

impl<W: Write> LogWriter<W> {
    pub fn new(inner: W, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            flush_each_record: true,
            records: 0,
            scratch: Vec::with_capacity(1 + 8 + DECISION_ID_WIDTH),
        }
    }

    pub fn with_flush_each_record(mut self, flush: bool) -> Self {
        self.flush_each_record = flush;
        self
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write_raw(&mut self, value: RawValue, decision_id: u64) -> Result<(), FuzzError> {
        self.scratch.clear();
        encode_record(value, decision_id, &mut self.scratch);
        self.inner
            .write_all(&self.scratch)
            .map_err(|e| FuzzError::file_access(&self.label, e))?;
        // A crashing harness must still leave a complete log behind.
        if self.flush_each_record {
            self.flush()?;
        }
        self.records += 1;
        Ok(())
    }

    pub fn write_value<T: LogValue>(&mut self, value: T, decision_id: u64) -> Result<(), FuzzError> {
        self.write_raw(value.into_scalar().to_raw(), decision_id)
    }

    pub fn flush(&mut self) -> Result<(), FuzzError> {
        self.inner
            .flush()
            .map_err(|e| FuzzError::file_access(&self.label, e))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send + 'static> LogWriter<W> {
    pub fn boxed(self) -> LogWriter<Box<dyn Write + Send>> {
        LogWriter {
            inner: Box::new(self.inner),
            label: self.label,
            flush_each_record: self.flush_each_record,
            records: self.records,
            scratch: self.scratch,
        }
    }
}

/// Strictly sequential record source.
pub struct LogReader<R> {
    inner: R,
    label: String,
    offset: u64,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FuzzError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| FuzzError::file_access(path, e))?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            offset: 0,
        }
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next record of any type. `Ok(None)` at a clean end of log.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, FuzzError> {
        let start = self.offset;
        let Some(tag_byte) = self.read_tag_byte()? else {
            return Ok(None);
        };
        let tag = TypeTag::from_u8(tag_byte).ok_or(FuzzError::UnknownTag(tag_byte))?;
        let (value, decision_id) = self.read_body(tag, start)?;
        Ok(Some(LogRecord { value, decision_id }))
    }

    /// Reads the next record, which must carry `expected`. The tag is checked
    /// before the payload is consumed.
    pub fn read_expecting(&mut self, expected: TypeTag) -> Result<(RawValue, u64), FuzzError> {
        let start = self.offset;
        let tag_byte = self
            .read_tag_byte()?
            .ok_or(FuzzError::TruncatedLog { offset: start })?;
        if tag_byte != expected.as_u8() {
            return Err(FuzzError::TagMismatch {
                expected: expected.as_u8(),
                found: tag_byte,
                offset: start,
            });
        }
        self.read_body(expected, start)
    }

    pub fn read_value<T: LogValue>(&mut self) -> Result<T, FuzzError> {
        let offset = self.offset;
        let (raw, _decision_id) = self.read_expecting(T::TAG)?;
        T::from_scalar(raw.to_scalar()).ok_or(FuzzError::TagMismatch {
            expected: T::TAG.as_u8(),
            found: raw.tag.as_u8(),
            offset,
        })
    }

    pub fn boxed(self) -> LogReader<Box<dyn Read + Send>>
    where
        R: Send + 'static,
    {
        LogReader {
            inner: Box::new(self.inner),
            label: self.label,
            offset: self.offset,
        }
    }

    pub fn records(&mut self) -> Records<'_, R> {
        Records {
            reader: self,
            done: false,
        }
    }

    fn read_tag_byte(&mut self) -> Result<Option<u8>, FuzzError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FuzzError::file_access(&self.label, e)),
            }
        }
    }

    fn read_body(&mut self, tag: TypeTag, start: u64) -> Result<(RawValue, u64), FuzzError> {
        let mut payload = [0u8; 8];
        let width = tag.width();
        self.read_exact_at(&mut payload[..width], start)?;
        let value = RawValue::from_payload(tag, &payload[..width])?;
        let mut id = [0u8; DECISION_ID_WIDTH];
        self.read_exact_at(&mut id, start)?;
        Ok((value, u64::from_le_bytes(id)))
    }

    fn read_exact_at(&mut self, buf: &mut [u8], start: u64) -> Result<(), FuzzError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(FuzzError::TruncatedLog { offset: start })
            }
            Err(e) => Err(FuzzError::file_access(&self.label, e)),
        }
    }
}

pub struct Records<'a, R> {
    reader: &'a mut LogReader<R>,
    done: bool,
}

impl<R: Read> Iterator for Records<'_, R> {
    type Item = Result<LogRecord, FuzzError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn record_layout_is_tag_payload_id() {
        let mut writer = LogWriter::new(Vec::new(), "mem");
        writer.write_value(-2i32, 7).expect("write");
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 1 + 4 + 8);
        assert_eq!(bytes[0], TypeTag::I32.as_u8());
        assert_eq!(&bytes[1..5], &(-2i32).to_le_bytes());
        assert_eq!(&bytes[5..], &7u64.to_le_bytes());
    }

    #[test]
    fn reader_rejects_mismatched_tag_before_payload() {
        let mut writer = LogWriter::new(Vec::new(), "mem");
        writer.write_value(1.5f64, 3).expect("write");
        let mut reader = LogReader::new(Cursor::new(writer.into_inner()), "mem");
        let err = reader.read_value::<u64>().expect_err("must mismatch");
        assert!(matches!(
            err,
            FuzzError::TagMismatch { expected: 2, found: 3, offset: 0 }
        ));
        assert_eq!(reader.offset(), 1);
    }

    #[test]
    fn clean_end_and_truncation_are_distinguished() {
        let mut writer = LogWriter::new(Vec::new(), "mem");
        writer.write_value(9u16, 1).expect("write");
        let mut bytes = writer.into_inner();

        let mut reader = LogReader::new(Cursor::new(bytes.clone()), "mem");
        assert!(reader.next_record().expect("first").is_some());
        assert!(reader.next_record().expect("eof").is_none());

        bytes.pop();
        let mut reader = LogReader::new(Cursor::new(bytes), "mem");
        let err = reader.next_record().expect_err("truncated");
        assert!(matches!(err, FuzzError::TruncatedLog { offset: 0 }));
    }

    #[test]
    fn unknown_tag_is_reported() {
        let mut reader = LogReader::new(Cursor::new(vec![0xEEu8, 0, 0]), "mem");
        let err = reader.next_record().expect_err("unknown");
        assert!(matches!(err, FuzzError::UnknownTag(0xEE)));
    }

    #[test]
    fn records_iterator_yields_mixed_types_in_order() {
        let mut writer = LogWriter::new(Vec::new(), "mem");
        writer.write_value(true, 1).expect("bool");
        writer.write_value(-5i8, 2).expect("i8");
        writer.write_value(2.25f32, 3).expect("f32");
        let mut reader = LogReader::new(Cursor::new(writer.into_inner()), "mem");
        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .expect("records");
        let rendered = records.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(rendered, vec!["bool true id=1", "i8 -5 id=2", "f32 2.25 id=3"]);
    }

    #[test]
    fn raw_value_keeps_negative_values_bit_exact() {
        let raw = Scalar::I16(-300).to_raw();
        assert_eq!(raw.payload(), (-300i16).to_le_bytes().to_vec());
        assert_eq!(raw.to_scalar(), Scalar::I16(-300));
        let back = RawValue::from_payload(TypeTag::I16, &raw.payload()).expect("payload");
        assert_eq!(back, raw);
    }

    #[test]
    fn payload_width_is_validated() {
        let err = RawValue::from_payload(TypeTag::I32, &[1, 2]).expect_err("short");
        assert!(format!("{err}").contains("must be 4 bytes"));
    }
}
