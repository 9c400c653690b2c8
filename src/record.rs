use crate::metadata::{LengthMismatch, SequenceRecord};

use crc32fast::Hasher;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"R10K";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 16;
pub const RECORD_EXT: &str = "rec";

/// Upper bound on the body preallocation per compressed byte. The header's
/// `body_len` is only trusted after the body has actually been inflated.
const PREALLOC_PER_COMPRESSED_BYTE: usize = 8;

const KEYS: [&str; 6] = ["seq_id", "vid", "length", "timestamps", "intrinsics", "poses"];

// Container format:
// header (uncompressed, HEADER_LEN bytes):
//   magic [4] | version u16 | field_count u16 | body_len u32 | body_crc32 u32
// body (deflate), field_count records of:
//   kind u8 | name_len u8 | name | ndim u8 | dims u32 x ndim | data_len u32 | data
// All integers and array elements are little endian.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str = 0,
    I64 = 1,
    F32 = 2,
}

impl FieldKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FieldKind::Str),
            1 => Some(FieldKind::I64),
            2 => Some(FieldKind::F32),
            _ => None,
        }
    }

    fn elem_size(self) -> usize {
        match self {
            FieldKind::Str => 1,
            FieldKind::I64 => 8,
            FieldKind::F32 => 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("not a sequence record (bad magic)")]
    BadMagic,
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),
    #[error("record is truncated")]
    Truncated,
    #[error("compressed body is corrupt: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("body checksum mismatch: header={expected:08x} actual={actual:08x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("field {name:?} has unknown element kind {kind}")]
    UnknownKind { name: String, kind: u8 },
    #[error("unexpected field {0:?}")]
    UnknownField(String),
    #[error("field {0:?} appears twice")]
    DuplicateField(String),
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("field {name:?} has kind {found:?}, expected {expected:?}")]
    FieldKind {
        name: &'static str,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("field {name:?} has shape {found:?}, expected {expected:?}")]
    Shape {
        name: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("field {name:?} holds {found} bytes, shape needs {expected}")]
    DataSize {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("field {0:?} is not valid UTF-8")]
    Utf8(&'static str),
    #[error("negative length {0}")]
    NegativeLength(i64),
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    #[error(transparent)]
    Ragged(#[from] LengthMismatch),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cannot read record {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write record {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
}

pub fn record_path(dir: &Path, sequence_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", sequence_id, RECORD_EXT))
}

/// Writes `<dir>/<sequence_id>.rec`, replacing any previous file.
pub fn save(record: &SequenceRecord, dir: &Path) -> Result<PathBuf, RecordError> {
    let path = record_path(dir, record.sequence_id());
    let write_err = |source| RecordError::Write {
        path: path.clone(),
        source,
    };

    let bytes = encode(record).map_err(write_err)?;
    std::fs::create_dir_all(dir).map_err(write_err)?;

    // Readers never observe a half-written container.
    let tmp = path.with_extension(format!("{}.tmp", RECORD_EXT));
    std::fs::write(&tmp, &bytes).map_err(write_err)?;
    std::fs::rename(&tmp, &path).map_err(write_err)?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<SequenceRecord, RecordError> {
    let bytes = std::fs::read(path).map_err(|source| RecordError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes).map_err(|source| RecordError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

pub fn encode(record: &SequenceRecord) -> std::io::Result<Vec<u8>> {
    let n = record.frame_count();
    let mut body = Vec::with_capacity(64 + n * (8 + 16 + 48));

    put_field(&mut body, "seq_id", FieldKind::Str, &[], record.sequence_id().as_bytes());
    put_field(&mut body, "vid", FieldKind::Str, &[], record.video_id().as_bytes());
    put_field(&mut body, "length", FieldKind::I64, &[], &(n as i64).to_le_bytes());

    let timestamps = record
        .timestamps()
        .iter()
        .flat_map(|t| t.to_le_bytes())
        .collect::<Vec<u8>>();
    put_field(&mut body, "timestamps", FieldKind::I64, &[n], &timestamps);

    let intrinsics = record
        .intrinsics()
        .iter()
        .flatten()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<u8>>();
    put_field(&mut body, "intrinsics", FieldKind::F32, &[n, 4], &intrinsics);

    let poses = record
        .poses()
        .iter()
        .flatten()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<u8>>();
    put_field(&mut body, "poses", FieldKind::F32, &[n, 12], &poses);

    seal(&body, KEYS.len() as u16)
}

pub fn decode(bytes: &[u8]) -> Result<SequenceRecord, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated);
    }
    if bytes[0..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let field_count = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    let body_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    let compressed = &bytes[HEADER_LEN..];
    let mut body = Vec::with_capacity(body_capacity(body_len, compressed.len()));
    DeflateDecoder::new(compressed)
        .take(body_len as u64 + 1)
        .read_to_end(&mut body)
        .map_err(FormatError::Decompress)?;
    if body.len() != body_len {
        return Err(FormatError::Truncated);
    }
    let actual_crc = crc32(&body);
    if actual_crc != expected_crc {
        return Err(FormatError::Checksum {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    let mut reader = FieldReader { buf: &body, pos: 0 };
    let mut fields: HashMap<&'static str, RawField<'_>> = HashMap::new();
    for _ in 0..field_count {
        let field = reader.next_field()?;
        let key = KEYS
            .iter()
            .copied()
            .find(|k| *k == field.name)
            .ok_or_else(|| FormatError::UnknownField(field.name.to_string()))?;
        if fields.insert(key, field).is_some() {
            return Err(FormatError::DuplicateField(key.to_string()));
        }
    }
    let rest = reader.remaining();
    if rest != 0 {
        return Err(FormatError::TrailingBytes(rest));
    }

    let sequence_id = take_str(&mut fields, "seq_id")?;
    let video_id = take_str(&mut fields, "vid")?;
    let length = take_scalar_i64(&mut fields, "length")?;
    let n = usize::try_from(length).map_err(|_| FormatError::NegativeLength(length))?;

    let timestamps = take_array(&mut fields, "timestamps", FieldKind::I64, &[n])?
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect::<Vec<_>>();

    let intrinsics = take_array(&mut fields, "intrinsics", FieldKind::F32, &[n, 4])?
        .chunks_exact(16)
        .map(|row| {
            let mut out = [0f32; 4];
            for (slot, c) in out.iter_mut().zip(row.chunks_exact(4)) {
                *slot = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
            out
        })
        .collect::<Vec<_>>();

    let poses = take_array(&mut fields, "poses", FieldKind::F32, &[n, 12])?
        .chunks_exact(48)
        .map(|row| {
            let mut out = [0f32; 12];
            for (slot, c) in out.iter_mut().zip(row.chunks_exact(4)) {
                *slot = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
            out
        })
        .collect::<Vec<_>>();

    Ok(SequenceRecord::new(
        sequence_id,
        video_id,
        timestamps,
        intrinsics,
        poses,
    )?)
}

fn body_capacity(body_len: usize, compressed_len: usize) -> usize {
    body_len.min(compressed_len.saturating_mul(PREALLOC_PER_COMPRESSED_BYTE))
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

fn put_field(out: &mut Vec<u8>, name: &str, kind: FieldKind, dims: &[usize], data: &[u8]) {
    out.push(kind as u8);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(dims.len() as u8);
    for d in dims {
        out.extend_from_slice(&(*d as u32).to_le_bytes());
    }
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn seal(body: &[u8], field_count: u16) -> std::io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    enc.write_all(body)?;
    let compressed = enc.finish()?;

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&field_count.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(body).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[derive(Debug)]
struct RawField<'a> {
    name: &'a str,
    kind: FieldKind,
    dims: Vec<usize>,
    data: &'a [u8],
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(n).ok_or(FormatError::Truncated)?;
        if end > self.buf.len() {
            return Err(FormatError::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn next_field(&mut self) -> Result<RawField<'a>, FormatError> {
        let kind = self.u8()?;
        let name_len = self.u8()? as usize;
        let name = std::str::from_utf8(self.take(name_len)?)
            .map_err(|_| FormatError::UnknownField(String::from("<non-utf8 name>")))?;
        let kind = FieldKind::from_u8(kind).ok_or_else(|| FormatError::UnknownKind {
            name: name.to_string(),
            kind,
        })?;
        let ndim = self.u8()? as usize;
        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            dims.push(self.u32()? as usize);
        }
        let data_len = self.u32()? as usize;
        let data = self.take(data_len)?;
        Ok(RawField {
            name,
            kind,
            dims,
            data,
        })
    }
}

fn take_field<'a>(
    fields: &mut HashMap<&'static str, RawField<'a>>,
    name: &'static str,
    kind: FieldKind,
) -> Result<RawField<'a>, FormatError> {
    let field = fields.remove(name).ok_or(FormatError::MissingField(name))?;
    if field.kind != kind {
        return Err(FormatError::FieldKind {
            name,
            expected: kind,
            found: field.kind,
        });
    }
    Ok(field)
}

fn take_str(
    fields: &mut HashMap<&'static str, RawField<'_>>,
    name: &'static str,
) -> Result<String, FormatError> {
    let field = take_field(fields, name, FieldKind::Str)?;
    if !field.dims.is_empty() {
        return Err(FormatError::Shape {
            name,
            expected: vec![],
            found: field.dims,
        });
    }
    std::str::from_utf8(field.data)
        .map(str::to_string)
        .map_err(|_| FormatError::Utf8(name))
}

fn take_scalar_i64(
    fields: &mut HashMap<&'static str, RawField<'_>>,
    name: &'static str,
) -> Result<i64, FormatError> {
    let data = take_array(fields, name, FieldKind::I64, &[])?;
    Ok(i64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}

fn take_array<'a>(
    fields: &mut HashMap<&'static str, RawField<'a>>,
    name: &'static str,
    kind: FieldKind,
    shape: &[usize],
) -> Result<&'a [u8], FormatError> {
    let field = take_field(fields, name, kind)?;
    if field.dims != shape {
        return Err(FormatError::Shape {
            name,
            expected: shape.to_vec(),
            found: field.dims,
        });
    }
    let expected = shape.iter().product::<usize>() * kind.elem_size();
    if field.data.len() != expected {
        return Err(FormatError::DataSize {
            name,
            expected,
            found: field.data.len(),
        });
    }
    Ok(field.data)
}
