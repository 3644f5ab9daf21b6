//! Binary tensor dump format.
//!
//! Layout:
//! - 32-byte ASCII header: `"W H D C"` (width, height, plane count, channel
//!   count) followed by NUL padding
//! - little-endian `f32` payload in [`PlanarTensor`] order: plane by plane,
//!   pixels row-major, four floats per pixel
//!
//! Headers with only three integers are still accepted; their channel count
//! is taken as `D * 4`. Integers after the fourth are ignored.

use crate::error::{GraphError, Result};
use crate::graph::TensorShape;
use crate::layout::PlanarTensor;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Size of the ASCII header in bytes.
pub const DUMP_HEADER_LEN: usize = 32;

/// Parsed dump header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub channels: u32,
}

impl DumpHeader {
    pub fn for_shape(shape: TensorShape) -> Self {
        Self {
            width: shape.width,
            height: shape.height,
            depth: shape.planes(),
            channels: shape.channels,
        }
    }

    /// Number of payload floats that follow the header.
    pub fn payload_len(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize * 4
    }

    pub fn encode(&self) -> [u8; DUMP_HEADER_LEN] {
        let text = format!("{} {} {} {}", self.width, self.height, self.depth, self.channels);
        let mut header = [0u8; DUMP_HEADER_LEN];
        let len = text.len().min(DUMP_HEADER_LEN - 1);
        header[..len].copy_from_slice(&text.as_bytes()[..len]);
        header
    }

    pub fn decode(bytes: &[u8; DUMP_HEADER_LEN]) -> Result<Self> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(DUMP_HEADER_LEN);
        let text = std::str::from_utf8(&bytes[..end])
            .map_err(|e| GraphError::Dump(format!("header is not ASCII: {e}")))?;

        let fields = text
            .split_whitespace()
            .take(4)
            .map(|f| {
                f.parse::<u32>()
                    .map_err(|e| GraphError::Dump(format!("bad header field '{f}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let header = match fields.as_slice() {
            &[width, height, depth] => Self {
                width,
                height,
                depth,
                channels: depth * 4,
            },
            &[width, height, depth, channels] => Self {
                width,
                height,
                depth,
                channels,
            },
            _ => {
                return Err(GraphError::Dump(format!(
                    "header '{text}' needs at least three integers"
                )));
            }
        };
        if header.channels.div_ceil(4) != header.depth {
            return Err(GraphError::Dump(format!(
                "header '{text}': {} channels do not fit {} planes",
                header.channels, header.depth
            )));
        }
        Ok(header)
    }
}

/// Write `tensor` in dump format.
pub fn write_dump<W: Write>(mut writer: W, tensor: &PlanarTensor) -> Result<()> {
    writer.write_all(&DumpHeader::for_shape(tensor.shape).encode())?;
    let mut payload = Vec::with_capacity(tensor.data.len() * 4);
    for value in &tensor.data {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read a dump.
///
/// With `channels` the result has that channel count (which must fit the
/// header's plane count) and padding lanes are zeroed. Without it the
/// channel count recorded in the header is used.
pub fn read_dump<R: Read>(mut reader: R, channels: Option<u32>) -> Result<PlanarTensor> {
    let mut header_bytes = [0u8; DUMP_HEADER_LEN];
    reader.read_exact(&mut header_bytes)?;
    let header = DumpHeader::decode(&header_bytes)?;

    let channels = match channels {
        Some(c) if c.div_ceil(4) == header.depth => c,
        Some(c) => {
            return Err(GraphError::Dump(format!(
                "{c} channels do not fit {} planes",
                header.depth
            )));
        }
        None => header.channels,
    };

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    if payload.len() != header.payload_len() * 4 {
        return Err(GraphError::Dump(format!(
            "payload has {} bytes, header {}x{}x{} needs {}",
            payload.len(),
            header.width,
            header.height,
            header.depth,
            header.payload_len() * 4
        )));
    }

    let data = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    PlanarTensor::from_raw(TensorShape::new(header.width, header.height, channels), data)
}

/// Write a dump file, creating parent directories.
pub fn save_dump(path: impl AsRef<Path>, tensor: &PlanarTensor) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_dump(BufWriter::new(File::create(path)?), tensor)
}

/// Read a dump file.
pub fn load_dump(path: impl AsRef<Path>, channels: Option<u32>) -> Result<PlanarTensor> {
    read_dump(BufReader::new(File::open(path)?), channels)
}

/// Write HWC rows as text, one row of `row_len` values per line. Every
/// value is followed by `", "`, including the last one in a row.
pub fn write_text_rows<W: Write>(mut writer: W, values: &[f32], row_len: usize) -> Result<()> {
    for row in values.chunks(row_len.max(1)) {
        for value in row {
            write!(writer, "{value}, ")?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
