use super::{CodecError, Snap, encode_lat, encode_lon};
use geo::Coord;
use integer_encoding::VarInt;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, error};
use zerocopy::{I16, I32, I64, LE, U16, U32, U64};

/// A sequential writer producing files readable by [`FileScanner`](super::FileScanner).
///
/// Writers are used to build database files (and test fixtures).
/// Seeking backwards is supported for patching placeholder values such as offsets.
pub struct FileWriter {
    filename: String,
    writer: Option<BufWriter<File>>,
    pos: u64,
}

impl FileWriter {
    /// Creates (or truncates) the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, CodecError> {
        let path = path.as_ref();
        let filename = path.display().to_string();
        let file = File::create(path).map_err(|source| CodecError::Open {
            filename: filename.clone(),
            source,
        })?;

        debug!(filename, "Created file");

        Ok(Self {
            filename,
            writer: Some(BufWriter::new(file)),
            pos: 0,
        })
    }

    /// Flushes and closes the file.
    ///
    /// # Errors
    ///
    /// Fails if buffered data can't be flushed to disk.
    pub fn close(&mut self) -> Result<(), CodecError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|source| self.io_error(source))?;
            debug!(filename = self.filename, len = self.pos, "Closed file");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Moves to an absolute position, typically to patch a previously written placeholder.
    ///
    /// # Errors
    ///
    /// Fails if the underlying seek fails.
    pub fn set_pos(&mut self, pos: u64) -> Result<(), CodecError> {
        let writer = self.writer()?;
        let result = writer.seek(SeekFrom::Start(pos));
        result.map_err(|source| self.io_error(source))?;
        self.pos = pos;
        Ok(())
    }

    /// Writes raw bytes.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let writer = self.writer()?;
        let result = writer.write_all(bytes);
        result.map_err(|source| self.io_error(source))?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.write_u8(u8::from(value))
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.write_bytes(&[value])
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_u16(&mut self, value: u16) -> Result<(), CodecError> {
        write_le!(self, U16<LE>, value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        write_le!(self, U32<LE>, value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_u64(&mut self, value: u64) -> Result<(), CodecError> {
        write_le!(self, U64<LE>, value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_i16(&mut self, value: i16) -> Result<(), CodecError> {
        write_le!(self, I16<LE>, value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_i32(&mut self, value: i32) -> Result<(), CodecError> {
        write_le!(self, I32<LE>, value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_i64(&mut self, value: i64) -> Result<(), CodecError> {
        write_le!(self, I64<LE>, value)
    }

    fn write_varint<T: VarInt>(&mut self, value: T) -> Result<usize, CodecError> {
        let mut buf = [0u8; super::MAX_VARINT_LEN_64];
        let len = value.encode_var(&mut buf);
        self.write_bytes(&buf[..len])?;
        Ok(len)
    }

    /// Writes an unsigned varint, returning the number of bytes used.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_varint_u64(&mut self, value: u64) -> Result<usize, CodecError> {
        self.write_varint(value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_varint_u32(&mut self, value: u32) -> Result<usize, CodecError> {
        self.write_varint(u64::from(value))
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_varint_u16(&mut self, value: u16) -> Result<usize, CodecError> {
        self.write_varint(u64::from(value))
    }

    /// Writes a zig-zag encoded signed varint, returning the number of bytes used.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_varint_i64(&mut self, value: i64) -> Result<usize, CodecError> {
        self.write_varint(value)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_varint_i32(&mut self, value: i32) -> Result<usize, CodecError> {
        self.write_varint(i64::from(value))
    }

    /// Writes a coordinate (latitude first) in fixed 1e-7 degree precision.
    ///
    /// # Errors
    ///
    /// Fails if the coordinate is outside the valid lat/lon range, or on I/O errors.
    pub fn write_coord(&mut self, coord: Coord) -> Result<(), CodecError> {
        self.write_coord_snapped(coord, Snap::Nearest)
    }

    /// Like [`write_coord`](Self::write_coord), but snaps both axes in the given direction.
    /// Bounding box corners use this so the stored box still covers the original.
    ///
    /// # Errors
    ///
    /// Fails if the coordinate is outside the valid lat/lon range, or on I/O errors.
    pub fn write_coord_snapped(&mut self, coord: Coord, snap: Snap) -> Result<(), CodecError> {
        let (Some(lat), Some(lon)) = (encode_lat(coord.y, snap), encode_lon(coord.x, snap)) else {
            return Err(self.fail(CodecError::OutOfRange {
                filename: self.filename.clone(),
                pos: self.pos,
                value: format!("{coord:?}"),
                target: "geographic coordinate",
            }));
        };
        self.write_u32(lat)?;
        self.write_u32(lon)
    }

    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write_file_offset(&mut self, offset: u64) -> Result<(), CodecError> {
        self.write_u64(offset)
    }

    /// Writes a file offset using exactly `width` bytes.
    /// Use [`bytes_needed_for_offset`](super::bytes_needed_for_offset) to pick the width.
    ///
    /// # Errors
    ///
    /// Fails if `width` is not in 1..=8, if the offset does not fit, or on I/O errors.
    pub fn write_file_offset_sized(&mut self, offset: u64, width: u8) -> Result<(), CodecError> {
        if !(1..=8).contains(&width) {
            return Err(self.fail(CodecError::InvalidOffsetWidth {
                filename: self.filename.clone(),
                pos: self.pos,
                width,
            }));
        }
        if super::bytes_needed_for_offset(offset) > width {
            return Err(self.fail(CodecError::OutOfRange {
                filename: self.filename.clone(),
                pos: self.pos,
                value: offset.to_string(),
                target: "sized file offset",
            }));
        }

        let value = U64::<LE>::new(offset);
        let bytes = zerocopy::IntoBytes::as_bytes(&value);
        self.write_bytes(&bytes[..usize::from(width)])
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, CodecError> {
        self.writer.as_mut().ok_or_else(|| CodecError::NotOpen {
            filename: self.filename.clone(),
        })
    }

    fn io_error(&self, source: std::io::Error) -> CodecError {
        self.fail(CodecError::Io {
            filename: self.filename.clone(),
            pos: self.pos,
            source,
        })
    }

    fn fail(&self, error: CodecError) -> CodecError {
        error!(filename = self.filename, pos = self.pos, "{error}");
        error
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close {} on drop: {e}", self.filename);
        }
    }
}
