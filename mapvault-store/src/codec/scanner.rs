use super::{CodecError, MAX_VARINT_LEN_32, MAX_VARINT_LEN_64, decode_lat, decode_lon};
use geo::{Coord, coord};
use integer_encoding::VarInt;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, error};
use zerocopy::{I16, I32, I64, LE, U16, U32, U64};

/// How a [`FileScanner`] accesses the underlying file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AccessMode {
    /// Reads go through a buffered file handle; seeks discard the buffer.
    Buffered,
    /// The whole file is mapped into memory, making seeks free.
    #[default]
    MemoryMapped,
}

enum Source {
    Buffered(BufReader<File>),
    Mapped(Mmap),
}

/// A random access reader for files written by [`FileWriter`](super::FileWriter).
///
/// Any failure puts the scanner into a sticky error state.
/// From then on, every operation fails with [`CodecError::PreviousError`]
/// until the scanner is closed and reopened.
pub struct FileScanner {
    filename: String,
    source: Option<Source>,
    len: u64,
    pos: u64,
    has_error: bool,
}

impl FileScanner {
    /// Opens the file at `path` for reading.
    ///
    /// Empty files can't be mapped, so they are silently opened in buffered mode.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, inspected or mapped.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<Self, CodecError> {
        let path = path.as_ref();
        let filename = path.display().to_string();
        let open_error = |source| CodecError::Open {
            filename: filename.clone(),
            source,
        };

        let file = File::open(path).map_err(open_error)?;
        let len = file.metadata().map_err(open_error)?.len();

        let source = match mode {
            AccessMode::MemoryMapped if len > 0 => {
                // SAFETY: Database files are written once at import time and only read afterwards.
                // Modifying them while they are mapped is not supported.
                let mmap = unsafe { Mmap::map(&file) }.map_err(open_error)?;
                Source::Mapped(mmap)
            }
            _ => Source::Buffered(BufReader::new(file)),
        };

        debug!(filename, len, ?mode, "Opened file");

        Ok(Self {
            filename,
            source: Some(source),
            len,
            pos: 0,
            has_error: false,
        })
    }

    /// Closes the file. Closing an already closed scanner does nothing.
    pub fn close(&mut self) {
        if self.source.take().is_some() {
            debug!(filename = self.filename, "Closed file");
        }
        self.has_error = false;
        self.pos = 0;
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// The current byte position.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// The total length of the file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Moves to an absolute byte position.
    /// Seeking exactly to the end of the file is allowed.
    ///
    /// # Errors
    ///
    /// Fails when `pos` lies beyond the end of the file,
    /// or if the scanner is closed or in an error state.
    pub fn set_pos(&mut self, pos: u64) -> Result<(), CodecError> {
        self.check_state()?;
        if pos > self.len {
            return Err(self.fail(CodecError::SeekBeyondEnd {
                filename: self.filename.clone(),
                pos,
                len: self.len,
            }));
        }

        if let Some(Source::Buffered(reader)) = &mut self.source {
            if let Err(source) = reader.seek(SeekFrom::Start(pos)) {
                return Err(self.fail(CodecError::Io {
                    filename: self.filename.clone(),
                    pos,
                    source,
                }));
            }
        }

        self.pos = pos;
        Ok(())
    }

    /// Fills `buf` completely from the current position.
    ///
    /// # Errors
    ///
    /// Fails if fewer than `buf.len()` bytes remain.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        self.check_state()?;

        let wanted = buf.len() as u64;
        let end = self.pos.saturating_add(wanted);
        if end > self.len {
            return Err(self.fail(CodecError::Truncated {
                filename: self.filename.clone(),
                pos: self.pos,
                wanted,
                len: self.len,
            }));
        }

        let result = match &mut self.source {
            Some(Source::Mapped(mmap)) => {
                // Both bounds are checked against the mapping length above
                #[expect(clippy::cast_possible_truncation)]
                let range = self.pos as usize..end as usize;
                buf.copy_from_slice(&mmap[range]);
                Ok(())
            }
            Some(Source::Buffered(reader)) => reader.read_exact(buf),
            None => {
                return Err(CodecError::NotOpen {
                    filename: self.filename.clone(),
                });
            }
        };

        match result {
            Ok(()) => {
                self.pos = end;
                Ok(())
            }
            Err(source) => Err(self.fail(CodecError::Io {
                filename: self.filename.clone(),
                pos: self.pos,
                source,
            })),
        }
    }

    /// Reads exactly `N` bytes.
    ///
    /// # Errors
    ///
    /// Fails if fewer than `N` bytes remain.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut buf = [0; N];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads `count` raw bytes.
    ///
    /// # Errors
    ///
    /// Fails if fewer than `count` bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0; count];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads a single byte boolean. Any non-zero byte is `true`.
    ///
    /// # Errors
    ///
    /// Fails at the end of the file.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// # Errors
    ///
    /// Fails at the end of the file.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(read_le!(self, U16<LE>))
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(read_le!(self, U32<LE>))
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(read_le!(self, U64<LE>))
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(read_le!(self, I16<LE>))
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(read_le!(self, I32<LE>))
    }

    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(read_le!(self, I64<LE>))
    }

    /// Collects the raw bytes of one varint, including the terminating byte.
    fn read_varint_bytes<const LIMIT: usize>(&mut self) -> Result<([u8; LIMIT], usize), CodecError> {
        let start = self.pos;
        let mut buf = [0; LIMIT];
        for i in 0..LIMIT {
            let byte = self.read_u8()?;
            if let Some(slot) = buf.get_mut(i) {
                *slot = byte;
            }
            if byte & 0x80 == 0 {
                return Ok((buf, i + 1));
            }
        }

        Err(self.fail(CodecError::MalformedVarint {
            filename: self.filename.clone(),
            pos: start,
        }))
    }

    fn decode_varint<T: VarInt, const LIMIT: usize>(&mut self) -> Result<T, CodecError> {
        let start = self.pos;
        let (buf, len) = self.read_varint_bytes::<LIMIT>()?;
        match T::decode_var(&buf[..len]) {
            Some((value, read)) if read == len => Ok(value),
            _ => Err(self.fail(CodecError::MalformedVarint {
                filename: self.filename.clone(),
                pos: start,
            })),
        }
    }

    fn narrow<Wide, Narrow>(&mut self, start: u64, value: Wide) -> Result<Narrow, CodecError>
    where
        Wide: Copy + std::fmt::Display,
        Narrow: TryFrom<Wide>,
    {
        Narrow::try_from(value).map_err(|_| {
            self.fail(CodecError::OutOfRange {
                filename: self.filename.clone(),
                pos: start,
                value: value.to_string(),
                target: std::any::type_name::<Narrow>(),
            })
        })
    }

    /// Reads an unsigned varint.
    ///
    /// # Errors
    ///
    /// Fails if the varint is malformed, truncated or too large for a `u64`.
    pub fn read_varint_u64(&mut self) -> Result<u64, CodecError> {
        self.decode_varint::<u64, MAX_VARINT_LEN_64>()
    }

    /// Reads an unsigned varint that must fit into a `u32`.
    ///
    /// # Errors
    ///
    /// Fails if the varint is malformed, truncated or out of range.
    pub fn read_varint_u32(&mut self) -> Result<u32, CodecError> {
        let start = self.pos;
        let value = self.decode_varint::<u64, MAX_VARINT_LEN_32>()?;
        self.narrow(start, value)
    }

    /// Reads an unsigned varint that must fit into a `u16`.
    ///
    /// # Errors
    ///
    /// Fails if the varint is malformed, truncated or out of range.
    pub fn read_varint_u16(&mut self) -> Result<u16, CodecError> {
        let start = self.pos;
        let value = self.decode_varint::<u64, 3>()?;
        self.narrow(start, value)
    }

    /// Reads a zig-zag encoded signed varint.
    ///
    /// # Errors
    ///
    /// Fails if the varint is malformed or truncated.
    pub fn read_varint_i64(&mut self) -> Result<i64, CodecError> {
        self.decode_varint::<i64, MAX_VARINT_LEN_64>()
    }

    /// Reads a zig-zag encoded signed varint that must fit into an `i32`.
    ///
    /// # Errors
    ///
    /// Fails if the varint is malformed, truncated or out of range.
    pub fn read_varint_i32(&mut self) -> Result<i32, CodecError> {
        let start = self.pos;
        let value = self.decode_varint::<i64, MAX_VARINT_LEN_32>()?;
        self.narrow(start, value)
    }

    /// Reads a coordinate (latitude first) in fixed 1e-7 degree precision.
    ///
    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_coord(&mut self) -> Result<Coord, CodecError> {
        let lat = self.read_u32()?;
        let lon = self.read_u32()?;
        Ok(coord! { x: decode_lon(lon), y: decode_lat(lat) })
    }

    /// Reads a full width (8 byte) file offset.
    ///
    /// # Errors
    ///
    /// Fails if the file is truncated.
    pub fn read_file_offset(&mut self) -> Result<u64, CodecError> {
        self.read_u64()
    }

    /// Reads a file offset stored in `width` bytes.
    ///
    /// # Errors
    ///
    /// Fails if `width` is not in 1..=8 or if the file is truncated.
    pub fn read_file_offset_sized(&mut self, width: u8) -> Result<u64, CodecError> {
        self.check_state()?;
        if !(1..=8).contains(&width) {
            return Err(self.fail(CodecError::InvalidOffsetWidth {
                filename: self.filename.clone(),
                pos: self.pos,
                width,
            }));
        }

        let mut buf = [0u8; 8];
        self.read_into(&mut buf[..usize::from(width)])?;
        let value: U64<LE> = zerocopy::transmute!(buf);
        Ok(value.get())
    }

    fn check_state(&self) -> Result<(), CodecError> {
        if self.source.is_none() {
            Err(CodecError::NotOpen {
                filename: self.filename.clone(),
            })
        } else if self.has_error {
            Err(CodecError::PreviousError {
                filename: self.filename.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Marks the scanner as failed and logs the error.
    fn fail(&mut self, error: CodecError) -> CodecError {
        self.has_error = true;
        error!(filename = self.filename, pos = self.pos, "{error}");
        error
    }
}

impl std::fmt::Debug for FileScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileScanner")
            .field("filename", &self.filename)
            .field("is_open", &self.is_open())
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("has_error", &self.has_error)
            .finish()
    }
}
