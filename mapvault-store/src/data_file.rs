//! # Record data files
//!
//! A data file is a plain sequence of variable length records.
//! Records are addressed by their byte offset, which indexes hand out.

use crate::codec::{AccessMode, CodecError, FileScanner, FileWriter};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DataFileError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("'{filename}': offset {offset} is outside of the file ({len} bytes)")]
    InvalidOffset {
        filename: String,
        offset: u64,
        len: u64,
    },
    #[error("Lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// A record type which can be stored in a [`DataFile`].
pub trait Record: Sized {
    /// Reads a record starting at the current scanner position.
    /// The starting position is the record's offset.
    ///
    /// # Errors
    ///
    /// Fails if the data is truncated or malformed.
    fn read(scanner: &mut FileScanner) -> Result<Self, CodecError>;

    /// Writes the record at the current writer position.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if a value can't be represented.
    fn write(&self, writer: &mut FileWriter) -> Result<(), CodecError>;

    /// The offset this record was read from.
    fn offset(&self) -> u64;
}

/// Read access to a file of `T` records.
pub struct DataFile<T: Record> {
    filename: String,
    len: u64,
    scanner: Mutex<FileScanner>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> DataFile<T> {
    /// # Errors
    ///
    /// Fails if the file can't be opened.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<Self, DataFileError> {
        let scanner = FileScanner::open(path, mode)?;
        Ok(Self {
            filename: scanner.filename().to_string(),
            len: scanner.len(),
            scanner: Mutex::new(scanner),
            _record: PhantomData,
        })
    }

    /// Closes the file. Reads fail afterwards.
    pub fn close(&self) {
        if let Ok(mut scanner) = self.scanner.lock() {
            scanner.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.scanner.lock().is_ok_and(|scanner| scanner.is_open())
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Reads the record at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the offset is outside the file or the record can't be decoded.
    pub fn get_by_offset(&self, offset: u64) -> Result<Arc<T>, DataFileError> {
        let mut scanner = self.lock_scanner()?;
        self.read_at(&mut scanner, offset)
    }

    /// Reads the records at all `offsets`.
    ///
    /// Offsets are sorted and deduplicated first, so the file is read front to back,
    /// and the result is in offset order.
    ///
    /// # Errors
    ///
    /// Fails if any record can't be read.
    pub fn get_by_offsets(&self, offsets: &[u64]) -> Result<Vec<Arc<T>>, DataFileError> {
        let mut offsets = offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();

        let mut scanner = self.lock_scanner()?;
        offsets
            .into_iter()
            .map(|offset| self.read_at(&mut scanner, offset))
            .collect()
    }

    fn read_at(&self, scanner: &mut FileScanner, offset: u64) -> Result<Arc<T>, DataFileError> {
        // Checked up front so a bad offset from a caller doesn't poison the shared handle
        if offset >= self.len {
            return Err(DataFileError::InvalidOffset {
                filename: self.filename.clone(),
                offset,
                len: self.len,
            });
        }
        scanner.set_pos(offset)?;
        Ok(Arc::new(T::read(scanner)?))
    }

    fn lock_scanner(&self) -> Result<MutexGuard<'_, FileScanner>, DataFileError> {
        self.scanner
            .lock()
            .map_err(|e| DataFileError::PoisonedLock(e.to_string()))
    }
}

impl<T: Record> std::fmt::Debug for DataFile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("filename", &self.filename)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Appends `T` records to a new data file.
pub struct DataFileWriter<T: Record> {
    writer: FileWriter,
    count: usize,
    _record: PhantomData<fn(&T)>,
}

impl<T: Record> DataFileWriter<T> {
    /// # Errors
    ///
    /// Fails if the file can't be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, CodecError> {
        Ok(Self {
            writer: FileWriter::create(path)?,
            count: 0,
            _record: PhantomData,
        })
    }

    /// Appends a record, returning its offset.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write(&mut self, record: &T) -> Result<u64, CodecError> {
        let offset = self.writer.pos();
        record.write(&mut self.writer)?;
        self.count += 1;
        Ok(offset)
    }

    /// # Errors
    ///
    /// Fails if the file can't be flushed.
    pub fn close(mut self) -> Result<(), CodecError> {
        self.writer.close()?;
        debug!(
            filename = self.writer.filename(),
            records = self.count,
            "Wrote data file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{Area, MapObject, Node, Way};
    use geo::coord;
    use tempfile::TempDir;

    #[test]
    fn offsets_returned_by_writer_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ways.dat");

        let ways: Vec<Way> = (0..50u16)
            .map(|i| {
                let base = f64::from(i) * 0.01;
                Way::new(
                    i % 3,
                    (0..=i % 5)
                        .map(|j| coord! { x: 7.0 + base + f64::from(j) * 0.001, y: 43.0 + base })
                        .collect(),
                )
            })
            .collect();

        let mut writer = DataFileWriter::create(&path).unwrap();
        let offsets: Vec<u64> = ways.iter().map(|way| writer.write(way).unwrap()).collect();
        writer.close().unwrap();

        for mode in [AccessMode::Buffered, AccessMode::MemoryMapped] {
            let file: DataFile<Way> = DataFile::open(&path, mode).unwrap();
            for (way, offset) in ways.iter().zip(&offsets) {
                let read = file.get_by_offset(*offset).unwrap();
                assert_eq!(read.offset(), *offset);
                assert_eq!(read.type_id(), way.type_id());
                assert_eq!(read.coords().len(), way.coords().len());
            }

            // Out of order, with duplicates
            let batch = file
                .get_by_offsets(&[offsets[10], offsets[2], offsets[10]])
                .unwrap();
            assert_eq!(
                batch.iter().map(|way| way.offset()).collect::<Vec<_>>(),
                vec![offsets[2], offsets[10]]
            );
        }
    }

    #[test]
    fn invalid_offsets_do_not_poison_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nodes.dat");
        let mut writer = DataFileWriter::create(&path).unwrap();
        let offset = writer
            .write(&Node::new(1, coord! { x: 7.42, y: 43.73 }))
            .unwrap();
        writer.close().unwrap();

        let file: DataFile<Node> = DataFile::open(&path, AccessMode::Buffered).unwrap();
        assert!(matches!(
            file.get_by_offset(1_000),
            Err(DataFileError::InvalidOffset { offset: 1_000, .. })
        ));
        assert_eq!(file.get_by_offset(offset).unwrap().type_id(), 1);
    }

    #[test]
    fn areas_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("areas.dat");
        // Binary fractions survive the fixed point conversion exactly
        let ring = vec![
            coord! { x: 7.0, y: 43.0 },
            coord! { x: 7.5, y: 43.0 },
            coord! { x: 7.5, y: 43.25 },
        ];
        let mut writer = DataFileWriter::create(&path).unwrap();
        writer.write(&Area::new(9, vec![])).unwrap();
        let offset = writer.write(&Area::new(5, ring.clone())).unwrap();
        writer.close().unwrap();

        let file: DataFile<Area> = DataFile::open(&path, AccessMode::MemoryMapped).unwrap();
        let area = file.get_by_offset(offset).unwrap();
        assert_eq!(area.ring(), ring.as_slice());
        assert_eq!(area.bounding_box().max(), coord! { x: 7.5, y: 43.25 });
    }
}
