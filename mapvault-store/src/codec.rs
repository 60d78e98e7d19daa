//! # Binary codec
//!
//! Every file in a database is a sequence of primitive values written by a [`FileWriter`]
//! and read back by a [`FileScanner`].
//!
//! * Fixed-width integers are always little endian.
//! * "Numbers" are base-128 varints; signed numbers are zig-zag mapped first
//!   (see Google's [protobuf docs](https://protobuf.dev/programming-guides/encoding/)).
//! * Coordinates are stored as two fixed `u32` values with 7 decimal digits of precision,
//!   so they round trip bit-exactly.
//! * File offsets are either 8 bytes wide, or use an explicit width of 1-8 bytes
//!   when the writer knows an upper bound.

mod scanner;
mod writer;

use thiserror::Error;

pub use scanner::{AccessMode, FileScanner};
pub use writer::FileWriter;

/// Scale factor between degrees and the stored fixed precision integers.
pub(crate) const COORD_CONVERSION_FACTOR: f64 = 10_000_000.0;

/// The maximum encoded size of a 64-bit varint.
pub(crate) const MAX_VARINT_LEN_64: usize = 10;

/// The maximum encoded size of a 32-bit varint.
pub(crate) const MAX_VARINT_LEN_32: usize = 5;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cannot open '{filename}': {source}")]
    Open {
        filename: String,
        source: std::io::Error,
    },
    #[error("'{filename}' is not open")]
    NotOpen { filename: String },
    #[error("'{filename}' is in an error state after a previous failure")]
    PreviousError { filename: String },
    #[error("{filename}@{pos}: cannot read {wanted} bytes beyond the end of the file ({len} bytes)")]
    Truncated {
        filename: String,
        pos: u64,
        wanted: u64,
        len: u64,
    },
    #[error("{filename}@{pos}: cannot seek beyond the end of the file ({len} bytes)")]
    SeekBeyondEnd { filename: String, pos: u64, len: u64 },
    #[error("{filename}@{pos}: malformed or unterminated varint")]
    MalformedVarint { filename: String, pos: u64 },
    #[error("{filename}@{pos}: value {value} does not fit into {target}")]
    OutOfRange {
        filename: String,
        pos: u64,
        value: String,
        target: &'static str,
    },
    #[error("{filename}@{pos}: invalid file offset width {width} (expected 1-8)")]
    InvalidOffsetWidth {
        filename: String,
        pos: u64,
        width: u8,
    },
    #[error("{filename}@{pos}: I/O error: {source}")]
    Io {
        filename: String,
        pos: u64,
        source: std::io::Error,
    },
}

/// Returns the number of bytes needed to store any offset up to and including `max_offset`
/// with [`FileWriter::write_file_offset_sized`].
#[inline]
pub const fn bytes_needed_for_offset(max_offset: u64) -> u8 {
    let bits = u64::BITS - max_offset.leading_zeros();
    if bits == 0 {
        1
    } else {
        // At most 8, so the cast is lossless
        #[expect(clippy::cast_possible_truncation)]
        let bytes = bits.div_ceil(8) as u8;
        bytes
    }
}

/// How a coordinate snaps to the stored fixed precision grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Snap {
    /// The closest grid value.
    Nearest,
    /// The largest grid value whose decoded coordinate doesn't exceed the input.
    Down,
    /// The smallest grid value whose decoded coordinate isn't below the input.
    Up,
}

/// Converts a latitude in degrees to its stored representation.
#[inline]
pub(crate) fn encode_lat(lat: f64, snap: Snap) -> Option<u32> {
    (-90.0..=90.0)
        .contains(&lat)
        .then(|| encode_fixed(lat, 90.0, snap))
}

/// Converts a longitude in degrees to its stored representation.
#[inline]
pub(crate) fn encode_lon(lon: f64, snap: Snap) -> Option<u32> {
    (-180.0..=180.0)
        .contains(&lon)
        .then(|| encode_fixed(lon, 180.0, snap))
}

/// `value + offset` must lie in `0..=2 * offset`.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_fixed(value: f64, offset: f64, snap: Snap) -> u32 {
    let scaled = (value + offset) * COORD_CONVERSION_FACTOR;
    let max = (2.0 * offset * COORD_CONVERSION_FACTOR) as u32;
    let decode = |raw: u32| f64::from(raw) / COORD_CONVERSION_FACTOR - offset;
    match snap {
        Snap::Nearest => scaled.round() as u32,
        Snap::Down => {
            let raw = scaled.floor() as u32;
            // The scaled value carries float error; fix up against the decoded result
            if raw > 0 && decode(raw) > value { raw - 1 } else { raw }
        }
        Snap::Up => {
            let raw = (scaled.ceil() as u32).min(max);
            if raw < max && decode(raw) < value { raw + 1 } else { raw }
        }
    }
}

#[inline]
pub(crate) fn decode_lat(raw: u32) -> f64 {
    f64::from(raw) / COORD_CONVERSION_FACTOR - 90.0
}

#[inline]
pub(crate) fn decode_lon(raw: u32) -> f64 {
    f64::from(raw) / COORD_CONVERSION_FACTOR - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;
    use proptest::prelude::*;
    use tempfile::NamedTempFile;

    const MODES: [AccessMode; 2] = [AccessMode::Buffered, AccessMode::MemoryMapped];

    /// Writes with `write`, then reads back with `read` in both access modes.
    fn round_trip<W, R>(write: W, read: R)
    where
        W: Fn(&mut FileWriter) -> Result<(), CodecError>,
        R: Fn(&mut FileScanner),
    {
        let file = NamedTempFile::new().expect("Unable to create temp file");
        let mut writer = FileWriter::create(file.path()).expect("Unable to create writer");
        write(&mut writer).expect("Write failed");
        writer.close().expect("Close failed");

        for mode in MODES {
            let mut scanner = FileScanner::open(file.path(), mode).expect("Unable to open");
            read(&mut scanner);
            assert_eq!(scanner.pos(), scanner.len(), "Expected to consume the file in {mode:?} mode");
        }
    }

    #[test]
    fn fixed_width_boundaries() {
        round_trip(
            |w| {
                w.write_bool(true)?;
                w.write_bool(false)?;
                for v in [u8::MIN, 1, u8::MAX] {
                    w.write_u8(v)?;
                }
                for v in [u16::MIN, 1, u16::MAX] {
                    w.write_u16(v)?;
                }
                for v in [u32::MIN, 1, u32::MAX] {
                    w.write_u32(v)?;
                }
                for v in [u64::MIN, 1, u64::MAX] {
                    w.write_u64(v)?;
                }
                for v in [i16::MIN, -1, 0, 1, i16::MAX] {
                    w.write_i16(v)?;
                }
                for v in [i32::MIN, -1, 0, 1, i32::MAX] {
                    w.write_i32(v)?;
                }
                for v in [i64::MIN, -1, 0, 1, i64::MAX] {
                    w.write_i64(v)?;
                }
                Ok(())
            },
            |s| {
                assert!(s.read_bool().unwrap());
                assert!(!s.read_bool().unwrap());
                for v in [u8::MIN, 1, u8::MAX] {
                    assert_eq!(s.read_u8().unwrap(), v);
                }
                for v in [u16::MIN, 1, u16::MAX] {
                    assert_eq!(s.read_u16().unwrap(), v);
                }
                for v in [u32::MIN, 1, u32::MAX] {
                    assert_eq!(s.read_u32().unwrap(), v);
                }
                for v in [u64::MIN, 1, u64::MAX] {
                    assert_eq!(s.read_u64().unwrap(), v);
                }
                for v in [i16::MIN, -1, 0, 1, i16::MAX] {
                    assert_eq!(s.read_i16().unwrap(), v);
                }
                for v in [i32::MIN, -1, 0, 1, i32::MAX] {
                    assert_eq!(s.read_i32().unwrap(), v);
                }
                for v in [i64::MIN, -1, 0, 1, i64::MAX] {
                    assert_eq!(s.read_i64().unwrap(), v);
                }
            },
        );
    }

    #[test]
    fn fixed_width_is_little_endian() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        writer.write_u32(0x0102_0304).unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read(file.path()).unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn varint_boundaries() {
        // The largest value encodable in N bytes uses exactly N bytes,
        // and the next value up needs N+1.
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        for n in 1..=9u32 {
            let max_n = (1u64 << (7 * n)) - 1;
            assert_eq!(writer.write_varint_u64(max_n).unwrap(), n as usize, "{max_n}");
            assert_eq!(
                writer.write_varint_u64(max_n + 1).unwrap(),
                n as usize + 1,
                "{}",
                max_n + 1
            );
        }
        assert_eq!(writer.write_varint_u64(u64::MAX).unwrap(), MAX_VARINT_LEN_64);
        writer.close().unwrap();

        for mode in MODES {
            let mut scanner = FileScanner::open(file.path(), mode).unwrap();
            for n in 1..=9u32 {
                let max_n = (1u64 << (7 * n)) - 1;
                assert_eq!(scanner.read_varint_u64().unwrap(), max_n);
                assert_eq!(scanner.read_varint_u64().unwrap(), max_n + 1);
            }
            assert_eq!(scanner.read_varint_u64().unwrap(), u64::MAX);
        }
    }

    #[test]
    fn signed_varints_are_zig_zag() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        // Small magnitudes stay small regardless of sign
        assert_eq!(writer.write_varint_i64(-1).unwrap(), 1);
        assert_eq!(writer.write_varint_i64(63).unwrap(), 1);
        assert_eq!(writer.write_varint_i64(-64).unwrap(), 1);
        assert_eq!(writer.write_varint_i64(64).unwrap(), 2);
        writer.close().unwrap();

        assert_eq!(std::fs::read(file.path()).unwrap(), vec![1, 126, 127, 128, 1]);
    }

    #[test]
    fn unterminated_varint_is_sticky_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0xff; 12]).unwrap();

        for mode in MODES {
            let mut scanner = FileScanner::open(file.path(), mode).unwrap();
            assert!(matches!(
                scanner.read_varint_u64(),
                Err(CodecError::MalformedVarint { pos: 0, .. })
            ));
            assert!(scanner.has_error());

            // Everything fails fast from here on, even legal operations
            assert!(matches!(
                scanner.set_pos(0),
                Err(CodecError::PreviousError { .. })
            ));
            assert!(matches!(
                scanner.read_u8(),
                Err(CodecError::PreviousError { .. })
            ));
        }
    }

    #[test]
    fn varint_exceeding_target_width_fails() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        writer.write_varint_u64(u64::from(u32::MAX) + 1).unwrap();
        writer.close().unwrap();

        let mut scanner = FileScanner::open(file.path(), AccessMode::Buffered).unwrap();
        assert!(scanner.read_varint_u32().is_err());
        assert!(scanner.has_error());
    }

    #[test]
    fn reading_past_end_fails() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1, 2, 3]).unwrap();

        for mode in MODES {
            let mut scanner = FileScanner::open(file.path(), mode).unwrap();
            assert!(matches!(
                scanner.read_u32(),
                Err(CodecError::Truncated {
                    pos: 0,
                    wanted: 4,
                    len: 3,
                    ..
                })
            ));
            assert!(scanner.has_error());
        }
    }

    #[test]
    fn seek_backwards_and_reread() {
        round_trip(
            |w| {
                w.write_u32(7)?;
                w.write_varint_u64(300)?;
                Ok(())
            },
            |s| {
                assert_eq!(s.read_u32().unwrap(), 7);
                assert_eq!(s.read_varint_u64().unwrap(), 300);
                s.set_pos(0).unwrap();
                assert_eq!(s.read_u32().unwrap(), 7);
                assert_eq!(s.pos(), 4);
                assert_eq!(s.read_varint_u64().unwrap(), 300);
            },
        );
    }

    #[test]
    fn seek_beyond_end_fails() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0; 4]).unwrap();
        let mut scanner = FileScanner::open(file.path(), AccessMode::MemoryMapped).unwrap();
        // Seeking exactly to the end is fine (nothing more can be read though)
        scanner.set_pos(4).unwrap();
        assert!(matches!(
            scanner.set_pos(5),
            Err(CodecError::SeekBeyondEnd { .. })
        ));
    }

    #[test]
    fn sized_file_offsets() {
        assert_eq!(bytes_needed_for_offset(0), 1);
        assert_eq!(bytes_needed_for_offset(255), 1);
        assert_eq!(bytes_needed_for_offset(256), 2);
        assert_eq!(bytes_needed_for_offset(u64::from(u32::MAX)), 4);
        assert_eq!(bytes_needed_for_offset(u64::MAX), 8);

        round_trip(
            |w| {
                w.write_file_offset_sized(255, 1)?;
                w.write_file_offset_sized(65_535, 2)?;
                w.write_file_offset_sized(1 << 40, 6)?;
                w.write_file_offset_sized(u64::MAX, 8)?;
                w.write_file_offset(12_345)?;
                Ok(())
            },
            |s| {
                assert_eq!(s.read_file_offset_sized(1).unwrap(), 255);
                assert_eq!(s.read_file_offset_sized(2).unwrap(), 65_535);
                assert_eq!(s.read_file_offset_sized(6).unwrap(), 1 << 40);
                assert_eq!(s.read_file_offset_sized(8).unwrap(), u64::MAX);
                assert_eq!(s.read_file_offset().unwrap(), 12_345);
            },
        );
    }

    #[test]
    fn sized_file_offset_overflow_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        assert!(writer.write_file_offset_sized(256, 1).is_err());
        assert!(writer.write_file_offset_sized(1, 0).is_err());
        assert!(writer.write_file_offset_sized(1, 9).is_err());
    }

    #[test]
    fn coordinate_extremes() {
        let coords = [
            coord! { x: -180.0, y: -90.0 },
            coord! { x: 180.0, y: 90.0 },
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.000_000_1, y: -0.000_000_1 },
            coord! { x: 7.424_6, y: 43.738_4 },
        ];
        round_trip(
            |w| {
                for c in coords {
                    w.write_coord(c)?;
                }
                Ok(())
            },
            |s| {
                for c in coords {
                    let read = s.read_coord().unwrap();
                    assert!((read.x - c.x).abs() < 1e-9, "{read:?} != {c:?}");
                    assert!((read.y - c.y).abs() < 1e-9, "{read:?} != {c:?}");
                }
            },
        );
    }

    #[test]
    fn invalid_coordinates_are_rejected() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(file.path()).unwrap();
        assert!(writer.write_coord(coord! { x: 181.0, y: 0.0 }).is_err());
        assert!(writer.write_coord(coord! { x: 0.0, y: -90.5 }).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0; 4]).unwrap();
        let mut scanner = FileScanner::open(file.path(), AccessMode::Buffered).unwrap();
        assert!(scanner.is_open());
        scanner.close();
        scanner.close();
        assert!(!scanner.is_open());
        assert!(matches!(scanner.read_u8(), Err(CodecError::NotOpen { .. })));
    }

    proptest! {
        #[test]
        fn varint_u64_round_trip(values in proptest::collection::vec(any::<u64>(), 1..64)) {
            round_trip(
                |w| values.iter().try_for_each(|v| w.write_varint_u64(*v).map(|_| ())),
                |s| for v in &values {
                    assert_eq!(s.read_varint_u64().unwrap(), *v);
                },
            );
        }

        #[test]
        fn varint_i64_round_trip(values in proptest::collection::vec(any::<i64>(), 1..64)) {
            round_trip(
                |w| values.iter().try_for_each(|v| w.write_varint_i64(*v).map(|_| ())),
                |s| for v in &values {
                    assert_eq!(s.read_varint_i64().unwrap(), *v);
                },
            );
        }

        #[test]
        fn varint_i32_round_trip(values in proptest::collection::vec(any::<i32>(), 1..64)) {
            round_trip(
                |w| values.iter().try_for_each(|v| w.write_varint_i32(*v).map(|_| ())),
                |s| for v in &values {
                    assert_eq!(s.read_varint_i32().unwrap(), *v);
                },
            );
        }

        #[test]
        fn coordinate_round_trip_is_exact(lat in 0u32..=1_800_000_000, lon in 0u32..=3_600_000_000) {
            // Any value on the 1e-7 grid survives unchanged
            let c = coord! { x: decode_lon(lon), y: decode_lat(lat) };
            round_trip(
                |w| w.write_coord(c),
                |s| assert_eq!(s.read_coord().unwrap(), c),
            );
        }

        #[test]
        fn snapped_coordinates_bracket_the_input(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            let c = coord! { x: lon, y: lat };
            round_trip(
                |w| {
                    w.write_coord_snapped(c, Snap::Down)?;
                    w.write_coord_snapped(c, Snap::Up)
                },
                |s| {
                    let down = s.read_coord().unwrap();
                    let up = s.read_coord().unwrap();
                    assert!(down.x <= lon && down.y <= lat, "{down:?} above {c:?}");
                    assert!(up.x >= lon && up.y >= lat, "{up:?} below {c:?}");
                    assert!(up.x - down.x <= 2.5e-7 && up.y - down.y <= 2.5e-7);
                },
            );
        }
    }
}
