//! Record codecs for the data files the index is built over.
//!
//! An index never interprets the data file itself; a [`RecordCodec`] tells it
//! where one record ends and the next begins, and a point-mapper function
//! (supplied alongside the codec) extracts the coordinates. Two codecs cover
//! the common flat-file layouts: newline-delimited text and fixed-width
//! binary. Anything else can implement the trait directly.

use std::io::{Read, Write};

use crate::errors::{IndexError, IndexResult};

/// Reads and writes one record at a time from a byte stream.
///
/// Implementations must be self-delimiting: `read_record` consumes exactly
/// the bytes of one record (including any terminator) so that records can be
/// read back to back from a raw positioned stream.
pub trait RecordCodec {
    type Record;

    /// Reads the next record, or `Ok(None)` at a clean end of stream.
    fn read_record(&self, reader: &mut dyn Read) -> IndexResult<Option<Self::Record>>;

    /// Writes one record, including its terminator if any.
    fn write_record(&self, writer: &mut dyn Write, record: &Self::Record) -> IndexResult<()>;
}

/// Newline-delimited text records.
///
/// Records are returned without the trailing `\n` (and without a `\r` before
/// it, so CRLF files work too). A final line without a newline is still a
/// record. Written records get a `\n` appended.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl RecordCodec for LineCodec {
    type Record = String;

    fn read_record(&self, reader: &mut dyn Read) -> IndexResult<Option<String>> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte)? {
                0 => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                _ => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
            }
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| IndexError::Corrupt(format!("record is not valid UTF-8: {e}")))
    }

    fn write_record(&self, writer: &mut dyn Write, record: &String) -> IndexResult<()> {
        writer.write_all(record.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Fixed-width binary records of `width` bytes each.
///
/// A partial record at the end of the stream is an error, not a record: it
/// means the file was truncated or the width is wrong.
#[derive(Debug, Clone, Copy)]
pub struct FixedWidthCodec {
    width: usize,
}

impl FixedWidthCodec {
    pub fn new(width: usize) -> IndexResult<FixedWidthCodec> {
        if width == 0 {
            return Err(IndexError::Config(
                "fixed record width must be at least 1".to_string(),
            ));
        }
        Ok(FixedWidthCodec { width })
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl RecordCodec for FixedWidthCodec {
    type Record = Vec<u8>;

    fn read_record(&self, reader: &mut dyn Read) -> IndexResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.width];
        let mut filled = 0;
        while filled < self.width {
            match reader.read(&mut buf[filled..])? {
                0 => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(IndexError::Truncated(format!(
                        "fixed-width record: got {filled} of {} bytes",
                        self.width
                    )));
                }
                n => filled += n,
            }
        }
        Ok(Some(buf))
    }

    fn write_record(&self, writer: &mut dyn Write, record: &Vec<u8>) -> IndexResult<()> {
        debug_assert_eq!(record.len(), self.width);
        writer.write_all(record)?;
        Ok(())
    }
}
