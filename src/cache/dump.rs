//! Dump Files
//!
//! On shutdown the blobs still waiting in the write-behind queue are saved
//! to a dump file so they survive a restart:
//!
//! ```text
//! [u32 count] count × { [u32 desc_len][desc] [u32 blob_len][blob] }
//! ```
//!
//! Dump I/O is synchronous. It only runs while no other request can be in
//! flight (startup and shutdown).

use bytes::Bytes;
use tracing::{debug, warn};

use super::block_file::{BlockFile, FilePos};
use super::buffer::{ByteReader, ByteWriter};
use super::descriptor::Descriptor;
use super::write_queue::PendingWrite;
use crate::error::{Error, Result};

/// Write `records` to `file`, replacing its contents
///
/// Stops early once the device has less than `headroom` bytes free. The
/// count header only covers the records actually written.
pub fn write_dump<'a>(
    file: &dyn BlockFile,
    records: impl IntoIterator<Item = (&'a Descriptor, &'a Bytes)>,
    headroom: u64,
) -> Result<usize> {
    file.clear()?;

    let mut writer = ByteWriter::with_capacity(64);
    writer.put_u32(0);
    write_all(file, &writer.split())?;

    let mut count: u32 = 0;
    for (descriptor, blob) in records {
        let free = file.available_space();
        if free < headroom {
            warn!(
                path = %file.path().display(),
                free,
                headroom,
                written = count,
                "Disk nearly full, truncating dump"
            );
            break;
        }
        writer
            .put_len_prefixed(descriptor.as_bytes())
            .put_len_prefixed(blob);
        write_all(file, &writer.split())?;
        count += 1;
    }

    writer.put_u32(count);
    file.set_pos(FilePos::Start(0))?;
    write_all(file, &writer.split())?;

    debug!(path = %file.path().display(), records = count, "Dump written");
    Ok(count as usize)
}

/// Read every complete record from `file`
///
/// A truncated tail is dropped with a warning; records whose descriptor is
/// not a valid descriptor are skipped.
pub fn read_dump(file: &dyn BlockFile) -> Result<Vec<PendingWrite>> {
    let len = file.len() as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    file.set_pos(FilePos::Start(0))?;
    let data = file.read(len)?;

    let mut reader = ByteReader::new(&data);
    let count = match reader.get_u32() {
        Ok(count) => count,
        Err(e) => {
            warn!(path = %file.path().display(), error = %e, "Dump header unreadable");
            return Ok(Vec::new());
        }
    };

    let mut records = Vec::new();
    for index in 0..count {
        match read_record(&data, &mut reader) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    path = %file.path().display(),
                    record = index,
                    expected = count,
                    error = %e,
                    "Dump truncated"
                );
                break;
            }
        }
    }
    Ok(records)
}

fn read_record(data: &Bytes, reader: &mut ByteReader<'_>) -> Result<Option<PendingWrite>> {
    let descriptor = reader.get_len_prefixed()?;
    let blob_len = reader.get_u32()? as usize;
    let start = reader.position();
    reader.get_bytes(blob_len)?;
    let blob = data.slice(start..start + blob_len);

    let descriptor = std::str::from_utf8(descriptor)
        .map_err(|e| Error::CorruptDump(e.to_string()))
        .and_then(Descriptor::new);
    match descriptor {
        Ok(descriptor) => Ok(Some(PendingWrite::new(descriptor, blob))),
        Err(e) => {
            warn!(error = %e, "Skipping dump record with invalid descriptor");
            Ok(None)
        }
    }
}

fn write_all(file: &dyn BlockFile, data: &[u8]) -> Result<()> {
    let written = file.write(data)?;
    if written != data.len() {
        return Err(Error::CorruptDump(format!(
            "short write: {written} of {} bytes",
            data.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block_file::MemBlockFile;

    fn desc(s: &str) -> Descriptor {
        Descriptor::new(s).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let file = MemBlockFile::new("/mem/fil.dump");
        let a = (desc("a"), Bytes::from_static(b"alpha"));
        let b = (desc("b"), Bytes::new());

        let written = write_dump(&file, [(&a.0, &a.1), (&b.0, &b.1)], 0).unwrap();
        assert_eq!(written, 2);

        let records = read_dump(&file).unwrap();
        assert_eq!(
            records,
            vec![PendingWrite::new(a.0, a.1), PendingWrite::new(b.0, b.1)]
        );
    }

    #[test]
    fn test_exact_layout() {
        let file = MemBlockFile::new("/mem/fil.dump");
        let d = desc("ab");
        let blob = Bytes::from_static(b"x");
        write_dump(&file, [(&d, &blob)], 0).unwrap();

        assert_eq!(
            file.contents(),
            vec![0, 0, 0, 1, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 1, b'x']
        );
    }

    #[test]
    fn test_rewrite_replaces_old_dump() {
        let file = MemBlockFile::new("/mem/fil.dump");
        file.set_contents(&[0xff; 64]);
        write_dump(&file, std::iter::empty(), 0).unwrap();
        assert_eq!(file.contents(), vec![0, 0, 0, 0]);
        assert!(read_dump(&file).unwrap().is_empty());
    }

    #[test]
    fn test_headroom_stops_dump() {
        let file = MemBlockFile::new("/mem/fil.dump");
        file.set_available_space(100);
        let d = desc("a");
        let blob = Bytes::from_static(b"1");

        let written = write_dump(&file, [(&d, &blob)], 1000).unwrap();
        assert_eq!(written, 0);
        assert_eq!(file.contents(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_dump_keeps_complete_records() {
        let file = MemBlockFile::new("/mem/fil.dump");
        let a = desc("a");
        let b = desc("b");
        let blob = Bytes::from_static(b"0123456789");
        write_dump(&file, [(&a, &blob), (&b, &blob)], 0).unwrap();

        let mut contents = file.contents();
        contents.truncate(contents.len() - 3);
        file.set_contents(&contents);

        let records = read_dump(&file).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].descriptor, a);
    }

    #[test]
    fn test_nul_descriptor_skipped() {
        let mut writer = ByteWriter::new();
        writer
            .put_u32(2)
            .put_len_prefixed(b"b\0d")
            .put_len_prefixed(b"1")
            .put_len_prefixed(b"ok")
            .put_len_prefixed(b"2");
        let file = MemBlockFile::new("/mem/initial.dump");
        file.set_contents(&writer.freeze());

        let records = read_dump(&file).unwrap();
        assert_eq!(records, vec![PendingWrite::new(desc("ok"), Bytes::from_static(b"2"))]);
    }

    #[test]
    fn test_empty_file() {
        let file = MemBlockFile::new("/mem/fil.dump");
        assert!(read_dump(&file).unwrap().is_empty());
        file.set_contents(&[0, 0]);
        assert!(read_dump(&file).unwrap().is_empty());
    }
}
