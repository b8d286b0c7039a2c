use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LogError, Result};
use crate::format::{check_header, read_record, LogEvent, RecordRead, HEADER_LEN};

/// One index slot: the largest timestamp seen up to and including the record
/// at `offset`.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    max_timestamp: i64,
    offset: u64,
}

#[derive(Debug)]
struct TimestampIndex {
    entries: Vec<IndexEntry>,
    /// File offset just past the last indexed record.
    end: u64,
}

/// Sequential, seekable reader over a finished or growing log.
///
/// A partial record at the tail is end of log, not an error. If the file
/// grows (another process is still writing), later reads pick up the new
/// records. As an [`Iterator`] it stops after the first error; seeking or
/// rewinding resumes it.
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
    last_event: Option<u64>,
    index: Option<TimestampIndex>,
    warned_truncated: bool,
    failed: bool,
}

impl LogReader {
    /// Open a log and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(LogError::io(path))?;
        let file_len = file.metadata().map_err(LogError::io(path))?.len();
        let mut reader = BufReader::new(file);

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        reader
            .by_ref()
            .take(HEADER_LEN)
            .read_to_end(&mut header)
            .map_err(LogError::io(path))?;
        check_header(&header).map_err(|reason| LogError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        })?;

        debug!(path = %path.display(), bytes = file_len, "opened event log");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            offset: HEADER_LEN,
            file_len,
            last_event: None,
            index: None,
            warned_truncated: false,
            failed: false,
        })
    }

    /// Read the next event. `Ok(None)` at end of log.
    pub fn read_next(&mut self) -> Result<Option<LogEvent>> {
        match self.read_at_offset()? {
            Some(event) => Ok(Some(event)),
            None if self.refresh_len()? => self.read_at_offset(),
            None => Ok(None),
        }
    }

    /// Position so the next [`read_next`](Self::read_next) returns the first
    /// record (in file order) with `timestamp >= ts`, or end of log if none.
    ///
    /// The first call scans the whole file to build a timestamp index.
    pub fn seek_to_timestamp(&mut self, ts: i64) -> Result<()> {
        self.refresh_len()?;
        let stale = self
            .index
            .as_ref()
            .is_none_or(|index| index.end < self.file_len);
        if stale {
            self.build_index()?;
        }

        let (offset, entries) = match self.index.as_ref() {
            Some(index) => {
                let at = index.entries.partition_point(|e| e.max_timestamp < ts);
                let offset = index.entries.get(at).map_or(index.end, |e| e.offset);
                (offset, index.entries.len())
            }
            None => (HEADER_LEN, 0),
        };

        debug!(ts, offset, entries, "seeking event log");
        self.seek_to(offset)
    }

    /// Go back to the first record.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek_to(HEADER_LEN)
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the timestamp index, if it has been built.
    pub fn indexed_records(&self) -> Option<usize> {
        self.index.as_ref().map(|index| index.entries.len())
    }

    fn read_at_offset(&mut self) -> Result<Option<LogEvent>> {
        let available = self.file_len.saturating_sub(self.offset);
        let read = read_record(&mut self.reader, available).map_err(LogError::io(&self.path))?;

        match read {
            RecordRead::Event { event, len } => {
                if let Some(last) = self.last_event {
                    if event.event_number <= last {
                        self.reposition()?;
                        return Err(LogError::Corrupt {
                            offset: self.offset,
                            reason: format!(
                                "event number {} does not increase past {last}",
                                event.event_number
                            ),
                        });
                    }
                }
                self.last_event = Some(event.event_number);
                self.offset += len;
                self.warned_truncated = false;
                Ok(Some(event))
            }
            RecordRead::End => Ok(None),
            RecordRead::Truncated => {
                if !self.warned_truncated {
                    warn!(
                        path = %self.path.display(),
                        offset = self.offset,
                        "partial record at end of log"
                    );
                    self.warned_truncated = true;
                }
                self.reposition()?;
                Ok(None)
            }
            RecordRead::Invalid(reason) => {
                self.reposition()?;
                Err(LogError::Corrupt {
                    offset: self.offset,
                    reason,
                })
            }
        }
    }

    /// Re-read the file length. Returns true if the file grew.
    fn refresh_len(&mut self) -> Result<bool> {
        let len = self
            .reader
            .get_ref()
            .metadata()
            .map_err(LogError::io(&self.path))?
            .len();
        let grew = len > self.file_len;
        self.file_len = len;
        Ok(grew)
    }

    fn build_index(&mut self) -> Result<()> {
        let resume = self.offset;
        let last_event = self.last_event;
        self.seek_to(HEADER_LEN)?;

        let mut entries = Vec::new();
        let mut max_timestamp = i64::MIN;
        let mut offset = HEADER_LEN;
        loop {
            let available = self.file_len - offset;
            let read =
                read_record(&mut self.reader, available).map_err(LogError::io(&self.path))?;
            match read {
                RecordRead::Event { event, len } => {
                    max_timestamp = max_timestamp.max(event.timestamp);
                    entries.push(IndexEntry {
                        max_timestamp,
                        offset,
                    });
                    offset += len;
                }
                RecordRead::End | RecordRead::Truncated => break,
                RecordRead::Invalid(reason) => {
                    self.seek_to(resume)?;
                    self.last_event = last_event;
                    return Err(LogError::Corrupt { offset, reason });
                }
            }
        }

        debug!(records = entries.len(), "built timestamp index");
        self.index = Some(TimestampIndex {
            entries,
            end: offset,
        });
        self.seek_to(resume)?;
        self.last_event = last_event;
        Ok(())
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.offset = offset;
        self.last_event = None;
        self.failed = false;
        self.reposition()
    }

    fn reposition(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(self.offset))
            .map_err(LogError::io(&self.path))?;
        Ok(())
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.read_next().transpose();
        self.failed = matches!(next, Some(Err(_)));
        next
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use super::*;
    use crate::writer::LogWriter;

    fn write_log(path: &Path, timestamps: &[i64]) {
        let mut writer = LogWriter::create(path).unwrap();
        for (n, ts) in timestamps.iter().enumerate() {
            writer
                .append("CH", format!("event-{n}").as_bytes(), *ts)
                .unwrap();
        }
    }

    fn next_ts(reader: &mut LogReader) -> Option<i64> {
        reader.read_next().unwrap().map(|e| e.timestamp)
    }

    #[test]
    fn reads_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[100, 200, 300]);

        let events: Vec<_> = LogReader::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].payload.as_ref(), b"event-1");
        assert_eq!(events[2].timestamp, 300);
    }

    #[test]
    fn end_of_log_is_none_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[1]);

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.read_next().unwrap().is_some());
        assert!(reader.read_next().unwrap().is_none());
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_reads_as_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[100, 200]);

        let full = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full - 5)
            .unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(next_ts(&mut reader), Some(100));
        assert_eq!(next_ts(&mut reader), None);
    }

    #[test]
    fn reader_sees_records_appended_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append("CH", b"one", 1).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert_eq!(next_ts(&mut reader), Some(1));
        assert_eq!(next_ts(&mut reader), None);

        writer.append("CH", b"two", 2).unwrap();
        assert_eq!(next_ts(&mut reader), Some(2));
    }

    #[test]
    fn bad_header_is_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.lcmlog");
        std::fs::write(&short, b"LCMP").unwrap();
        let foreign = dir.path().join("foreign.lcmlog");
        std::fs::write(&foreign, b"definitely not an event log").unwrap();

        for path in [short, foreign] {
            let err = LogReader::open(&path).err().unwrap();
            assert!(matches!(err, LogError::UnsupportedFormat { .. }), "{err}");
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LogReader::open(dir.path().join("nope.lcmlog")).err().unwrap();
        assert!(matches!(err, LogError::Io { .. }));
    }

    #[test]
    fn repeated_event_number_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[1, 2]);

        // Overwrite the second record's event number (last 8 bytes) with 0.
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&0u64.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.read_next().unwrap().is_some());
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, LogError::Corrupt { .. }));
    }

    #[test]
    fn seek_lands_on_first_record_at_or_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[100, 200, 300, 400]);
        let mut reader = LogReader::open(&path).unwrap();

        reader.seek_to_timestamp(250).unwrap();
        assert_eq!(next_ts(&mut reader), Some(300));

        reader.seek_to_timestamp(200).unwrap();
        assert_eq!(next_ts(&mut reader), Some(200));
        assert_eq!(reader.indexed_records(), Some(4));
    }

    #[test]
    fn seek_before_first_and_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[100, 200, 300]);
        let mut reader = LogReader::open(&path).unwrap();

        reader.seek_to_timestamp(i64::MIN).unwrap();
        assert_eq!(next_ts(&mut reader), Some(100));

        reader.seek_to_timestamp(301).unwrap();
        assert_eq!(next_ts(&mut reader), None);
    }

    #[test]
    fn seek_with_out_of_order_timestamps_uses_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[100, 300, 200, 400]);
        let mut reader = LogReader::open(&path).unwrap();

        reader.seek_to_timestamp(250).unwrap();
        assert_eq!(next_ts(&mut reader), Some(300));
        assert_eq!(next_ts(&mut reader), Some(200));

        reader.seek_to_timestamp(350).unwrap();
        assert_eq!(next_ts(&mut reader), Some(400));
    }

    #[test]
    fn seek_in_empty_log_is_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[]);
        let mut reader = LogReader::open(&path).unwrap();

        reader.seek_to_timestamp(0).unwrap();
        assert_eq!(next_ts(&mut reader), None);
    }

    #[test]
    fn index_is_rebuilt_after_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append("CH", b"a", 10).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        reader.seek_to_timestamp(50).unwrap();
        assert_eq!(next_ts(&mut reader), None);

        writer.append("CH", b"b", 60).unwrap();
        writer.flush().unwrap();
        reader.seek_to_timestamp(50).unwrap();
        assert_eq!(next_ts(&mut reader), Some(60));
    }

    #[test]
    fn rewind_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[5, 6]);
        let mut reader = LogReader::open(&path).unwrap();

        assert_eq!(reader.position(), HEADER_LEN);
        reader.read_next().unwrap();
        assert!(reader.position() > HEADER_LEN);

        reader.rewind().unwrap();
        assert_eq!(next_ts(&mut reader), Some(5));
    }

    #[test]
    fn corrupt_middle_record_is_error_not_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[1, 2]);

        let mut bytes = std::fs::read(&path).unwrap();
        // First record's channel length field.
        let at = HEADER_LEN as usize + 8;
        bytes[at..at + 4].copy_from_slice(&999u32.to_be_bytes());
        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(matches!(reader.read_next(), Err(LogError::Corrupt { .. })));
    }

    #[test]
    fn iterator_stops_after_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[1, 2, 3]);

        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = crate::format::RECORD_OVERHEAD + "CH".len() + "event-0".len();
        // Second record's channel length field.
        let at = HEADER_LEN as usize + first_len + 8;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = LogReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().timestamp, 1);
        assert!(matches!(results[1], Err(LogError::Corrupt { .. })));
    }

    #[test]
    fn rewind_resumes_iteration_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lcmlog");
        write_log(&path, &[1, 2]);

        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&0u64.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());

        reader.rewind().unwrap();
        assert_eq!(reader.next().unwrap().unwrap().timestamp, 1);
    }
}
