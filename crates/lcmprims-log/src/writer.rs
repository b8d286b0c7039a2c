use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use lcmprims_frame::validate_channel;
use lcmprims_router::now_utime;
use tracing::{debug, warn};

use crate::error::{LogError, Result};
use crate::format::{
    check_header, encode_header, encode_record, read_record, RecordRead, HEADER_LEN,
    MAX_RECORD_PAYLOAD,
};

/// Writer behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// `fsync` file data after every record.
    pub sync_on_append: bool,
}

/// Append-only writer for one log file.
///
/// Each record is encoded in memory and handed to the file with a single
/// `write_all`, so a crash leaves at most one partial record at the tail.
/// Readers treat that tail as end of log and [`LogWriter::open_append`]
/// cuts it off. A write that fails in-process is cut back before `append`
/// returns; if that is impossible the writer closes itself.
pub struct LogWriter {
    path: PathBuf,
    file: Option<File>,
    config: LogConfig,
    next_event: u64,
    len: u64,
    buf: BytesMut,
}

impl LogWriter {
    /// Create (or truncate) a log file and write its header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_config(path, LogConfig::default())
    }

    pub fn create_with_config(path: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(LogError::io(path))?;

        let mut header = BytesMut::new();
        encode_header(&mut header);
        file.write_all(&header).map_err(LogError::io(path))?;
        if config.sync_on_append {
            file.sync_data().map_err(LogError::io(path))?;
        }

        debug!(path = %path.display(), "created event log");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            config,
            next_event: 0,
            len: HEADER_LEN,
            buf: BytesMut::new(),
        })
    }

    /// Continue an existing log.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_append_with_config(path, LogConfig::default())
    }

    /// Continue an existing log: validate it, drop a partial trailing record,
    /// and keep numbering after the last complete event.
    pub fn open_append_with_config(path: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(LogError::io(path))?;
        let file_len = file.metadata().map_err(LogError::io(path))?.len();

        let mut header = [0u8; HEADER_LEN as usize];
        let header_len = read_up_to(&mut file, &mut header).map_err(LogError::io(path))?;
        check_header(&header[..header_len]).map_err(|reason| LogError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        })?;

        let (end, last_event) = scan_complete(&mut file, file_len, path)?;
        if end < file_len {
            warn!(
                path = %path.display(),
                offset = end,
                dropped = file_len - end,
                "truncating partial record at end of log"
            );
            file.set_len(end).map_err(LogError::io(path))?;
        }
        file.seek(SeekFrom::Start(end)).map_err(LogError::io(path))?;

        let next_event = last_event.map_or(0, |n| n.wrapping_add(1));
        debug!(path = %path.display(), next_event, "appending to event log");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            config,
            next_event,
            len: end,
            buf: BytesMut::new(),
        })
    }

    /// Append a record and return its event number.
    pub fn append(&mut self, channel: &str, payload: &[u8], timestamp: i64) -> Result<u64> {
        validate_channel(channel)?;
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(LogError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_RECORD_PAYLOAD,
            });
        }
        let file = self.file.as_mut().ok_or(LogError::Closed)?;

        let event_number = self.next_event;
        self.buf.clear();
        encode_record(event_number, timestamp, channel, payload, &mut self.buf);

        if let Err(failed) = commit_record(file, &self.buf, self.len, self.config.sync_on_append)
        {
            if let Some(rollback) = failed.rollback {
                warn!(
                    path = %self.path.display(),
                    offset = self.len,
                    error = %rollback,
                    "could not cut back failed record, closing log"
                );
                self.file = None;
            }
            return Err(LogError::io(&self.path)(failed.error));
        }

        self.next_event += 1;
        self.len += self.buf.len() as u64;
        Ok(event_number)
    }

    /// Append a record stamped with the current time.
    pub fn append_now(&mut self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.append(channel, payload, now_utime())
    }

    pub fn flush(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        file.flush().map_err(LogError::io(&self.path))
    }

    /// Flush and `fsync` file data.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(file) = self.file.as_ref() {
            file.sync_data().map_err(LogError::io(&self.path))?;
        }
        Ok(())
    }

    /// Sync and release the file. Later appends return `LogError::Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.sync()?;
        self.file = None;
        debug!(path = %self.path.display(), events = self.next_event, "closed event log");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Event number the next append will get.
    pub fn next_event_number(&self) -> u64 {
        self.next_event
    }

    /// Current file length, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == HEADER_LEN
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }
}

/// The file operations an append needs.
trait RecordFile: Write {
    /// Drop everything past `len` and continue writing there.
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync_record(&mut self) -> std::io::Result<()>;
}

impl RecordFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn sync_record(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// A record that did not make it into the file.
#[derive(Debug)]
struct FailedCommit {
    error: std::io::Error,
    /// Set when the file could not be cut back to its previous length.
    rollback: Option<std::io::Error>,
}

/// Write one encoded record at `len`. A failed write or sync cuts the file
/// back to `len` so the next record starts on a record boundary.
fn commit_record<F: RecordFile>(
    file: &mut F,
    record: &[u8],
    len: u64,
    sync: bool,
) -> std::result::Result<(), FailedCommit> {
    let written = file
        .write_all(record)
        .and_then(|()| if sync { file.sync_record() } else { Ok(()) });
    written.map_err(|error| FailedCommit {
        error,
        rollback: file.truncate_to(len).err(),
    })
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Offset just past the last complete record, and that record's number.
fn scan_complete(file: &mut File, file_len: u64, path: &Path) -> Result<(u64, Option<u64>)> {
    file.seek(SeekFrom::Start(HEADER_LEN))
        .map_err(LogError::io(path))?;
    let mut reader = BufReader::new(file);
    let mut offset = HEADER_LEN;
    let mut last_event: Option<u64> = None;

    loop {
        let read = read_record(&mut reader, file_len - offset).map_err(LogError::io(path))?;
        match read {
            RecordRead::Event { event, len } => {
                if last_event.is_some_and(|last| event.event_number <= last) {
                    return Err(LogError::Corrupt {
                        offset,
                        reason: format!("event number {} does not increase", event.event_number),
                    });
                }
                last_event = Some(event.event_number);
                offset += len;
            }
            RecordRead::End | RecordRead::Truncated => return Ok((offset, last_event)),
            RecordRead::Invalid(reason) => return Err(LogError::Corrupt { offset, reason }),
        }
    }
}
