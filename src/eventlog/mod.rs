//! Persisted event log.
//!
//! An event log is a flat file of back-to-back records, each a fixed
//! big-endian header followed by the channel name and the payload:
//!
//! ```text
//! sync_word u32 = 0xEDA1DA01
//! eventnum  i64
//! timestamp i64   (microseconds since epoch)
//! chan_len  i32
//! data_len  i32
//! channel   [u8; chan_len]
//! payload   [u8; data_len]
//! ```
//!
//! The format has no index. Readers locate records by scanning for the sync
//! word, which lets them step over torn or corrupted regions instead of
//! failing the whole read.
//!
//! # Example: Writer
//!
//! ```no_run
//! use chanbus::eventlog::{EventLog, LogMode};
//!
//! let mut log = EventLog::open("./session.log", LogMode::Write)?;
//! log.write_record(1_000_000, "POSE", b"\x01\x02")?;
//! log.flush()?;
//! # Ok::<(), chanbus::Error>(())
//! ```
//!
//! # Example: Reader
//!
//! ```no_run
//! use chanbus::eventlog::{EventLog, LogMode};
//!
//! let mut log = EventLog::open("./session.log", LogMode::Read)?;
//! log.seek_to_timestamp(1_000_000)?;
//! while let Some(record) = log.read_next_record()? {
//!     println!("#{} {} {}", record.eventnum, record.timestamp_us, record.channel);
//! }
//! # Ok::<(), chanbus::Error>(())
//! ```

pub mod header;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

pub use header::{RecordHeader, HEADER_SIZE, MAX_CHANNEL_LEN, SYNC_WORD};

use crate::{Error, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogMode {
    /// Scan existing records forward.
    Read,
    /// Create or truncate, then append.
    Write,
    /// Keep existing records and continue their eventnum sequence.
    Append,
}

impl LogMode {
    pub fn is_read(self) -> bool {
        matches!(self, LogMode::Read)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub eventnum: i64,
    pub timestamp_us: i64,
    pub channel: String,
    pub payload: Vec<u8>,
}

enum Handle {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

/// A read-xor-write handle on one event log file.
pub struct EventLog {
    path: PathBuf,
    mode: LogMode,
    handle: Handle,
    cursor: u64,
    next_eventnum: i64,
    last_record_offset: Option<u64>,
}

impl EventLog {
    /// Opens a log file.
    ///
    /// In [`LogMode::Append`] the existing file is scanned once so that new
    /// records continue numbering from the number of records already present.
    ///
    /// # Errors
    ///
    /// - `Error::Io`: the file cannot be opened or created
    pub fn open(path: impl AsRef<Path>, mode: LogMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (handle, cursor, next_eventnum) = match mode {
            LogMode::Read => {
                let file = File::open(&path)?;
                let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
                (Handle::Reader(reader), 0, 0)
            }
            LogMode::Write => {
                let file = File::create(&path)?;
                (Handle::Writer(BufWriter::new(file)), 0, 0)
            }
            LogMode::Append => {
                let existing = if path.exists() {
                    count_records(&path)?
                } else {
                    0
                };
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let len = file.metadata()?.len();
                debug!(
                    "appending to {} after {existing} existing records",
                    path.display()
                );
                (Handle::Writer(BufWriter::new(file)), len, existing)
            }
        };
        Ok(Self {
            path,
            mode,
            handle,
            cursor,
            next_eventnum,
            last_record_offset: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Current byte offset. For a writer this is the size including
    /// buffered, not yet flushed, bytes.
    pub fn tell(&self) -> u64 {
        self.cursor
    }

    /// Total byte length of the log.
    pub fn size(&self) -> Result<u64> {
        match &self.handle {
            Handle::Reader(reader) => Ok(reader.get_ref().metadata()?.len()),
            Handle::Writer(_) => Ok(self.cursor),
        }
    }

    /// Eventnum the next appended record will carry.
    pub fn next_eventnum(&self) -> i64 {
        self.next_eventnum
    }

    /// Appends one record and returns its eventnum.
    ///
    /// # Errors
    ///
    /// - `Error::ReadOnlyViolation`: the log was opened for reading
    /// - `Error::InvalidArgument`: empty or over-long channel, or payload
    ///   longer than `i32::MAX`
    /// - `Error::Io`: the write failed
    pub fn write_record(&mut self, timestamp_us: i64, channel: &str, payload: &[u8]) -> Result<i64> {
        let writer = match &mut self.handle {
            Handle::Writer(writer) => writer,
            Handle::Reader(_) => return Err(Error::ReadOnlyViolation),
        };
        if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
            return Err(Error::invalid(format!(
                "channel length {} outside 1..={MAX_CHANNEL_LEN}",
                channel.len()
            )));
        }
        let payload_len = i32::try_from(payload.len())
            .map_err(|_| Error::invalid("payload exceeds i32::MAX bytes"))?;

        let eventnum = self.next_eventnum;
        let header = RecordHeader {
            eventnum,
            timestamp_us,
            channel_len: channel.len() as i32,
            payload_len,
        };
        writer.write_all(&header.encode())?;
        writer.write_all(channel.as_bytes())?;
        writer.write_all(payload)?;

        self.cursor += (HEADER_SIZE + channel.len() + payload.len()) as u64;
        self.next_eventnum += 1;
        Ok(eventnum)
    }

    /// Pushes buffered records to the file. A no-op for readers.
    pub fn flush(&mut self) -> Result<()> {
        if let Handle::Writer(writer) = &mut self.handle {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flushes and releases the file. Dropping the log also releases it but
    /// loses any flush error.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        debug!("eventlog: closed {}", self.path.display());
        Ok(())
    }

    /// Reads the record at or after the cursor.
    ///
    /// Bytes that do not form a valid record are skipped. A record counts
    /// only if the four bytes after it are another sync word or the file
    /// ends before four more bytes, so a record image inside a payload is
    /// not taken for a boundary. Returns `Ok(None)` once fewer bytes remain
    /// than a complete record needs; a truncated trailing record leaves the
    /// cursor at its start, so a later call sees it once the writer
    /// completes it.
    ///
    /// # Errors
    ///
    /// - `Error::WriteOnlyViolation`: the log was opened for writing
    /// - `Error::Io`: the underlying read failed
    pub fn read_next_record(&mut self) -> Result<Option<Record>> {
        let reader = match &mut self.handle {
            Handle::Reader(reader) => reader,
            Handle::Writer(_) => return Err(Error::WriteOnlyViolation),
        };

        loop {
            let (consumed, found) = scan_sync(reader)?;
            self.cursor += consumed;
            if !found {
                return Ok(None);
            }
            let start = self.cursor - 4;

            let mut header_bytes = [0u8; HEADER_SIZE];
            header_bytes[0..4].copy_from_slice(&SYNC_WORD.to_be_bytes());
            if read_up_to(reader, &mut header_bytes[4..])? < HEADER_SIZE - 4 {
                reader.seek(SeekFrom::Start(start))?;
                self.cursor = start;
                return Ok(None);
            }

            let header = match RecordHeader::decode(&header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    warn!("{}: {err} at offset {start}, resyncing", self.path.display());
                    reader.seek(SeekFrom::Start(start + 1))?;
                    self.cursor = start + 1;
                    continue;
                }
            };

            let end = start + HEADER_SIZE as u64 + header.body_len();
            // Large lengths are checked against the file before allocating.
            if header.body_len() > READ_BUFFER_SIZE as u64
                && end > reader.get_ref().metadata()?.len()
            {
                reader.seek(SeekFrom::Start(start))?;
                self.cursor = start;
                return Ok(None);
            }
            let mut body = vec![0u8; header.body_len() as usize];
            if read_up_to(reader, &mut body)? < body.len() {
                reader.seek(SeekFrom::Start(start))?;
                self.cursor = start;
                return Ok(None);
            }

            let mut next = [0u8; 4];
            let peeked = read_up_to(reader, &mut next)?;
            if peeked == next.len() && u32::from_be_bytes(next) != SYNC_WORD {
                warn!(
                    "{}: record at offset {start} not followed by a sync word, resyncing",
                    self.path.display()
                );
                reader.seek(SeekFrom::Start(start + 1))?;
                self.cursor = start + 1;
                continue;
            }
            reader.seek_relative(-(peeked as i64))?;

            let payload = body.split_off(header.channel_len as usize);
            let channel = match String::from_utf8(body) {
                Ok(channel) => channel,
                Err(_) => {
                    warn!(
                        "{}: non-utf8 channel at offset {start}, resyncing",
                        self.path.display()
                    );
                    reader.seek(SeekFrom::Start(start + 1))?;
                    self.cursor = start + 1;
                    continue;
                }
            };

            self.cursor = end;
            self.last_record_offset = Some(start);
            return Ok(Some(Record {
                eventnum: header.eventnum,
                timestamp_us: header.timestamp_us,
                channel,
                payload,
            }));
        }
    }

    /// Moves the cursor to the first record boundary at or after `offset`,
    /// or to the end of the log if there is none.
    ///
    /// # Errors
    ///
    /// - `Error::WriteOnlyViolation`: the log was opened for writing
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.locate(offset)?;
        Ok(())
    }

    /// Positions the cursor on the first record whose timestamp is at least
    /// `timestamp_us`, assuming timestamps never decrease along the file.
    ///
    /// Binary-searches byte offsets, locating the nearest record at or after
    /// each midpoint. Equal timestamps resolve to the earliest record.
    ///
    /// # Errors
    ///
    /// - `Error::WriteOnlyViolation`: the log was opened for writing
    pub fn seek_to_timestamp(&mut self, timestamp_us: i64) -> Result<()> {
        if !self.mode.is_read() {
            return Err(Error::WriteOnlyViolation);
        }
        let mut lo = 0u64;
        let mut hi = self.size()?;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.locate(mid)? {
                Some((start, ts)) if ts < timestamp_us => lo = start + 1,
                _ => hi = mid,
            }
        }
        self.seek(lo)
    }

    /// Sequential iterator over the remaining records.
    pub fn records(&mut self) -> Records<'_> {
        Records { log: self }
    }

    /// Positions the cursor on the first record at or after `offset` and
    /// returns its start offset and timestamp.
    fn locate(&mut self, offset: u64) -> Result<Option<(u64, i64)>> {
        let size = self.size()?;
        let target = offset.min(size);
        match &mut self.handle {
            Handle::Reader(reader) => {
                reader.seek(SeekFrom::Start(target))?;
            }
            Handle::Writer(_) => return Err(Error::WriteOnlyViolation),
        }
        self.cursor = target;

        let record = match self.read_next_record()? {
            Some(record) => record,
            None => return Ok(None),
        };
        let start = match self.last_record_offset {
            Some(start) => start,
            None => return Ok(None),
        };
        if let Handle::Reader(reader) = &mut self.handle {
            reader.seek(SeekFrom::Start(start))?;
        }
        self.cursor = start;
        Ok(Some((start, record.timestamp_us)))
    }
}

pub struct Records<'a> {
    log: &'a mut EventLog,
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.log.read_next_record().transpose()
    }
}

fn count_records(path: &Path) -> Result<i64> {
    let mut log = EventLog::open(path, LogMode::Read)?;
    let mut count = 0i64;
    while log.read_next_record()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Consumes bytes until the last four read equal the sync word. Returns the
/// number of bytes consumed and whether the word was found.
fn scan_sync(reader: &mut BufReader<File>) -> Result<(u64, bool)> {
    let mut window = 0u32;
    let mut consumed = 0u64;
    loop {
        let byte = match read_byte(reader)? {
            Some(byte) => byte,
            None => return Ok((consumed, false)),
        };
        consumed += 1;
        window = (window << 8) | byte as u32;
        if consumed >= 4 && window == SYNC_WORD {
            return Ok((consumed, true));
        }
    }
}

fn read_byte(reader: &mut BufReader<File>) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Fills `buf` as far as the file allows, returning the byte count read.
fn read_up_to(reader: &mut BufReader<File>, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}
