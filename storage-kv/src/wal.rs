use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Magic header identifying a wallet environment log.
const LOG_MAGIC: [u8; 8] = *b"COFRWAL1";

const LOG_FILENAME: &str = "env.wal";

/// Error surfaced by the [`RecordLog`] implementation.
#[derive(Debug, Error)]
pub enum WalError {
    /// Generic I/O failure while manipulating the log on disk.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The file does not start with the environment log magic.
    #[error("not an environment log")]
    BadMagic,
}

/// Append-only record log backing the key/value environment.
///
/// The file starts with an eight-byte magic, followed by records framed as a
/// big-endian length prefix and an opaque payload. The environment replays
/// the whole log on open and compacts it by rewriting a snapshot, so the log
/// keeps no record index; it only tracks the end of the verified region. A
/// torn tail record (a crash between append and sync) is truncated away on
/// the next open.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// End of the last complete record; appends land here.
    tail: u64,
    records: usize,
}

impl RecordLog {
    /// Open or create the log located at `directory`.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self, WalError> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;
        let path = directory.join(LOG_FILENAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let (tail, records) = scan_verified_region(&file)?;

        // Drop any torn tail so appends continue from a clean frame.
        if file.metadata()?.len() > tail {
            file.set_len(tail)?;
        }

        let mut writer = BufWriter::new(file);
        if tail == LOG_MAGIC.len() as u64 {
            writer.seek(SeekFrom::Start(0))?;
            writer.write_all(&LOG_MAGIC)?;
            writer.flush()?;
        }
        writer.seek(SeekFrom::Start(tail))?;

        Ok(RecordLog {
            path,
            writer,
            tail,
            records,
        })
    }

    /// Append one record payload. Buffered; call [`RecordLog::sync`] to make
    /// a batch durable.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), WalError> {
        let len = payload.len() as u32;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(payload)?;
        self.tail += 4 + payload.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Flush buffered records and ensure they are durably persisted.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Read back every record payload of the verified region, in append
    /// order. Buffered appends are flushed first so the read is complete.
    pub fn replay(&mut self) -> Result<Vec<Vec<u8>>, WalError> {
        self.writer.flush()?;
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != LOG_MAGIC {
            return Err(WalError::BadMagic);
        }

        let mut payloads = Vec::with_capacity(self.records);
        let mut offset = LOG_MAGIC.len() as u64;
        while offset < self.tail {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            payloads.push(payload);
            offset += 4 + len as u64;
        }
        Ok(payloads)
    }

    /// Number of records in the verified region.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Replace the whole log with `records`, atomically.
    ///
    /// Used by the environment to compact history into a snapshot: the new
    /// contents are written to a sibling file which is then renamed over the
    /// live log.
    pub fn rewrite(&mut self, records: &[Vec<u8>]) -> Result<(), WalError> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp_file = BufWriter::new(File::create(&tmp_path)?);
        tmp_file.write_all(&LOG_MAGIC)?;

        let mut tail = LOG_MAGIC.len() as u64;
        for payload in records {
            let len = payload.len() as u32;
            tmp_file.write_all(&len.to_be_bytes())?;
            tmp_file.write_all(payload)?;
            tail += 4 + payload.len() as u64;
        }

        tmp_file.flush()?;
        tmp_file.get_ref().sync_data()?;
        drop(tmp_file);

        fs::rename(tmp_path, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(tail))?;

        self.writer = writer;
        self.tail = tail;
        self.records = records.len();
        Ok(())
    }
}

/// Walk the frames of `file`, returning the end offset of the last complete
/// record and the record count. An empty file verifies as magic-only.
fn scan_verified_region(file: &File) -> Result<(u64, usize), WalError> {
    let file_len = file.metadata()?.len();
    let magic_len = LOG_MAGIC.len() as u64;
    if file_len == 0 {
        return Ok((magic_len, 0));
    }

    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(|_| WalError::BadMagic)?;
    if magic != LOG_MAGIC {
        return Err(WalError::BadMagic);
    }

    let mut tail = magic_len;
    let mut records = 0usize;
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(WalError::Io(err)),
        }
        let len = u32::from_be_bytes(len_buf) as u64;
        if tail + 4 + len > file_len {
            // Torn tail; everything before it is good.
            break;
        }
        reader.seek(SeekFrom::Current(len as i64))?;
        tail += 4 + len;
        records += 1;
    }

    Ok((tail, records))
}
