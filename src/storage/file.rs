//! File-backed storage.
//!
//! Layout inside the data directory:
//! - `term` — current term, one checksummed line
//! - `voted_for` — vote for the current term, one checksummed line
//! - `log` — one checksummed JSON line per entry, append-only
//!
//! Every line carries a CRC32 so a torn write surfaces as
//! [`StorageError::Corruption`] on the next load instead of silently
//! feeding the node bad state. Writes fsync before returning; log
//! truncation rewrites through a temp file and renames over the original.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{Storage, StorageError};
use crate::core::raft_core::LogEntry;

/// CRC32, IEEE polynomial, bitwise.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let low_bit_set = crc & 1 != 0;
            crc >>= 1;
            if low_bit_set {
                crc ^= 0xEDB8_8320;
            }
        }
    }
    !crc
}

/// Render a payload as a `"{payload} {crc32:08x}"` line.
fn checksummed_line(payload: &str) -> String {
    format!("{} {:08x}", payload, crc32(payload.as_bytes()))
}

/// Split a `"{payload} {crc32:08x}"` line and verify the checksum.
fn verify_line<'a>(line: &'a str, context: &str) -> Result<&'a str, StorageError> {
    let (payload, checksum_hex) = line
        .rsplit_once(' ')
        .ok_or_else(|| StorageError::Corruption(format!("{context}: missing checksum")))?;
    let stored = u32::from_str_radix(checksum_hex, 16)
        .map_err(|_| StorageError::Corruption(format!("{context}: malformed checksum")))?;
    let computed = crc32(payload.as_bytes());
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "{context}: checksum mismatch, stored {stored:08x}, computed {computed:08x}"
        )));
    }
    Ok(payload)
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Storage over plain files in a single directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) the data directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(FileStorage { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join("term")
    }

    fn voted_for_path(&self) -> PathBuf {
        self.dir.join("voted_for")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn write_value(&self, path: &Path, payload: &str) -> Result<(), StorageError> {
        let mut file = File::create(path).map_err(io_err)?;
        writeln!(file, "{}", checksummed_line(payload)).map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    fn read_value(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(io_err)?;
        let line = content.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let payload = verify_line(line, &format!("{}", path.display()))?;
        Ok(Some(payload.to_string()))
    }

    fn render_entry(entry: &LogEntry) -> Result<String, StorageError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| StorageError::Io(format!("log entry serialization: {e}")))?;
        Ok(checksummed_line(&json))
    }

    /// Rewrite a file atomically: temp file, fsync, rename.
    fn rewrite(&self, path: &Path, content: &str) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&temp_path, path).map_err(io_err)
    }
}

impl Storage for FileStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        match self.read_value(&self.term_path())? {
            None => Ok(0),
            Some(payload) => payload
                .parse()
                .map_err(|e| StorageError::Corruption(format!("invalid term: {e}"))),
        }
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.write_value(&self.term_path(), &term.to_string())
    }

    fn load_voted_for(&self) -> Result<Option<u64>, StorageError> {
        match self.read_value(&self.voted_for_path())? {
            None => Ok(None),
            Some(payload) if payload == "none" => Ok(None),
            Some(payload) => {
                let id = payload
                    .parse()
                    .map_err(|e| StorageError::Corruption(format!("invalid voted_for: {e}")))?;
                Ok(Some(id))
            }
        }
    }

    fn save_voted_for(&mut self, voted_for: Option<u64>) -> Result<(), StorageError> {
        let payload = match voted_for {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        self.write_value(&self.voted_for_path(), &payload)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path).map_err(io_err)?);
        let mut entries = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let context = format!("log line {}", line_number + 1);
            let json = verify_line(line.trim(), &context)?;
            let entry: LogEntry = serde_json::from_str(json)
                .map_err(|e| StorageError::Corruption(format!("{context}: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(io_err)?;
        for entry in entries {
            writeln!(file, "{}", Self::render_entry(entry)?).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let mut content = String::new();
        for entry in self.load_log()? {
            if entry.index < from_index {
                content.push_str(&Self::render_entry(&entry)?);
                content.push('\n');
            }
        }
        self.rewrite(&self.log_path(), &content)
    }
}
