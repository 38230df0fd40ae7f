use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Events recovered from disk plus the byte length of the valid prefix.
#[derive(Debug, Default)]
pub struct Replayed {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only booking journal file.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail is cut off by `open` so new appends never follow garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, truncating anything after the last
    /// intact entry.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replayed = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > replayed.valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len = replayed.valid_len,
                "truncating torn journal tail"
            );
            file.set_len(replayed.valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: replayed.events.len() as u64,
        })
    }

    /// Append and fsync one event. The writer task batches with
    /// `append_buffered` + `flush_sync` instead.
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to the temp file and fsync it. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact entry. Replay stops at the first short read, CRC
    /// mismatch or undecodable payload.
    pub fn replay(path: &Path) -> io::Result<Replayed> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replayed::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut out = Replayed::default();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > crate::limits::MAX_JOURNAL_ENTRY {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => out.events.push(event),
                Err(_) => break,
            }
            out.valid_len += 8 + len as u64;
        }

        Ok(out)
    }
}
