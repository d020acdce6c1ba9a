use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Frames claiming a larger payload are treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    // Replay stops at such a frame, which would hide every later event.
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Next intact event, `None` at end of log or at the first bad frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// `false` on a short read; any other I/O error propagates.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Append-only event log for one site.
///
/// Frame: `[u32 len][bincode Event][u32 crc32]`, little-endian. A torn or
/// corrupt tail (crash mid-write) ends replay at the last good frame.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back out of the log. Appends
    /// are refused until compaction rewrites the file.
    poisoned: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            poisoned: false,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch([event])
    }

    /// Append a batch under one fsync. All or nothing: if any frame fails to
    /// write or the sync fails, the log is cut back to where the batch began.
    pub fn append_batch<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(
                "WAL refuses appends after a failed rollback",
            ));
        }
        let start = self.end_offset()?;
        let mut appended = 0;
        let mut result = Ok(());
        for event in events {
            if let Err(e) = self.append_buffered(event) {
                result = Err(e);
                break;
            }
            appended += 1;
        }
        if result.is_ok() {
            result = self.flush_sync();
        }

        if let Err(e) = &result {
            match self.truncate(start, appended) {
                Ok(()) => warn!("WAL batch rolled back to offset {start}: {e}"),
                Err(rollback) => {
                    self.poisoned = true;
                    error!("WAL rollback to offset {start} failed, refusing appends: {rollback}");
                }
            }
        }
        result
    }

    /// Buffer one frame. Nothing is durable until `flush_sync`.
    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Bytes on disk. Only exact between batches, when nothing is buffered.
    fn end_offset(&self) -> io::Result<u64> {
        Ok(self.writer.get_ref().metadata()?.len())
    }

    /// Drop every frame past `len`, buffered or already written, and resume
    /// appending at the new end.
    fn truncate(&mut self, len: u64, dropped: u64) -> io::Result<()> {
        let stale = std::mem::replace(&mut self.writer, open_append(&self.path)?);
        // into_parts hands back the buffer instead of flushing it on drop.
        let (file, _unwritten) = stale.into_parts();
        file.set_len(len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(dropped);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event list next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
