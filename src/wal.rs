//! Append-only write-ahead log of [`Event`]s.
//!
//! Entry layout: `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.
//! A torn or corrupt tail (crash mid-write) ends replay at the last good entry.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// No single event comes anywhere near this; a larger prefix means garbage.
const MAX_ENTRY_LEN: usize = 1 << 20;

fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_ENTRY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event of {} bytes exceeds the WAL entry limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Entry {
    Event(Event),
    /// Clean end of file.
    End,
    /// Truncated, oversized, checksum mismatch or undecodable payload.
    Torn(&'static str),
}

/// `Ok(false)` on EOF before the buffer is full.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Entry::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_LEN {
        return Ok(Entry::Torn("oversized entry"));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Entry::Torn("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Entry::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Entry::Event(event),
        Err(_) => Entry::Torn("undecodable payload"),
    })
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful `flush_sync()`.
    synced_len: u64,
    /// Buffered since the last sync; not yet counted in `appends_since_compact`.
    unsynced_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            unsynced_appends: 0,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Durable only after the next `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.unsynced_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.appends_since_compact += self.unsynced_appends;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything written since the last successful `flush_sync()`:
    /// buffered bytes are discarded and the file is cut back to its synced length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without writing it out.
        let _ = stale.into_parts();
        self.unsynced_appends = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the replacement log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.unsynced_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every valid event in the log, in append order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_entry(&mut reader)? {
                Entry::Event(event) => events.push(event),
                Entry::End => break,
                Entry::Torn(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        "WAL tail discarded: {reason}"
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Span};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn service(id: i64) -> Event {
        Event::ServiceCreated {
            id,
            title: format!("Service {id}"),
            description: String::new(),
            price_cents: 1500,
            duration_minutes: 30,
            active: true,
            created_at: 1,
        }
    }

    fn booking(id: i64, service_id: i64) -> Event {
        Event::BookingCreated {
            id,
            user_id: 5,
            service_id,
            span: Span::new(1_000 * id, 1_000 * id + 500),
            status: BookingStatus::Pending,
            created_at: 2,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![service(1), booking(1, 1), Event::BookingDeleted { id: 1, service_id: 1 }];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![service(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service(1)).unwrap();
        }
        {
            let payload = bincode::serialize(&service(2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        {
            // Entries after the corrupt one are unreachable too.
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service(3)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![service(1)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service(1)).unwrap();
            for id in 1..=20 {
                wal.append(&booking(id, 1)).unwrap();
                wal.append(&Event::BookingDeleted { id, service_id: 1 }).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 41);
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![
            Event::IdsReserved { next_booking_id: 21, next_review_id: 1 },
            service(1),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&booking(21, 1)).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");

        let mut expected = snapshot.clone();
        expected.push(booking(21, 1));
        assert_eq!(Wal::replay(&path).unwrap(), expected);
        assert!(!Wal::compact_path(&path).exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(service).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_event_is_refused_before_writing() {
        let path = tmp_path("refuse_oversized.wal");
        let mut wal = Wal::open(&path).unwrap();
        let huge = Event::ServiceCreated {
            id: 9,
            title: String::new(),
            description: "x".repeat(MAX_ENTRY_LEN + 1),
            price_cents: 0,
            duration_minutes: 30,
            active: true,
            created_at: 1,
        };
        let err = wal.append_buffered(&huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        wal.flush_sync().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unsynced_entries() {
        let path = tmp_path("rollback.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&service(1)).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&service(2)).unwrap();
        wal.append_buffered(&service(3)).unwrap();
        // Part of the batch reaches the file before the failure.
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > synced);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&service(4)).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![service(1), service(4)]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_after_reopen_keeps_existing_log() {
        let path = tmp_path("rollback_reopen.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&service(1)).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&service(2)).unwrap();
        wal.rollback().unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![service(1)]);
        let _ = fs::remove_file(&path);
    }
}
