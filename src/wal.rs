use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// File header: magic plus a format version byte.
const MAGIC: &[u8; 4] = b"CHTW";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// Largest payload a single frame may claim. A bigger length prefix means
/// the tail is garbage, not a real record.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])
}

/// Encode a single event as `[u32 len][bincode][u32 crc32]`.
fn encode_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Outcome of reading one frame off the log.
enum Frame {
    Event(Event),
    End,
    /// Torn or corrupt tail; everything from here on is dropped.
    Damaged(&'static str),
}

/// `read_exact` that reports a clean EOF as `false`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Damaged("oversized length prefix"));
    }

    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? {
        return Ok(Frame::Damaged("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut crc_buf)? {
        return Ok(Frame::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Event(event),
        Err(_) => Frame::Damaged("undecodable payload"),
    })
}

/// Append-only event log for one tenant.
///
/// Layout: a 5-byte header (`CHTW` + version), then frames of
/// `[u32 len][bincode Event][u32 crc32]`, all little-endian. A torn final
/// frame from a crash is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`. A new file gets its header immediately.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            write_header(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot to the side file and fsync it. The live log is untouched.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        write_header(&mut writer)?;
        for event in events {
            encode_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        // Anything still buffered belongs to the old file.
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
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

    /// Read every intact event from `path`. A missing or empty file is an
    /// empty log; a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // A crash while writing the header; `open` writes a fresh one.
                truncate(path, 0)?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }
        if &header[..MAGIC.len()] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a chairtime WAL", path.display()),
            ));
        }
        if header[MAGIC.len()] != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported WAL version {}", header[MAGIC.len()]),
            ));
        }

        let mut events = Vec::new();
        loop {
            let intact_len = reader.stream_position()?;
            match read_frame(&mut reader)? {
                Frame::Event(event) => events.push(event),
                Frame::End => break,
                Frame::Damaged(why) => {
                    warn!(
                        path = %path.display(),
                        kept = events.len(),
                        "discarding WAL tail: {why}"
                    );
                    // New appends must follow the last intact frame.
                    truncate(path, intact_len)?;
                    break;
                }
            }
        }
        Ok(events)
    }
}

fn truncate(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, Action, Salon, Service};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chairtime_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn salon_created(id: Ulid) -> Event {
        Event::SalonCreated {
            salon: Salon {
                id,
                name: Some("Corner Cuts".into()),
                opening_hour: 9,
                closing_hour: 18,
                max_concurrent_slots: 2,
                is_active: true,
            },
        }
    }

    fn service_created(salon_id: Ulid) -> Event {
        Event::ServiceCreated {
            service: Service {
                id: Ulid::new(),
                salon_id,
                name: None,
                duration_minutes: 45,
            },
        }
    }

    fn cancelled(salon_id: Ulid) -> Event {
        Event::AppointmentTransitioned {
            id: Ulid::new(),
            salon_id,
            actor: Actor::Salon,
            action: Action::Cancel { message: None },
            at: NaiveDate::from_ymd_opt(2030, 1, 2)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let salon = Ulid::new();
        let events = vec![salon_created(salon), service_created(salon), cancelled(salon)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn fresh_file_carries_header_only() {
        let path = tmp_path("header_only.wal");
        drop(Wal::open(&path).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"CHTW\x01");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn reopen_does_not_duplicate_header() {
        let path = tmp_path("reopen.wal");
        let first = salon_created(Ulid::new());
        let second = salon_created(Ulid::new());
        Wal::open(&path).unwrap().append(&first).unwrap();
        Wal::open(&path).unwrap().append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = salon_created(Ulid::new());
        Wal::open(&path).unwrap().append(&event).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn appends_after_torn_tail_survive() {
        let path = tmp_path("torn_then_append.wal");
        let first = salon_created(Ulid::new());
        Wal::open(&path).unwrap().append(&first).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9u8, 0, 0]).unwrap();
        drop(f);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);
        let second = service_created(Ulid::new());
        Wal::open(&path).unwrap().append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = salon_created(Ulid::new());
        Wal::open(&path).unwrap().append(&good).unwrap();

        let payload = bincode::serialize(&cancelled(Ulid::new())).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_rejects_oversized_frame() {
        let path = tmp_path("oversized.wal");
        drop(Wal::open(&path).unwrap());
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&u32::MAX.to_le_bytes()).unwrap();

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn foreign_file_is_an_error() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x00\x00").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let salon = Ulid::new();
        let snapshot = vec![salon_created(salon), service_created(salon)];
        let mut wal = Wal::open(&path).unwrap();
        for e in &snapshot {
            wal.append(e).unwrap();
        }
        for _ in 0..20 {
            wal.append(&cancelled(salon)).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 22);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let after = cancelled(salon);
        wal.append(&after).unwrap();
        let mut expected = snapshot.clone();
        expected.push(after);
        assert_eq!(Wal::replay(&path).unwrap(), expected);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| salon_created(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
