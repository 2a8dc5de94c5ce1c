use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};

use crate::model::Event;

/// Frame overhead: u32 length prefix + u32 crc32 trailer.
const FRAME_OVERHEAD: usize = 8;
/// Largest payload accepted on replay. A bigger length prefix is treated as a torn frame.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn encode_frame(buf: &mut BytesMut, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.reserve(payload.len() + FRAME_OVERHEAD);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));
    Ok(())
}

enum Frame {
    Event(Event, u64),
    End,
    /// Incomplete, oversized, checksum-failed or undecodable record.
    Torn(&'static str),
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or mid-read EOF.
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
    if len > MAX_RECORD_LEN {
        return Ok(Frame::Torn("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(Frame::Torn("truncated record"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, (len + FRAME_OVERHEAD) as u64)),
        Err(_) => Ok(Frame::Torn("undecodable record")),
    }
}

/// Result of reading a WAL from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the valid prefix. Anything after it is a torn tail.
    pub valid_len: u64,
}

/// Append-only event log, one file per organization.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little endian.
/// Appends are buffered and made durable in batches by `flush_sync`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log for appending. A torn tail left by a crash is
    /// cut off first so new records never land behind unreadable bytes.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded = on_disk - valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Read every intact record. Stops at the first torn frame.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    replay.events.push(event);
                    replay.valid_len += size;
                }
                Frame::End => break,
                Frame::Torn(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = replay.valid_len,
                        reason,
                        "WAL replay stopped at torn record"
                    );
                    break;
                }
            }
        }
        Ok(replay)
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mut frame = BytesMut::new();
        encode_frame(&mut frame, event)?;
        self.writer.write_all(&frame)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.compact")
    }

    /// Replace the log with `events`: written and synced to a side file, then
    /// renamed over the live log and reopened for appends.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let side = self.compact_path();
        let mut buf = BytesMut::new();
        for event in events {
            encode_frame(&mut buf, event)?;
        }
        {
            let mut file = File::create(&side)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&side, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NightRange;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("allotd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn unit_created() -> Event {
        Event::UnitCreated {
            id: Ulid::new(),
            name: Some("Double room".into()),
        }
    }

    fn capacity_set() -> Event {
        Event::BucketCapacitySet {
            bucket_id: Ulid::new(),
            range: NightRange::new(20_000, 20_010),
            quantity: 8,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![unit_created(), capacity_set()];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = tmp_path("torn_tail.wal");
        let first = unit_created();
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first.clone()]);

        let second = capacity_set();
        {
            let mut wal = Wal::open(&path, replay.valid_len).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, vec![first, second]);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::BucketReleased { bucket_id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        assert!(Wal::replay(&path).unwrap().events.is_empty());
    }

    #[test]
    fn rewrite_then_append() {
        let path = tmp_path("rewrite.wal");
        let bucket_id = Ulid::new();
        let kept = unit_created();
        let churn = Event::CountersAdjusted {
            bucket_id,
            range: NightRange::new(20_000, 20_001),
            delta_booked: 1,
            delta_held: 0,
        };
        let after = Event::BucketReleased { bucket_id };
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&kept).unwrap();
            for _ in 0..10 {
                wal.append(&churn).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.rewrite(std::slice::from_ref(&kept)).unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&after).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, after]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| unit_created()).collect();
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
