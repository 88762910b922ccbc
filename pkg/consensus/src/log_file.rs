use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use base::DirLock;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use tracing::warn;

use crate::errors::*;
use crate::log::Ledger;
use crate::protos::*;
use crate::wire;

/// Name of the ledger file inside a node's data directory
const LEDGER_FILE_NAME: &str = "ledger";

/// Size of the fixed part of an entry frame: length (u32), term (u64), committable
/// (u8), kind (u8)
const FRAME_HEADER_SIZE: u64 = 4 + 8 + 1 + 1;

struct FileState {
	file: File,

	/// Byte offset at which the frame of each retained entry starts; entry i (1-based)
	/// is at offsets[i - 1]
	offsets: Vec<u64>,

	/// In-memory mirror of the file contents, rebuilt on open
	entries: Vec<LogEntry>,
}

/// Ledger persisted to an append-only file under a locked data directory, one entry
/// frame after another in the same layout the wire format uses. Truncation rewrites the
/// tail by cutting the file at the first removed frame. A partial trailing frame left by
/// a crash mid-append is discarded on open.
pub struct FileLedger {
	state: Mutex<FileState>,

	/// Held for the lifetime of the ledger so no second process can open the directory
	_lock: DirLock,
}

impl FileLedger {
	pub fn open(dir: &Path) -> Result<FileLedger> {
		let lock = DirLock::open(dir)?;

		let mut file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(dir.join(LEDGER_FILE_NAME))?;

		let mut data = Vec::new();
		file.read_to_end(&mut data)?;

		let mut offsets = Vec::new();
		let mut entries: Vec<LogEntry> = Vec::new();
		let mut pos = 0u64;

		loop {
			let remaining = &data[pos as usize..];
			if remaining.is_empty() {
				break;
			}

			match Self::read_frame(remaining, entries.len() as LogIndex + 1) {
				Some(entry) => {
					let frame_len = FRAME_HEADER_SIZE + entry.payload.len() as u64;
					offsets.push(pos);
					entries.push(entry);
					pos += frame_len;
				}
				None => {
					// A torn frame can only be the result of a crash mid-append, in which
					// case the entry was never acknowledged and is safe to drop
					warn!(
						offset = pos,
						trailing = remaining.len(),
						"discarding torn frame at ledger tail"
					);
					file.set_len(pos)?;
					file.sync_data()?;
					break;
				}
			}
		}

		file.seek(SeekFrom::End(0))?;

		Ok(FileLedger {
			state: Mutex::new(FileState {
				file,
				offsets,
				entries,
			}),
			_lock: lock,
		})
	}

	/// Attempts to read one complete frame from the head of the buffer
	fn read_frame(data: &[u8], index: LogIndex) -> Option<LogEntry> {
		if (data.len() as u64) < FRAME_HEADER_SIZE {
			return None;
		}

		let mut c = std::io::Cursor::new(data);
		let len = c.read_u32::<LittleEndian>().ok()? as u64;
		if (data.len() as u64) < FRAME_HEADER_SIZE + len {
			return None;
		}

		let term = c.read_u64::<LittleEndian>().ok()?;
		let committable = match c.read_u8().ok()? {
			0 => false,
			1 => true,
			_ => return None,
		};
		let kind = EntryKind::from_u8(c.read_u8().ok()?)?;

		let start = FRAME_HEADER_SIZE as usize;
		let payload = Bytes::copy_from_slice(&data[start..start + len as usize]);

		Some(LogEntry {
			index,
			term,
			committable,
			kind,
			payload,
		})
	}
}

impl Ledger for FileLedger {
	fn append(&self, entry: LogEntry) -> Result<LogIndex> {
		let mut state = self.state.lock().unwrap();

		let last_index = state.entries.len() as LogIndex;
		let last_term = state.entries.last().map(|e| e.term).unwrap_or(0);

		if entry.index != last_index + 1 {
			bail!(ErrorKind::Malformed(format!(
				"append of index {} onto last index {}",
				entry.index, last_index
			)));
		}

		if entry.term < last_term {
			bail!(ErrorKind::Malformed(format!(
				"append of term {} behind term {}",
				entry.term, last_term
			)));
		}

		let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + entry.payload.len());
		wire::put_entry_frame(&mut frame, &entry);

		let offset = state
			.offsets
			.last()
			.map(|o| o + FRAME_HEADER_SIZE + state.entries.last().unwrap().payload.len() as u64)
			.unwrap_or(0);

		state.file.write_all(&frame)?;

		// The append is only acknowledged once it is actually on disk
		state.file.sync_data()?;

		let index = entry.index;
		state.offsets.push(offset);
		state.entries.push(entry);
		Ok(index)
	}

	fn entry(&self, index: LogIndex) -> Option<LogEntry> {
		if index == 0 {
			return None;
		}

		let state = self.state.lock().unwrap();
		state.entries.get((index - 1) as usize).cloned()
	}

	fn range(&self, lo: LogIndex, hi: LogIndex) -> Vec<LogEntry> {
		let state = self.state.lock().unwrap();

		let lo = std::cmp::max(lo, 1);
		let hi = std::cmp::min(hi, state.entries.len() as LogIndex);
		if lo > hi {
			return Vec::new();
		}

		state.entries[(lo - 1) as usize..hi as usize].to_vec()
	}

	fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
		if from == 0 {
			bail!(ErrorKind::Malformed("truncate from index 0".into()));
		}

		let mut state = self.state.lock().unwrap();

		if from > state.entries.len() as LogIndex {
			return Ok(());
		}

		let cut = state.offsets[(from - 1) as usize];
		state.file.set_len(cut)?;
		state.file.sync_data()?;
		state.file.seek(SeekFrom::End(0))?;

		state.offsets.truncate((from - 1) as usize);
		state.entries.truncate((from - 1) as usize);
		Ok(())
	}

	fn first_index(&self) -> LogIndex {
		1
	}

	fn last_index(&self) -> LogIndex {
		self.state.lock().unwrap().entries.len() as LogIndex
	}

	fn term_at(&self, index: LogIndex) -> Option<Term> {
		if index == 0 {
			return Some(0);
		}

		let state = self.state.lock().unwrap();
		state.entries.get((index - 1) as usize).map(|e| e.term)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push(format!("consensus-ledger-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&p);
		p
	}

	fn entry(index: LogIndex, term: Term, payload: &[u8]) -> LogEntry {
		LogEntry {
			index,
			term,
			committable: index % 2 == 0,
			kind: EntryKind::Raw,
			payload: Bytes::copy_from_slice(payload),
		}
	}

	#[test]
	fn survives_reopen() {
		let dir = temp_dir("reopen");

		{
			let log = FileLedger::open(&dir).unwrap();
			log.append(entry(1, 2, b"first")).unwrap();
			log.append(entry(2, 2, b"second")).unwrap();
			log.append(entry(3, 3, b"")).unwrap();
		}

		let log = FileLedger::open(&dir).unwrap();
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(1).unwrap().payload.as_ref(), b"first");
		assert_eq!(log.entry(2).unwrap().payload.as_ref(), b"second");
		assert_eq!(log.term_at(3), Some(3));

		drop(log);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn truncate_rewrites_the_tail() {
		let dir = temp_dir("truncate");

		{
			let log = FileLedger::open(&dir).unwrap();
			for i in 1..=4 {
				log.append(entry(i, 1, format!("e{}", i).as_bytes())).unwrap();
			}
			log.truncate_suffix(3).unwrap();
			assert_eq!(log.last_index(), 2);

			// Appending after a truncate reuses the freed indices
			log.append(entry(3, 2, b"replacement")).unwrap();
		}

		let log = FileLedger::open(&dir).unwrap();
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(3).unwrap().payload.as_ref(), b"replacement");
		assert_eq!(log.term_at(3), Some(2));

		drop(log);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn discards_torn_tail_frame() {
		let dir = temp_dir("torn");

		{
			let log = FileLedger::open(&dir).unwrap();
			log.append(entry(1, 1, b"keep")).unwrap();
			log.append(entry(2, 1, b"gone")).unwrap();
		}

		// Chop the file mid-way through the last frame
		let path = dir.join(LEDGER_FILE_NAME);
		let len = std::fs::metadata(&path).unwrap().len();
		let f = OpenOptions::new().write(true).open(&path).unwrap();
		f.set_len(len - 2).unwrap();
		drop(f);

		let log = FileLedger::open(&dir).unwrap();
		assert_eq!(log.last_index(), 1);
		assert_eq!(log.entry(1).unwrap().payload.as_ref(), b"keep");

		drop(log);
		let _ = std::fs::remove_dir_all(&dir);
	}
}
