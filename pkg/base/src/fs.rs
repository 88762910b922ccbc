use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Name of the lock file placed inside a locked data directory
const LOCK_FILE_NAME: &str = "LOCK";

/// An exclusive advisory lock over a data directory
/// While an instance of this is alive, no other process on this machine can acquire the same directory
/// The lock is tied to the process, so a crash releases it without any cleanup
pub struct DirLock {
	/// Handle to the lock file which holds the advisory lock
	file: File,

	/// Absolute path to the directory being locked
	path: PathBuf,
}

impl DirLock {
	/// Locks the given directory, creating it if it does not exist yet
	pub fn open(path: &Path) -> io::Result<DirLock> {
		if !path.exists() {
			std::fs::create_dir_all(path)?;
		}

		if !path.is_dir() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"Lock target is not a directory",
			));
		}

		let lock_path = path.join(LOCK_FILE_NAME);

		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&lock_path)?;

		// NOTE: This will fail immediately rather than blocking if another process owns the directory
		file.try_lock_exclusive().map_err(|_| {
			io::Error::new(
				io::ErrorKind::WouldBlock,
				format!("Directory is locked by another process: {:?}", path),
			)
		})?;

		Ok(DirLock {
			file,
			path: path.to_owned(),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for DirLock {
	fn drop(&mut self) {
		// If this fails there is nothing sensible left to do with the handle
		let _ = self.file.unlock();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_dir(name: &str) -> PathBuf {
		let mut p = std::env::temp_dir();
		p.push(format!("base-dirlock-{}-{}", name, std::process::id()));
		p
	}

	#[test]
	fn lock_is_exclusive_within_a_process() {
		let dir = temp_dir("excl");
		let first = DirLock::open(&dir).unwrap();

		// fs2 advisory locks are per file handle, so a second open in the same process must fail
		assert!(DirLock::open(&dir).is_err());

		drop(first);
		let again = DirLock::open(&dir).unwrap();
		assert_eq!(again.path(), dir.as_path());

		drop(again);
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn creates_missing_directory() {
		let dir = temp_dir("create");
		let _ = std::fs::remove_dir_all(&dir);

		let lock = DirLock::open(&dir).unwrap();
		assert!(dir.is_dir());

		drop(lock);
		let _ = std::fs::remove_dir_all(&dir);
	}
}
