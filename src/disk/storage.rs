use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Byte-stream abstraction for the primary store and the catalogue page
/// files. `std::fs::File` is the production implementation; `MemoryStorage`
/// backs tests.
pub trait Storage: Read + Write + Seek {
	/// Durability barrier: everything written so far reaches stable storage.
	fn sync(&mut self) -> io::Result<()>;

	/// Resizes to exactly `len` bytes, zero-extending if the stream grows.
	fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Storage for File {
	fn sync(&mut self) -> io::Result<()> {
		self.sync_all()
	}

	fn truncate(&mut self, len: u64) -> io::Result<()> {
		self.set_len(len)
	}
}

/// In-memory storage over a growable byte buffer.
#[derive(Default)]
pub struct MemoryStorage {
	inner: Cursor<Vec<u8>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		MemoryStorage {
			inner: Cursor::new(Vec::new()),
		}
	}

	pub fn as_bytes(&self) -> &[u8] {
		self.inner.get_ref()
	}
}

impl Read for MemoryStorage {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.inner.read(buf)
	}
}

impl Write for MemoryStorage {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.inner.write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.inner.flush()
	}
}

impl Seek for MemoryStorage {
	fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
		self.inner.seek(pos)
	}
}

impl Storage for MemoryStorage {
	fn sync(&mut self) -> io::Result<()> {
		Ok(())
	}

	fn truncate(&mut self, len: u64) -> io::Result<()> {
		self.inner.get_mut().resize(len as usize, 0);
		Ok(())
	}
}
