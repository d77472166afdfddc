use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::num::NonZeroUsize;

use bincode::Options as _;
use lru::LruCache;
use xxhash_rust::xxh64::xxh64;

use super::{codec, Storage};
use crate::error::{Error, Result};

type Shard = HashMap<String, u64>;

/// Sharded catalogue from node identifier to primary-store offset. Each page
/// file holds one shard, serialized as a single dictionary; identifiers are
/// partitioned by 64-bit hash modulo the page count.
///
/// Decoded shards live either in the LRU cache (clean) or in the dirty map
/// (pending write-back), never both, so cache eviction cannot drop dirty
/// state.
pub(crate) struct Mapper<S> {
	pages: Vec<S>,
	updates: HashMap<usize, Shard>,
	cache: LruCache<usize, Shard>,
}

impl<S: Storage> Mapper<S> {
	pub(crate) fn new(pages: Vec<S>, max_cached: usize) -> Self {
		let capacity = NonZeroUsize::new(max_cached.max(1)).expect("cache capacity is positive");
		Mapper {
			pages,
			updates: HashMap::new(),
			cache: LruCache::new(capacity),
		}
	}

	pub(crate) fn into_pages(self) -> Vec<S> {
		self.pages
	}

	fn shard_of(&self, id: &str) -> usize {
		(xxh64(id.as_bytes(), 0) % self.pages.len() as u64) as usize
	}

	pub(crate) fn get(&mut self, id: &str) -> Result<Option<u64>> {
		let h = self.shard_of(id);

		if let Some(shard) = self.updates.get(&h) {
			return Ok(shard.get(id).copied());
		}
		if let Some(shard) = self.cache.get(&h) {
			return Ok(shard.get(id).copied());
		}

		let shard = self.load(h)?;
		let offset = shard.get(id).copied();
		self.cache.put(h, shard);
		Ok(offset)
	}

	pub(crate) fn set(&mut self, id: String, offset: u64) -> Result<()> {
		let h = self.shard_of(&id);
		self.dirty_shard(h)?.insert(id, offset);
		Ok(())
	}

	pub(crate) fn remove(&mut self, id: &str) -> Result<()> {
		let h = self.shard_of(id);
		self.dirty_shard(h)?.remove(id);
		Ok(())
	}

	/// Writes every dirty shard back to its page file: encode the full
	/// dictionary from the start of the file, then truncate to the encoded
	/// length so a shorter replacement leaves no stale trailing bytes.
	pub(crate) fn flush(&mut self) -> Result<()> {
		let mut dirty: Vec<usize> = self.updates.keys().copied().collect();
		dirty.sort_unstable();

		for &h in &dirty {
			let shard = &self.updates[&h];
			let file = &mut self.pages[h];
			file.seek(SeekFrom::Start(0))?;
			codec()
				.serialize_into(&mut *file, shard)
				.map_err(|e| Error::Serialization(e.to_string()))?;
			let len = file.stream_position()?;
			file.truncate(len)?;
		}

		// Written shards go back to the clean cache.
		for (h, shard) in self.updates.drain() {
			self.cache.put(h, shard);
		}

		Ok(())
	}

	// Resolves a shard into the dirty map, pulling it out of the cache or
	// decoding it from its page file.
	fn dirty_shard(&mut self, h: usize) -> Result<&mut Shard> {
		if !self.updates.contains_key(&h) {
			let shard = match self.cache.pop(&h) {
				Some(shard) => shard,
				None => self.load(h)?,
			};
			self.updates.insert(h, shard);
		}
		Ok(self.updates.get_mut(&h).expect("shard was just inserted"))
	}

	fn load(&mut self, h: usize) -> Result<Shard> {
		let file = &mut self.pages[h];
		file.seek(SeekFrom::Start(0))?;

		match codec().deserialize_from(&mut *file) {
			Ok(shard) => Ok(shard),
			Err(_) => {
				// A zero-length page file is a valid empty shard; anything
				// else that fails to decode is unusable.
				let len = file.seek(SeekFrom::End(0))?;
				if len == 0 {
					Ok(Shard::new())
				} else {
					log::error!("page file {h} failed to decode ({len} bytes)");
					Err(Error::CorruptedPageFile(h))
				}
			}
		}
	}
}
