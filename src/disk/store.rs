use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};

use bincode::Options as _;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::mapper::Mapper;
use super::{codec, Options, Storage};
use crate::error::{Error, Result};
use crate::node::{KeyValue, Node, NodeId, NodeStore, TreeMeta};
use crate::tree::Tree;

/// Tree over the persistent backend.
pub type DiskTree<K, V, S> = Tree<K, V, DiskStore<K, V, S>>;

/// Persistent tree over plain files.
pub type FileTree<K, V> = DiskTree<K, V, std::fs::File>;

// The header record is rewritten in place on every flush; node records start
// past this reserved region so header growth never bleeds into them.
const HEADER_RESERVED: u64 = 4096;

#[derive(Serialize, Deserialize)]
struct TreeRecord<K> {
	root: String,
	min: Option<K>,
	order: u64,
	size: u64,
}

// On-disk form of a node. Handles become stable identifiers; an empty string
// stands for a null reference.
#[derive(Serialize, Deserialize)]
struct NodeRecord<K, V> {
	id: String,
	mins: Vec<K>,
	children: Vec<String>,
	values: Vec<KeyValue<K, V>>,
	next: String,
	prev: String,
}

// One handle's backing state. The body is resident only after the record
// has been decoded (or the node was created this session); `offset` is None
// until the record's position in the primary store is known.
struct Slot<K, V> {
	id: String,
	offset: Option<u64>,
	size: u64,
	node: Option<Node<K, V>>,
}

/// Node storage backed by a primary byte stream and the sharded identifier
/// catalogue. Creates, updates and deletes accumulate in memory and hit the
/// store only on flush.
pub struct DiskStore<K, V, S> {
	store: S,
	mapper: Mapper<S>,
	slots: Vec<Slot<K, V>>,
	ids: HashMap<String, NodeId>,
	dirty: HashSet<NodeId>,
	deleted: HashSet<NodeId>,
}

fn fresh_id() -> String {
	format!("{:032x}", rand::thread_rng().gen::<u128>())
}

impl<K, V, S> DiskStore<K, V, S>
where
	K: Clone + Serialize + DeserializeOwned,
	V: Clone + Serialize + DeserializeOwned,
	S: Storage,
{
	fn new(store: S, pages: Vec<S>, max_cached: usize) -> Self {
		DiskStore {
			store,
			mapper: Mapper::new(pages, max_cached),
			slots: Vec::new(),
			ids: HashMap::new(),
			dirty: HashSet::new(),
			deleted: HashSet::new(),
		}
	}

	/// Consumes the backend and hands back the primary store and the page
	/// files, so a caller can reopen the same bytes with [`load`].
	pub fn into_parts(self) -> (S, Vec<S>) {
		(self.store, self.mapper.into_pages())
	}

	// Returns the handle registered for a stable identifier, creating an
	// empty slot on first sight so equivalent references share one handle.
	fn intern(&mut self, record_id: String) -> NodeId {
		if let Some(&id) = self.ids.get(&record_id) {
			return id;
		}

		let id = NodeId::new(self.slots.len());
		self.slots.push(Slot {
			id: record_id.clone(),
			offset: None,
			size: 0,
			node: None,
		});
		self.ids.insert(record_id, id);
		id
	}

	// Materializes a node: resolve the offset through the catalogue, decode
	// one record, and intern every reference it carries. The on-store size
	// falls out of the cursor position after the decode.
	fn materialize(&mut self, id: NodeId) -> Result<()> {
		let (record_id, known_offset) = {
			let slot = &self.slots[id.index()];
			(slot.id.clone(), slot.offset)
		};

		let offset = match known_offset {
			Some(offset) => offset,
			None => self
				.mapper
				.get(&record_id)?
				.ok_or_else(|| Error::UnknownNode(record_id.clone()))?,
		};

		self.store.seek(SeekFrom::Start(offset))?;
		let record: NodeRecord<K, V> = codec()
			.deserialize_from(&mut self.store)
			.map_err(|e| Error::Deserialization(format!("node record at offset {offset}: {e}")))?;
		let end = self.store.stream_position()?;

		if record.id != record_id {
			return Err(Error::Corruption(format!(
				"node record at offset {offset} belongs to {}, expected {record_id}",
				record.id
			)));
		}

		let children = record.children.into_iter().map(|c| self.intern(c)).collect();
		let next = if record.next.is_empty() {
			None
		} else {
			Some(self.intern(record.next))
		};
		let prev = if record.prev.is_empty() {
			None
		} else {
			Some(self.intern(record.prev))
		};

		let slot = &mut self.slots[id.index()];
		slot.offset = Some(offset);
		slot.size = end - offset;
		slot.node = Some(Node {
			mins: record.mins,
			children,
			values: record.values,
			next,
			prev,
		});

		Ok(())
	}

	fn record_of(&self, id: NodeId) -> NodeRecord<K, V> {
		let slot = &self.slots[id.index()];
		let node = slot.node.as_ref().expect("dirty node is resident");

		let stable = |id: NodeId| self.slots[id.index()].id.clone();

		NodeRecord {
			id: slot.id.clone(),
			mins: node.mins.clone(),
			children: node.children.iter().map(|&c| stable(c)).collect(),
			values: node.values.clone(),
			next: node.next.map(stable).unwrap_or_default(),
			prev: node.prev.map(stable).unwrap_or_default(),
		}
	}

	fn write_header(&mut self, meta: &TreeMeta<'_, K>) -> Result<()> {
		let record = TreeRecord {
			root: meta
				.root
				.map(|id| self.slots[id.index()].id.clone())
				.unwrap_or_default(),
			min: meta.min.cloned(),
			order: meta.order as u64,
			size: meta.size as u64,
		};

		let bytes = codec()
			.serialize(&record)
			.map_err(|e| Error::Serialization(e.to_string()))?;
		if bytes.len() as u64 > HEADER_RESERVED {
			return Err(Error::Serialization(format!(
				"tree header needs {} bytes, {HEADER_RESERVED} reserved",
				bytes.len()
			)));
		}

		self.store.seek(SeekFrom::Start(0))?;
		self.store.write_all(&bytes)?;
		Ok(())
	}
}

impl<K, V, S> NodeStore<K, V> for DiskStore<K, V, S>
where
	K: Clone + Serialize + DeserializeOwned,
	V: Clone + Serialize + DeserializeOwned,
	S: Storage,
{
	fn create(&mut self, node: Node<K, V>) -> NodeId {
		let record_id = fresh_id();
		let id = NodeId::new(self.slots.len());

		self.slots.push(Slot {
			id: record_id.clone(),
			offset: None,
			size: 0,
			node: Some(node),
		});
		self.ids.insert(record_id, id);
		self.dirty.insert(id);

		id
	}

	fn read(&mut self, id: NodeId) -> Result<&Node<K, V>> {
		if self.slots[id.index()].node.is_none() {
			self.materialize(id)?;
		}
		Ok(self.slots[id.index()].node.as_ref().expect("node was just materialized"))
	}

	fn write(&mut self, id: NodeId) -> Result<&mut Node<K, V>> {
		if self.slots[id.index()].node.is_none() {
			self.materialize(id)?;
		}
		self.dirty.insert(id);
		Ok(self.slots[id.index()].node.as_mut().expect("node was just materialized"))
	}

	fn remove(&mut self, id: NodeId) {
		self.deleted.insert(id);
	}

	fn flush(&mut self, meta: TreeMeta<'_, K>) -> Result<()> {
		self.write_header(&meta)?;

		// A delete supersedes any pending update of the same node, and its
		// catalogue entry is purged so shard files stay bounded.
		let mut deleted: Vec<NodeId> = self.deleted.drain().collect();
		deleted.sort_unstable();
		let removed = deleted.len();

		for id in deleted {
			self.dirty.remove(&id);
			let record_id = {
				let slot = &mut self.slots[id.index()];
				slot.node = None;
				slot.id.clone()
			};
			self.ids.remove(&record_id);
			self.mapper.remove(&record_id)?;
		}

		// Lowest slot first keeps the record layout deterministic.
		let mut dirty: Vec<NodeId> = self.dirty.iter().copied().collect();
		dirty.sort_unstable();

		for &id in &dirty {
			let record = self.record_of(id);
			let bytes = codec()
				.serialize(&record)
				.map_err(|e| Error::Serialization(e.to_string()))?;

			// Rewrite in place when the new record fits the old slot,
			// otherwise append at end-of-file.
			let slot = &self.slots[id.index()];
			let offset = match slot.offset {
				Some(offset) if bytes.len() as u64 <= slot.size => {
					self.store.seek(SeekFrom::Start(offset))?
				}
				_ => self.store.seek(SeekFrom::End(0))?,
			};
			self.store.write_all(&bytes)?;

			{
				let slot = &mut self.slots[id.index()];
				slot.offset = Some(offset);
				slot.size = bytes.len() as u64;
			}
			let record_id = self.slots[id.index()].id.clone();
			self.mapper.set(record_id, offset)?;
		}

		self.store.sync()?;

		log::debug!("flushed {} node records ({removed} deleted)", dirty.len());
		self.dirty.clear();

		self.mapper.flush()
	}
}

/// Sets up an empty persistent tree on `store`, with the identifier
/// catalogue sharded over `pages`. Truncates whatever the storages held.
pub fn initialize<K, V, S>(store: S, pages: Vec<S>, options: Options) -> Result<DiskTree<K, V, S>>
where
	K: Ord + Clone + Serialize + DeserializeOwned,
	V: Clone + Serialize + DeserializeOwned,
	S: Storage,
{
	if pages.is_empty() {
		return Err(Error::InvalidArgument("at least one page file is required".to_string()));
	}

	let order = options.order();
	let max_cached = options.max_cached_pages(pages.len());
	let page_count = pages.len();
	let mut backend = DiskStore::new(store, pages, max_cached);

	let record = TreeRecord::<K> {
		root: String::new(),
		min: None,
		order: order as u64,
		size: 0,
	};
	let bytes = codec()
		.serialize(&record)
		.map_err(|e| Error::Serialization(e.to_string()))?;
	backend.store.seek(SeekFrom::Start(0))?;
	backend.store.write_all(&bytes)?;
	backend.store.truncate(HEADER_RESERVED)?;

	log::debug!("initialized tree store (order {order}, {page_count} page files)");

	Ok(Tree::with_store(order, backend))
}

/// Opens the tree persisted on `store` after an earlier flush. The order is
/// read back from the header; `options` only affects caching.
pub fn load<K, V, S>(mut store: S, pages: Vec<S>, options: Options) -> Result<DiskTree<K, V, S>>
where
	K: Ord + Clone + Serialize + DeserializeOwned,
	V: Clone + Serialize + DeserializeOwned,
	S: Storage,
{
	if pages.is_empty() {
		return Err(Error::InvalidArgument("at least one page file is required".to_string()));
	}

	store.seek(SeekFrom::Start(0))?;
	let record: TreeRecord<K> = codec()
		.deserialize_from(&mut store)
		.map_err(|e| Error::Deserialization(format!("tree header: {e}")))?;

	let max_cached = options.max_cached_pages(pages.len());
	let mut backend = DiskStore::new(store, pages, max_cached);

	let root = if record.root.is_empty() {
		None
	} else {
		Some(backend.intern(record.root))
	};

	log::debug!("loaded tree (order {}, {} entries)", record.order, record.size);

	Ok(Tree::from_parts(
		root,
		record.min,
		record.order as usize,
		record.size as usize,
		backend,
	))
}
