use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A key with its bound payload, as stored in a leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue<K, V> {
	pub key: K,
	pub value: V,
}

/// Handle to a node: an index into the backend's slot arena. Handles are the
/// tree's only pointer type; the engine never holds a node reference across
/// a backend call. Two equivalent handles resolve to the same logical node
/// whether or not its bytes are resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
	pub(crate) fn new(index: usize) -> Self {
		NodeId(index)
	}

	pub(crate) fn index(self) -> usize {
		self.0
	}
}

/// A B+ tree node. Leaves hold `values` and sit on a doubly linked sibling
/// chain; internal nodes hold `children` with `mins[i]` separating
/// `children[i]` from `children[i + 1]`.
#[derive(Clone, Debug)]
pub struct Node<K, V> {
	/// Minimum keys for each child subtree, starting from the 2nd child.
	pub mins: Vec<K>,
	pub children: Vec<NodeId>,
	pub values: Vec<KeyValue<K, V>>,
	pub next: Option<NodeId>,
	pub prev: Option<NodeId>,
}

impl<K, V> Node<K, V> {
	pub fn leaf(values: Vec<KeyValue<K, V>>) -> Self {
		Node {
			mins: Vec::new(),
			children: Vec::new(),
			values,
			next: None,
			prev: None,
		}
	}

	pub fn internal(children: Vec<NodeId>, mins: Vec<K>) -> Self {
		Node {
			mins,
			children,
			values: Vec::new(),
			next: None,
			prev: None,
		}
	}

	/// Total number of entries (children for internals, values for leaves).
	pub fn count(&self) -> usize {
		self.children.len() + self.values.len()
	}

	/// A node is a leaf iff it holds values.
	pub fn is_leaf(&self) -> bool {
		!self.values.is_empty()
	}
}

/// Tree-level metadata handed to the backend on flush; becomes the header
/// record at offset 0 of the primary store.
#[derive(Debug)]
pub struct TreeMeta<'a, K> {
	pub root: Option<NodeId>,
	pub min: Option<&'a K>,
	pub order: usize,
	pub size: usize,
}

/// Backend contract for node storage. The engine creates, reads, writes and
/// removes nodes exclusively through this trait; `write` must mark the node
/// dirty so a later `flush` picks it up.
///
/// `read`/`write` materialize the node from the backing store on first
/// access. A failure to do so aborts the enclosing tree operation; no
/// rollback is attempted, and recovery is a fresh load from the last
/// successful flush.
pub trait NodeStore<K, V> {
	fn create(&mut self, node: Node<K, V>) -> NodeId;

	fn read(&mut self, id: NodeId) -> Result<&Node<K, V>>;

	fn write(&mut self, id: NodeId) -> Result<&mut Node<K, V>>;

	/// Marks the node for removal at the next flush.
	fn remove(&mut self, id: NodeId);

	/// Persists all dirty state.
	fn flush(&mut self, meta: TreeMeta<'_, K>) -> Result<()>;
}
