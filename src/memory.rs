use crate::error::Result;
use crate::node::{Node, NodeId, NodeStore, TreeMeta};
use crate::tree::Tree;

/// Tree over the in-memory arena backend.
pub type MemoryTree<K, V> = Tree<K, V, Arena<K, V>>;

/// In-memory node storage: a slot arena indexed by handle. Reads and writes
/// are plain slot access, removal frees the slot for reuse, and flushing is
/// a no-op.
pub struct Arena<K, V> {
	nodes: Vec<Option<Node<K, V>>>,
	free: Vec<usize>,
}

impl<K, V> Arena<K, V> {
	pub fn new() -> Self {
		Arena {
			nodes: Vec::new(),
			free: Vec::new(),
		}
	}

	#[cfg(test)]
	fn live(&self) -> usize {
		self.nodes.iter().filter(|slot| slot.is_some()).count()
	}
}

impl<K, V> Default for Arena<K, V> {
	fn default() -> Self {
		Arena::new()
	}
}

impl<K, V> NodeStore<K, V> for Arena<K, V> {
	fn create(&mut self, node: Node<K, V>) -> NodeId {
		match self.free.pop() {
			Some(index) => {
				self.nodes[index] = Some(node);
				NodeId::new(index)
			}
			None => {
				self.nodes.push(Some(node));
				NodeId::new(self.nodes.len() - 1)
			}
		}
	}

	fn read(&mut self, id: NodeId) -> Result<&Node<K, V>> {
		Ok(self.nodes[id.index()].as_ref().expect("read of a removed node"))
	}

	fn write(&mut self, id: NodeId) -> Result<&mut Node<K, V>> {
		Ok(self.nodes[id.index()].as_mut().expect("write of a removed node"))
	}

	fn remove(&mut self, id: NodeId) {
		self.nodes[id.index()] = None;
		self.free.push(id.index());
	}

	fn flush(&mut self, _meta: TreeMeta<'_, K>) -> Result<()> {
		Ok(())
	}
}

impl<K, V> MemoryTree<K, V>
where
	K: Ord + Clone,
	V: Clone,
{
	/// Creates an empty in-memory tree.
	///
	/// Panics if `order` is below [`crate::MIN_ORDER`].
	pub fn new(order: usize) -> Self {
		Tree::with_store(order, Arena::new())
	}

	/// Removes every entry, resetting the tree to its initial state.
	pub fn clear(&mut self) {
		*self = MemoryTree::new(self.order());
	}
}
