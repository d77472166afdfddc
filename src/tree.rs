use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};

use crate::error::Result;
use crate::node::{KeyValue, Node, NodeId, NodeStore, TreeMeta};

/// Smallest usable tree order.
pub const MIN_ORDER: usize = 3;

/// An ordered map over `(K, V)` backed by a B+ tree of order `order`. All
/// node access goes through the `NodeStore` handle layer, so the same engine
/// runs over the in-memory arena and the persistent backend.
pub struct Tree<K, V, S> {
	root: Option<NodeId>,
	min: Option<K>,
	order: usize,
	size: usize,
	store: S,
	_values: PhantomData<V>,
}

// Outcome of a recursive insert: the subtree's updated minimum, the new
// right sibling if the node split, and the value displaced by a duplicate
// key.
struct Inserted<K, V> {
	min: K,
	split: Option<(NodeId, K)>,
	replaced: Option<V>,
}

// Outcome of a recursive delete. `min` is None only when the subtree lost
// its last entry, which can happen for the root leaf alone.
struct Removed<K, V> {
	value: V,
	min: Option<K>,
}

impl<K, V, S> Tree<K, V, S>
where
	K: Ord + Clone,
	V: Clone,
	S: NodeStore<K, V>,
{
	/// Creates an empty tree over the given backend.
	///
	/// Panics if `order` is below [`MIN_ORDER`].
	pub fn with_store(order: usize, store: S) -> Self {
		assert!(order >= MIN_ORDER, "invalid tree order ({order}), minimum is {MIN_ORDER}");

		Tree {
			root: None,
			min: None,
			order,
			size: 0,
			store,
			_values: PhantomData,
		}
	}

	pub(crate) fn from_parts(
		root: Option<NodeId>,
		min: Option<K>,
		order: usize,
		size: usize,
		store: S,
	) -> Self {
		Tree {
			root,
			min,
			order,
			size,
			store,
			_values: PhantomData,
		}
	}

	/// Number of entries in the tree.
	pub fn len(&self) -> usize {
		self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	pub fn order(&self) -> usize {
		self.order
	}

	/// Persists all dirty state through the backend. A no-op for the
	/// in-memory arena.
	pub fn flush(&mut self) -> Result<()> {
		let meta = TreeMeta {
			root: self.root,
			min: self.min.as_ref(),
			order: self.order,
			size: self.size,
		};
		self.store.flush(meta)
	}

	/// Consumes the tree and hands back its backend. Pending edits that were
	/// never flushed are lost.
	pub fn into_store(self) -> S {
		self.store
	}

	pub(crate) fn store_mut(&mut self) -> &mut S {
		&mut self.store
	}

	/// Inserts a key-value pair, replacing and returning the previous value
	/// bound to the key. The tree grows by one entry iff the key was absent.
	pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
		let replaced = match self.root {
			None => {
				let kv = KeyValue {
					key: key.clone(),
					value,
				};
				let id = self.store.create(Node::leaf(vec![kv]));
				self.root = Some(id);
				self.min = Some(key);
				None
			}
			Some(root) => {
				let minimum = self.min.clone().expect("non-empty tree has a minimum");
				let out = self.insert_at(root, minimum, key, value)?;
				self.min = Some(out.min);

				if let Some((brother, brother_min)) = out.split {
					// The root split: wrap both halves in a new root with a
					// single separator.
					let new_root =
						self.store.create(Node::internal(vec![root, brother], vec![brother_min]));
					self.root = Some(new_root);
				}

				out.replaced
			}
		};

		if replaced.is_none() {
			self.size += 1;
		}

		Ok(replaced)
	}

	/// Returns the value bound to `key`, if present.
	pub fn find(&mut self, key: &K) -> Result<Option<V>> {
		let Some(root) = self.root else {
			return Ok(None);
		};

		let (leaf, idx, found) = self.locate(root, key)?;

		if found {
			let node = self.store.read(leaf)?;
			Ok(Some(node.values[idx].value.clone()))
		} else {
			Ok(None)
		}
	}

	/// Removes the binding for `key` and returns its value, if present.
	pub fn delete(&mut self, key: &K) -> Result<Option<V>> {
		let Some(root) = self.root else {
			return Ok(None);
		};

		let minimum = self.min.clone().expect("non-empty tree has a minimum");
		let Some(removed) = self.delete_at(root, key, minimum)? else {
			return Ok(None);
		};

		self.size -= 1;

		// Shrink the root: a single remaining child is promoted, an emptied
		// root leaves the tree empty.
		let root_node = self.store.read(root)?;
		if root_node.children.len() == 1 {
			self.root = Some(root_node.children[0]);
		} else if root_node.count() == 0 {
			self.root = None;
		}

		self.min = if self.size == 0 {
			None
		} else {
			Some(removed.min.expect("non-empty tree has a minimum"))
		};

		Ok(Some(removed.value))
	}

	/// Lazy ascending iteration over the entries within `bounds`. An
	/// inverted range (upper bound value below the lower) yields nothing.
	pub fn range<R>(&mut self, bounds: R) -> Result<Range<'_, K, V, S>>
	where
		R: RangeBounds<K>,
	{
		let lower = match bounds.start_bound() {
			Bound::Included(k) => Some((k.clone(), true)),
			Bound::Excluded(k) => Some((k.clone(), false)),
			Bound::Unbounded => None,
		};
		let upper = match bounds.end_bound() {
			Bound::Included(k) => Some((k.clone(), true)),
			Bound::Excluded(k) => Some((k.clone(), false)),
			Bound::Unbounded => None,
		};

		let inverted = match (&lower, &upper) {
			(Some((lo, _)), Some((hi, _))) => hi < lo,
			_ => false,
		};

		let (node, idx) = if inverted {
			(None, 0)
		} else {
			match self.root {
				None => (None, 0),
				Some(root) => match &lower {
					Some((lo, _)) => {
						let (leaf, idx, _) = self.locate(root, lo)?;
						(Some(leaf), idx)
					}
					None => (Some(self.leftmost(root)?), 0),
				},
			}
		};

		Ok(Range {
			store: &mut self.store,
			node,
			idx,
			lower,
			upper,
			_values: PhantomData,
		})
	}

	/// Iterates over all entries in ascending key order.
	pub fn iter(&mut self) -> Result<Range<'_, K, V, S>> {
		self.range(..)
	}

	/// Value bound to the smallest key.
	///
	/// Panics when the tree is empty.
	pub fn minimum(&mut self) -> Result<V> {
		let Some(root) = self.root else {
			panic!("empty tree");
		};

		let leaf = self.leftmost(root)?;
		let node = self.store.read(leaf)?;
		Ok(node.values[0].value.clone())
	}

	/// Value bound to the largest key.
	///
	/// Panics when the tree is empty.
	pub fn maximum(&mut self) -> Result<V> {
		let Some(root) = self.root else {
			panic!("empty tree");
		};

		let leaf = self.rightmost(root)?;
		let node = self.store.read(leaf)?;
		Ok(node.values.last().expect("leaf holds values").value.clone())
	}

	// Descends to the leaf that holds (or would hold) `key`. Returns the
	// leaf, the position inside it, and whether the key was found; on a miss
	// the position is where the key would be inserted.
	fn locate(&mut self, node: NodeId, key: &K) -> Result<(NodeId, usize, bool)> {
		let n = self.store.read(node)?;

		if n.is_leaf() {
			return Ok(match n.values.binary_search_by(|kv| kv.key.cmp(key)) {
				Ok(i) => (node, i, true),
				Err(i) => (node, i, false),
			});
		}

		// An exact separator hit descends to the right of the separator.
		let child = match n.mins.binary_search(key) {
			Ok(i) => n.children[i + 1],
			Err(i) => n.children[i],
		};

		self.locate(child, key)
	}

	fn leftmost(&mut self, node: NodeId) -> Result<NodeId> {
		let n = self.store.read(node)?;
		if n.is_leaf() {
			return Ok(node);
		}
		let child = n.children[0];
		self.leftmost(child)
	}

	fn rightmost(&mut self, node: NodeId) -> Result<NodeId> {
		let n = self.store.read(node)?;
		if n.is_leaf() {
			return Ok(node);
		}
		let child = *n.children.last().expect("internal node has children");
		self.rightmost(child)
	}

	fn insert_at(&mut self, node: NodeId, minimum: K, key: K, value: V) -> Result<Inserted<K, V>> {
		if self.store.read(node)?.is_leaf() {
			return self.insert_into_leaf(node, key, value);
		}

		// Locate the child subtree; `parent_idx` is the separator to the
		// left of the descent, -1 when descending into the first child.
		let (parent_idx, child, child_min) = {
			let n = self.store.read(node)?;
			let parent_idx: isize = match n.mins.binary_search(&key) {
				Ok(i) => i as isize,
				Err(i) => i as isize - 1,
			};
			let child = n.children[(parent_idx + 1) as usize];
			let child_min = if parent_idx >= 0 {
				n.mins[parent_idx as usize].clone()
			} else {
				minimum.clone()
			};
			(parent_idx, child, child_min)
		};

		let sub = self.insert_at(child, child_min, key, value)?;

		let Some((split_id, split_min)) = sub.split else {
			if parent_idx >= 0 {
				if parent_idx == 0 {
					// Keep the first separator in step with the child it
					// guards.
					self.store.write(node)?.mins[0] = sub.min.clone();
				}
				return Ok(Inserted {
					min: minimum,
					split: None,
					replaced: sub.replaced,
				});
			}

			let min = if sub.min < minimum { sub.min } else { minimum };
			return Ok(Inserted {
				min,
				split: None,
				replaced: sub.replaced,
			});
		};

		// The child split: splice the new sibling and its minimum in right
		// after the child.
		{
			let n = self.store.write(node)?;
			n.children.insert((parent_idx + 2) as usize, split_id);
			n.mins.insert((parent_idx + 1) as usize, split_min);
		}

		let min = if sub.min < minimum { sub.min } else { minimum };

		let count = self.store.read(node)?.children.len();
		if count <= self.order {
			return Ok(Inserted {
				min,
				split: None,
				replaced: sub.replaced,
			});
		}

		// Split this internal node. The right half takes the upper children;
		// the separator between the halves is promoted, not duplicated.
		let (brother_children, brother_mins, brother_min) = {
			let n = self.store.write(node)?;
			let brother_children = n.children.split_off(count / 2);
			let c = n.mins.len();
			if c % 2 == 0 {
				let brother_mins = n.mins.split_off(c / 2);
				let brother_min = n.mins.pop().expect("separators remain after split");
				(brother_children, brother_mins, brother_min)
			} else {
				let mut brother_mins = n.mins.split_off(c / 2);
				let brother_min = brother_mins.remove(0);
				(brother_children, brother_mins, brother_min)
			}
		};
		let brother = self.store.create(Node::internal(brother_children, brother_mins));

		Ok(Inserted {
			min,
			split: Some((brother, brother_min)),
			replaced: sub.replaced,
		})
	}

	fn insert_into_leaf(&mut self, node: NodeId, key: K, value: V) -> Result<Inserted<K, V>> {
		let count = {
			let leaf = self.store.write(node)?;
			match leaf.values.binary_search_by(|kv| kv.key.cmp(&key)) {
				Ok(i) => {
					let old = std::mem::replace(&mut leaf.values[i].value, value);
					return Ok(Inserted {
						min: leaf.values[0].key.clone(),
						split: None,
						replaced: Some(old),
					});
				}
				Err(i) => leaf.values.insert(i, KeyValue { key, value }),
			}
			leaf.values.len()
		};

		if count <= self.order {
			let min = self.store.read(node)?.values[0].key.clone();
			return Ok(Inserted {
				min,
				split: None,
				replaced: None,
			});
		}

		// Overfull: the upper half moves into a new right sibling, spliced
		// into the leaf chain between this leaf and its former successor.
		let (tail, min, old_next) = {
			let leaf = self.store.write(node)?;
			let tail = leaf.values.split_off(count / 2);
			(tail, leaf.values[0].key.clone(), leaf.next)
		};

		let brother = self.store.create(Node::leaf(tail));

		if let Some(next) = old_next {
			self.store.write(next)?.prev = Some(brother);
		}
		let brother_min = {
			let b = self.store.write(brother)?;
			b.next = old_next;
			b.prev = Some(node);
			b.values[0].key.clone()
		};
		self.store.write(node)?.next = Some(brother);

		Ok(Inserted {
			min,
			split: Some((brother, brother_min)),
			replaced: None,
		})
	}

	fn delete_at(&mut self, node: NodeId, key: &K, minimum: K) -> Result<Option<Removed<K, V>>> {
		if self.store.read(node)?.is_leaf() {
			let i = {
				let n = self.store.read(node)?;
				match n.values.binary_search_by(|kv| kv.key.cmp(key)) {
					Ok(i) => i,
					Err(_) => return Ok(None),
				}
			};
			let leaf = self.store.write(node)?;
			let kv = leaf.values.remove(i);
			let min = leaf.values.first().map(|kv| kv.key.clone());
			return Ok(Some(Removed {
				value: kv.value,
				min,
			}));
		}

		let (parent_idx, child, child_min) = {
			let n = self.store.read(node)?;
			let parent_idx: isize = match n.mins.binary_search(key) {
				Ok(i) => i as isize,
				Err(i) => i as isize - 1,
			};
			let child = n.children[(parent_idx + 1) as usize];
			let child_min = if parent_idx >= 0 {
				n.mins[parent_idx as usize].clone()
			} else {
				minimum.clone()
			};
			(parent_idx, child, child_min)
		};

		let Some(removed) = self.delete_at(child, key, child_min)? else {
			return Ok(None);
		};

		// Only the leftmost descent can lower this subtree's minimum.
		let child_new_min = removed.min.clone().expect("non-root subtree keeps entries");
		let new_min = if parent_idx < 0 {
			child_new_min.clone()
		} else {
			minimum
		};
		let done = Ok(Some(Removed {
			value: removed.value,
			min: Some(new_min),
		}));

		let min_occupancy = self.order.div_ceil(2);
		if self.store.read(child)?.count() >= min_occupancy {
			return done;
		}

		// The child underflowed. Rebalance against the adjacent sibling
		// under this node: the left one, or the right one when the child is
		// the leftmost. `uncle_idx` is the separator between the two.
		let uncle_idx: isize = if parent_idx < 0 {
			parent_idx + 1
		} else {
			parent_idx - 1
		};
		let from_left = parent_idx >= 0;
		let sibling = self.store.read(node)?.children[(uncle_idx + 1) as usize];
		let sibling_count = self.store.read(sibling)?.count();

		if self.store.read(child)?.is_leaf() {
			if sibling_count > min_occupancy {
				// Redistribute one entry from the richer sibling.
				if from_left {
					let kv = self
						.store
						.write(sibling)?
						.values
						.pop()
						.expect("donor sibling holds values");
					let separator = kv.key.clone();
					self.store.write(child)?.values.insert(0, kv);
					self.store.write(node)?.mins[parent_idx as usize] = separator;
				} else {
					let kv = self.store.write(sibling)?.values.remove(0);
					self.store.write(child)?.values.push(kv);
					let separator = self.store.read(sibling)?.values[0].key.clone();
					self.store.write(node)?.mins[uncle_idx as usize] = separator;
				}
				return done;
			}

			// Merge the child into its sibling and drop it from this node.
			if from_left {
				let moved = std::mem::take(&mut self.store.write(child)?.values);
				self.store.write(sibling)?.values.extend(moved);
			} else {
				let mut moved = std::mem::take(&mut self.store.write(child)?.values);
				let sib = self.store.write(sibling)?;
				moved.append(&mut sib.values);
				sib.values = moved;
			}

			// Unlink the merged-out leaf from the sibling chain.
			let (prev, next) = {
				let c = self.store.read(child)?;
				(c.prev, c.next)
			};
			if let Some(prev) = prev {
				self.store.write(prev)?.next = next;
			}
			if let Some(next) = next {
				self.store.write(next)?.prev = prev;
			}

			self.store.remove(child);
			self.drop_child(node, parent_idx)?;
			return done;
		}

		// Internal child.
		if sibling_count > min_occupancy {
			if from_left {
				// The sibling's last child moves to the front of the child;
				// the separator above the child drops down as its first
				// separator and the sibling's last separator is promoted in
				// its place.
				let donated = self
					.store
					.write(sibling)?
					.children
					.pop()
					.expect("donor sibling holds children");
				{
					let c = self.store.write(child)?;
					c.children.insert(0, donated);
					c.mins.insert(0, child_new_min);
				}
				let promoted = self
					.store
					.write(sibling)?
					.mins
					.pop()
					.expect("donor sibling holds separators");
				self.store.write(node)?.mins[parent_idx as usize] = promoted;
			} else {
				let donated = self.store.write(sibling)?.children.remove(0);
				let separator = self.store.read(node)?.mins[uncle_idx as usize].clone();
				{
					let c = self.store.write(child)?;
					c.children.push(donated);
					c.mins.push(separator);
				}
				let promoted = self.store.write(sibling)?.mins.remove(0);
				self.store.write(node)?.mins[uncle_idx as usize] = promoted;
			}
			return done;
		}

		// Merge the internal child into its sibling; the separator between
		// them is pulled down into the merged node at the junction.
		if from_left {
			let (moved_children, moved_mins) = {
				let c = self.store.write(child)?;
				(std::mem::take(&mut c.children), std::mem::take(&mut c.mins))
			};
			let sib = self.store.write(sibling)?;
			sib.mins.push(child_new_min);
			sib.mins.extend(moved_mins);
			sib.children.extend(moved_children);
		} else {
			let (mut moved_children, mut moved_mins) = {
				let c = self.store.write(child)?;
				(std::mem::take(&mut c.children), std::mem::take(&mut c.mins))
			};
			let separator = self.store.read(node)?.mins[uncle_idx as usize].clone();
			let sib = self.store.write(sibling)?;
			moved_mins.push(separator);
			moved_mins.append(&mut sib.mins);
			sib.mins = moved_mins;
			moved_children.append(&mut sib.children);
			sib.children = moved_children;
		}

		self.store.remove(child);
		self.drop_child(node, parent_idx)?;
		done
	}

	// Removes the child at `parent_idx + 1` and its separator after a merge.
	fn drop_child(&mut self, node: NodeId, parent_idx: isize) -> Result<()> {
		let n = self.store.write(node)?;
		n.children.remove((parent_idx + 1) as usize);
		if parent_idx < 0 {
			n.mins.remove(0);
		} else {
			n.mins.remove(parent_idx as usize);
		}
		Ok(())
	}
}

/// Lazy ascending iterator over a key range, walking the leaf chain. Items
/// are `Result` because the persistent backend may have to materialize
/// leaves mid-iteration; an error ends the iteration.
pub struct Range<'a, K, V, S> {
	store: &'a mut S,
	node: Option<NodeId>,
	idx: usize,
	lower: Option<(K, bool)>,
	upper: Option<(K, bool)>,
	_values: PhantomData<V>,
}

impl<K, V, S> Iterator for Range<'_, K, V, S>
where
	K: Ord + Clone,
	V: Clone,
	S: NodeStore<K, V>,
{
	type Item = Result<(K, V)>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			let node = self.node?;
			let n = match self.store.read(node) {
				Ok(n) => n,
				Err(e) => {
					self.node = None;
					return Some(Err(e));
				}
			};

			if self.idx >= n.values.len() {
				self.node = n.next;
				self.idx = 0;
				continue;
			}

			let kv = n.values[self.idx].clone();
			self.idx += 1;

			if let Some((hi, closed)) = &self.upper {
				if kv.key > *hi || (!*closed && kv.key == *hi) {
					self.node = None;
					return None;
				}
			}

			if let Some((lo, closed)) = &self.lower {
				if kv.key < *lo || (!*closed && kv.key == *lo) {
					continue;
				}
			}

			return Some(Ok((kv.key, kv.value)));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::ops::Bound;

	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};

	use super::*;
	use crate::memory::MemoryTree;

	fn collect<K, V, S>(tree: &mut Tree<K, V, S>) -> Vec<(K, V)>
	where
		K: Ord + Clone,
		V: Clone,
		S: NodeStore<K, V>,
	{
		tree.iter().unwrap().map(|r| r.unwrap()).collect()
	}

	// Walks the whole structure validating occupancy, separator ordering,
	// leaf depth, the sibling chain in both directions, and the size and
	// minimum accounting. With `exact_separators`, every separator must
	// equal the minimum key of the subtree to its right (holds for
	// insert-only workloads; deletion does not refresh untouched
	// separators).
	fn check_invariants<K, V, S>(tree: &mut Tree<K, V, S>, exact_separators: bool)
	where
		K: Ord + Clone + std::fmt::Debug,
		V: Clone,
		S: NodeStore<K, V>,
	{
		let Some(root) = tree.root else {
			assert_eq!(tree.size, 0);
			assert!(tree.min.is_none());
			return;
		};

		let mut leaves = Vec::new();
		let mut total = 0usize;
		walk(tree, root, 0, None, None, exact_separators, &mut leaves, &mut total);

		assert_eq!(total, tree.size, "leaf entries must match the tree size");

		// Every leaf sits at the same depth.
		let depth = leaves[0].1;
		assert!(leaves.iter().all(|&(_, d)| d == depth), "leaves at uneven depths");

		// The chain must mirror the in-order leaf sequence, both ways.
		for (i, pair) in leaves.windows(2).enumerate() {
			let (a, b) = (pair[0].0, pair[1].0);
			assert_eq!(tree.store.read(a).unwrap().next, Some(b), "broken next link at leaf {i}");
			assert_eq!(tree.store.read(b).unwrap().prev, Some(a), "broken prev link at leaf {i}");
		}
		if let Some(&(first, _)) = leaves.first() {
			assert_eq!(tree.store.read(first).unwrap().prev, None);
			let min = tree.store.read(first).unwrap().values[0].key.clone();
			assert_eq!(tree.min.as_ref(), Some(&min), "tree minimum out of step");
		}
		if let Some(&(last, _)) = leaves.last() {
			assert_eq!(tree.store.read(last).unwrap().next, None);
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn walk<K, V, S>(
		tree: &mut Tree<K, V, S>,
		node: NodeId,
		depth: usize,
		lower: Option<&K>,
		upper: Option<&K>,
		exact_separators: bool,
		leaves: &mut Vec<(NodeId, usize)>,
		total: &mut usize,
	) where
		K: Ord + Clone + std::fmt::Debug,
		V: Clone,
		S: NodeStore<K, V>,
	{
		let n = tree.store.read(node).unwrap().clone();
		let count = n.count();

		if depth > 0 {
			assert!(
				count >= tree.order.div_ceil(2) && count <= tree.order,
				"occupancy {count} out of bounds for order {}",
				tree.order
			);
		}

		if n.is_leaf() {
			assert!(n.children.is_empty() && n.mins.is_empty());
			for pair in n.values.windows(2) {
				assert!(pair[0].key < pair[1].key, "leaf keys not strictly increasing");
			}
			if let Some(lo) = lower {
				assert!(&n.values[0].key >= lo, "leaf key below its separator");
				if exact_separators {
					assert_eq!(&n.values[0].key, lo, "separator is not the subtree minimum");
				}
			}
			if let Some(hi) = upper {
				assert!(&n.values.last().unwrap().key < hi, "leaf key at or above the next separator");
			}
			leaves.push((node, depth));
			*total += n.values.len();
			return;
		}

		assert!(n.values.is_empty());
		assert_eq!(n.children.len(), n.mins.len() + 1, "separator/child count mismatch");
		for pair in n.mins.windows(2) {
			assert!(pair[0] < pair[1], "separators not strictly increasing");
		}

		for (i, &child) in n.children.iter().enumerate() {
			let lo = if i == 0 { lower } else { Some(&n.mins[i - 1]) };
			let hi = if i == n.children.len() - 1 {
				upper
			} else {
				Some(&n.mins[i])
			};
			walk(tree, child, depth + 1, lo, hi, exact_separators, leaves, total);
		}
	}

	#[test]
	fn insert_and_find() {
		let mut tree = MemoryTree::new(3);

		for i in 0..10 {
			assert_eq!(tree.insert(i, i * 100).unwrap(), None);
		}

		assert_eq!(tree.len(), 10);
		for i in 0..10 {
			assert_eq!(tree.find(&i).unwrap(), Some(i * 100));
		}
		assert_eq!(tree.find(&42).unwrap(), None);
		check_invariants(&mut tree, true);
	}

	#[test]
	fn insert_replaces_duplicate() {
		let mut tree = MemoryTree::new(3);

		assert_eq!(tree.insert(7, "a").unwrap(), None);
		assert_eq!(tree.insert(7, "b").unwrap(), Some("a"));
		assert_eq!(tree.len(), 1);
		assert_eq!(tree.find(&7).unwrap(), Some("b"));
	}

	#[test]
	fn sequential_inserts_traverse_in_order() {
		for (order, n) in [(3, 100), (10, 1000), (15, 10_000)] {
			let mut tree = MemoryTree::new(order);

			for i in 0..n {
				tree.insert(i, i.to_string()).unwrap();
			}

			assert_eq!(tree.len(), n as usize);
			let entries = collect(&mut tree);
			let keys: Vec<i32> = entries.iter().map(|(k, _)| *k).collect();
			assert_eq!(keys, (0..n).collect::<Vec<_>>(), "order {order}");
			for (k, v) in entries {
				assert_eq!(v, k.to_string());
			}
			check_invariants(&mut tree, true);
		}
	}

	#[test]
	fn reverse_inserts_traverse_in_order() {
		let mut tree = MemoryTree::new(4);

		for i in (0..100).rev() {
			tree.insert(i, i).unwrap();
		}

		let keys: Vec<i32> = collect(&mut tree).into_iter().map(|(k, _)| k).collect();
		assert_eq!(keys, (0..100).collect::<Vec<_>>());
		check_invariants(&mut tree, true);
	}

	#[test]
	fn delete_returns_previous_value() {
		let mut tree = MemoryTree::new(3);

		for i in 0..100 {
			tree.insert(i, i * 2).unwrap();
		}

		assert_eq!(tree.delete(&5).unwrap(), Some(10));
		assert_eq!(tree.delete(&10).unwrap(), Some(20));
		assert_eq!(tree.delete(&20).unwrap(), Some(40));
		assert_eq!(tree.delete(&5).unwrap(), None);
		assert_eq!(tree.len(), 97);

		let keys: Vec<i32> = collect(&mut tree).into_iter().map(|(k, _)| k).collect();
		let expected: Vec<i32> = (0..100).filter(|k| ![5, 10, 20].contains(k)).collect();
		assert_eq!(keys, expected);
		check_invariants(&mut tree, false);
	}

	#[test]
	fn delete_everything_empties_the_tree() {
		let mut tree = MemoryTree::new(3);

		for i in 0..50 {
			tree.insert(i, i).unwrap();
		}
		for i in 0..50 {
			assert_eq!(tree.delete(&i).unwrap(), Some(i), "key {i}");
			check_invariants(&mut tree, false);
		}

		assert!(tree.is_empty());
		assert_eq!(tree.find(&25).unwrap(), None);

		// The tree is reusable after it drains.
		tree.insert(1, 1).unwrap();
		assert_eq!(tree.len(), 1);
		assert_eq!(tree.find(&1).unwrap(), Some(1));
	}

	#[test]
	fn delete_missing_key_is_not_an_error() {
		let mut tree: MemoryTree<i32, i32> = MemoryTree::new(3);
		assert_eq!(tree.delete(&1).unwrap(), None);

		tree.insert(1, 1).unwrap();
		assert_eq!(tree.delete(&2).unwrap(), None);
		assert_eq!(tree.len(), 1);
	}

	#[test]
	fn range_skips_deleted_key() {
		let mut tree = MemoryTree::new(3);

		for i in 0..5 {
			tree.insert(i, i).unwrap();
		}
		tree.delete(&3).unwrap();

		let keys: Vec<i32> =
			tree.range(0..=5).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(keys, vec![0, 1, 2, 4]);
	}

	#[test]
	fn range_windows_clamp_to_contents() {
		let mut tree = MemoryTree::new(3);

		for i in 20..50 {
			tree.insert(i, i).unwrap();
		}

		let keys = |tree: &mut MemoryTree<i32, i32>, lo: i32, hi: i32| -> Vec<i32> {
			tree.range(lo..=hi).unwrap().map(|r| r.unwrap().0).collect()
		};

		assert_eq!(keys(&mut tree, 10, 30), (20..=30).collect::<Vec<_>>());
		assert_eq!(keys(&mut tree, 30, 60), (30..50).collect::<Vec<_>>());
		assert_eq!(keys(&mut tree, 10, 60), (20..50).collect::<Vec<_>>());
	}

	#[test]
	fn range_honors_open_and_closed_bounds() {
		let mut tree = MemoryTree::new(3);

		for i in 0..10 {
			tree.insert(i, i).unwrap();
		}

		let closed: Vec<i32> = tree.range(2..=5).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(closed, vec![2, 3, 4, 5]);

		let half_open: Vec<i32> = tree.range(2..5).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(half_open, vec![2, 3, 4]);

		let open: Vec<i32> = tree
			.range((Bound::Excluded(2), Bound::Excluded(5)))
			.unwrap()
			.map(|r| r.unwrap().0)
			.collect();
		assert_eq!(open, vec![3, 4]);

		let from: Vec<i32> = tree.range(7..).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(from, vec![7, 8, 9]);

		let to: Vec<i32> = tree.range(..3).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(to, vec![0, 1, 2]);
	}

	#[test]
	fn range_with_absent_endpoints() {
		let mut tree = MemoryTree::new(3);

		// Even keys only, so odd bounds never hit an entry.
		for i in 0..50 {
			tree.insert(i * 2, i * 2).unwrap();
		}

		let got: Vec<i32> = tree.range(31..=61).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(got, (16..=30).map(|i| i * 2).collect::<Vec<_>>());

		let got: Vec<i32> = tree.range(31..=60).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(got, (16..=30).map(|i| i * 2).collect::<Vec<_>>());

		let got: Vec<i32> = tree.range(30..=61).unwrap().map(|r| r.unwrap().0).collect();
		assert_eq!(got, (15..=30).map(|i| i * 2).collect::<Vec<_>>());
	}

	#[test]
	fn delete_the_only_entry() {
		let mut tree = MemoryTree::new(3);

		tree.insert(1, 10).unwrap();
		assert_eq!(tree.delete(&1).unwrap(), Some(10));

		assert!(tree.is_empty());
		assert_eq!(tree.find(&1).unwrap(), None);
		check_invariants(&mut tree, false);
	}

	#[test]
	fn inverted_range_is_empty() {
		let mut tree = MemoryTree::new(3);

		for i in 0..10 {
			tree.insert(i, i).unwrap();
		}

		let got: Vec<i32> = tree
			.range((Bound::Included(8), Bound::Included(2)))
			.unwrap()
			.map(|r| r.unwrap().0)
			.collect();
		assert!(got.is_empty());
	}

	#[test]
	fn range_stops_early_for_the_consumer() {
		let mut tree = MemoryTree::new(3);

		for i in 0..100 {
			tree.insert(i, i).unwrap();
		}

		let first: Vec<i32> = tree.iter().unwrap().take(3).map(|r| r.unwrap().0).collect();
		assert_eq!(first, vec![0, 1, 2]);

		// The tree stays usable after an abandoned iteration.
		assert_eq!(tree.find(&99).unwrap(), Some(99));
	}

	#[test]
	fn minimum_and_maximum() {
		let mut tree = MemoryTree::new(3);

		for i in [5, 1, 9, 3, 7] {
			tree.insert(i, i * 10).unwrap();
		}

		assert_eq!(tree.minimum().unwrap(), 10);
		assert_eq!(tree.maximum().unwrap(), 90);

		tree.delete(&1).unwrap();
		tree.delete(&9).unwrap();
		assert_eq!(tree.minimum().unwrap(), 30);
		assert_eq!(tree.maximum().unwrap(), 70);
	}

	#[test]
	#[should_panic(expected = "empty tree")]
	fn minimum_panics_on_empty_tree() {
		let mut tree: MemoryTree<i32, i32> = MemoryTree::new(3);
		let _ = tree.minimum();
	}

	#[test]
	#[should_panic(expected = "empty tree")]
	fn maximum_panics_on_empty_tree() {
		let mut tree: MemoryTree<i32, i32> = MemoryTree::new(3);
		let _ = tree.maximum();
	}

	#[test]
	#[should_panic(expected = "invalid tree order")]
	fn rejects_order_below_minimum() {
		let _: MemoryTree<i32, i32> = MemoryTree::new(2);
	}

	#[test]
	fn leaf_chain_walks_backwards() {
		let mut tree = MemoryTree::new(3);

		for i in 0..50 {
			tree.insert(i, i).unwrap();
		}

		// Find the rightmost leaf, then walk prev links collecting keys.
		let mut leaf = tree.leftmost(tree.root.unwrap()).unwrap();
		while let Some(next) = tree.store.read(leaf).unwrap().next {
			leaf = next;
		}

		let mut keys = Vec::new();
		let mut cursor = Some(leaf);
		while let Some(id) = cursor {
			let n = tree.store.read(id).unwrap();
			for kv in n.values.iter().rev() {
				keys.push(kv.key);
			}
			cursor = n.prev;
		}

		assert_eq!(keys, (0..50).rev().collect::<Vec<_>>());
	}

	#[test]
	fn random_workload_matches_reference_model() {
		let mut rng = StdRng::seed_from_u64(0x5eed);

		for order in [3, 4, 7] {
			let mut tree = MemoryTree::new(order);
			let mut model: BTreeMap<u16, u64> = BTreeMap::new();

			for op in 0..4000 {
				let key = rng.gen_range(0u16..500);
				if rng.gen_bool(0.6) {
					let value = rng.gen::<u64>();
					assert_eq!(
						tree.insert(key, value).unwrap(),
						model.insert(key, value),
						"insert mismatch at op {op} (order {order})"
					);
				} else {
					assert_eq!(
						tree.delete(&key).unwrap(),
						model.remove(&key),
						"delete mismatch at op {op} (order {order})"
					);
				}
				assert_eq!(tree.len(), model.len());

				if op % 500 == 0 {
					check_invariants(&mut tree, false);
				}
			}

			check_invariants(&mut tree, false);

			let entries = collect(&mut tree);
			let expected: Vec<(u16, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
			assert_eq!(entries, expected);

			for key in 0u16..500 {
				assert_eq!(tree.find(&key).unwrap(), model.get(&key).copied());
			}
		}
	}
}
