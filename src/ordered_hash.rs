use std::hash::Hash;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

/// An insertion-ordered keyed queue: FIFO iteration through `front`/`pop_front`
///  combined with O(1) lookup and removal by key.
///
/// Every public operation takes the internal mutex, so the container never hands
///  out references into its storage - values are returned by clone. Callers that
///  need to work with a stored value across operations store shared pointers to
///  separately synchronized objects.
///
/// Keys are expected to be unique; pushing a duplicate key re-points the index at
///  the new entry while the older entry stays in queue order (its key can no
///  longer be found).
pub struct OrderedHashMap<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    /// slab of linked-list nodes; freed slots are recycled through `free`
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: FxHashMap<K, usize>,
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for OrderedHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> OrderedHashMap<K, V> {
    pub fn new() -> OrderedHashMap<K, V> {
        OrderedHashMap {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                index: FxHashMap::default(),
            }),
        }
    }

    pub fn push_back(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();

        let node = Node {
            key: key.clone(),
            value,
            prev: inner.tail,
            next: None,
        };

        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.nodes[slot] = Some(node);
                slot
            }
            None => {
                inner.nodes.push(Some(node));
                inner.nodes.len() - 1
            }
        };

        match inner.tail {
            Some(tail) => {
                inner.nodes[tail].as_mut().unwrap().next = Some(slot);
            }
            None => {
                inner.head = Some(slot);
            }
        }
        inner.tail = Some(slot);
        inner.index.insert(key, slot);
    }

    pub fn pop_front(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.head?;
        let node = inner.unlink(slot);
        inner.index.remove(&node.key);
        Some((node.key, node.value))
    }

    pub fn front(&self) -> Option<(K, V)> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.head?;
        let node = inner.nodes[slot].as_ref().unwrap();
        Some((node.key.clone(), node.value.clone()))
    }

    pub fn back(&self) -> Option<(K, V)> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.tail?;
        let node = inner.nodes[slot].as_ref().unwrap();
        Some((node.key.clone(), node.value.clone()))
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock().unwrap();
        let slot = *inner.index.get(key)?;
        Some(inner.nodes[slot].as_ref().unwrap().value.clone())
    }

    pub fn erase(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.index.remove(key)?;
        let node = inner.unlink(slot);
        Some(node.value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().head.is_none()
    }
}

impl<K, V> Inner<K, V> {
    /// detach a node from the list and recycle its slot
    fn unlink(&mut self, slot: usize) -> Node<K, V> {
        let node = self.nodes[slot].take().unwrap();

        match node.prev {
            Some(prev) => self.nodes[prev].as_mut().unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].as_mut().unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }

        self.free.push(slot);
        node
    }
}
