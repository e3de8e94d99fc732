//! Doubly linked list of `u64` items
//!
//! Nodes live in an arena and are addressed by generation-checked handles,
//! so a stale handle held by another index (the mempool endpoint table) can
//! never reach a recycled node.

/// Handle to a list node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Node {
    item: u64,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
    live: bool,
}

/// Arena-backed doubly linked list.
#[derive(Debug, Clone, Default)]
pub struct FastList {
    nodes: Vec<Node>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl FastList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty list with room for `capacity` nodes before reallocating
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Number of items
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No items
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail
    pub fn push_back(&mut self, item: u64) -> NodeId {
        let idx = self.alloc(item);
        self.nodes[idx as usize].prev = self.tail;
        match self.tail {
            Some(t) => self.nodes[t as usize].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        self.handle(idx)
    }

    /// Prepend at the head
    pub fn push_front(&mut self, item: u64) -> NodeId {
        let idx = self.alloc(item);
        self.nodes[idx as usize].next = self.head;
        match self.head {
            Some(h) => self.nodes[h as usize].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        self.handle(idx)
    }

    /// Oldest item (FIFO take)
    pub fn pop_front(&mut self) -> Option<u64> {
        let head = self.head?;
        self.unlink(head)
    }

    /// Newest item
    pub fn pop_back(&mut self) -> Option<u64> {
        let tail = self.tail?;
        self.unlink(tail)
    }

    /// Head item without removing it
    pub fn front(&self) -> Option<u64> {
        self.head.map(|h| self.nodes[h as usize].item)
    }

    /// Handle of the head node
    pub fn front_node(&self) -> Option<NodeId> {
        self.head.map(|h| self.handle(h))
    }

    /// Item behind a handle, if the handle is still live
    pub fn get(&self, node: NodeId) -> Option<u64> {
        self.resolve(node).map(|idx| self.nodes[idx as usize].item)
    }

    /// Remove the node behind `node`
    pub fn remove(&mut self, node: NodeId) -> Option<u64> {
        let idx = self.resolve(node)?;
        self.unlink(idx)
    }

    /// Items from head to tail
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = &self.nodes[idx as usize];
            cursor = node.next;
            Some(node.item)
        })
    }

    fn handle(&self, idx: u32) -> NodeId {
        NodeId {
            index: idx,
            generation: self.nodes[idx as usize].generation,
        }
    }

    fn resolve(&self, node: NodeId) -> Option<u32> {
        let n = self.nodes.get(node.index as usize)?;
        (n.live && n.generation == node.generation).then_some(node.index)
    }

    fn alloc(&mut self, item: u64) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                let n = &mut self.nodes[idx as usize];
                n.item = item;
                n.prev = None;
                n.next = None;
                n.live = true;
                idx
            }
            None => {
                self.nodes.push(Node {
                    item,
                    prev: None,
                    next: None,
                    generation: 0,
                    live: true,
                });
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn unlink(&mut self, idx: u32) -> Option<u64> {
        let (prev, next, item) = {
            let n = &self.nodes[idx as usize];
            if !n.live {
                return None;
            }
            (n.prev, n.next, n.item)
        };

        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(nx) => self.nodes[nx as usize].prev = prev,
            None => self.tail = prev,
        }

        let n = &mut self.nodes[idx as usize];
        n.live = false;
        n.generation = n.generation.wrapping_add(1);
        self.free.push(idx);
        self.len -= 1;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut list = FastList::with_capacity(4);
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);

        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop_back(), Some(3));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle() {
        let mut list = FastList::new();
        let _a = list.push_back(10);
        let b = list.push_back(20);
        let _c = list.push_back(30);

        assert_eq!(list.remove(b), Some(20));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![10, 30]);
        assert_eq!(list.remove(b), None);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut list = FastList::new();
        let a = list.push_back(1);
        list.remove(a);
        let b = list.push_front(2);

        assert_eq!(list.get(a), None);
        assert_eq!(list.get(b), Some(2));
        assert_eq!(list.front_node(), Some(b));
    }

    #[test]
    fn test_push_front_links() {
        let mut list = FastList::new();
        list.push_front(3);
        list.push_front(2);
        list.push_back(4);
        list.push_front(1);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(list.front(), Some(1));
    }
}
