//! Min pairing heap.
//!
//! `push` and `peek_min` are O(1); `pop_min` melds the root's children
//! pairwise, giving amortized O(log n). The scheduler keys run queues with
//! it, so the hot operations stay allocation-free apart from the one node
//! box per inserted element.

use alloc::boxed::Box;

struct Node<T> {
    value: T,
    /// Next sibling in the parent's child list.
    sibling: Option<Box<Node<T>>>,
    /// First child.
    child: Option<Box<Node<T>>>,
}

pub struct PairingHeap<T: Ord> {
    root: Option<Box<Node<T>>>,
    len: usize,
}

impl<T: Ord> PairingHeap<T> {
    pub const fn new() -> Self {
        PairingHeap { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn push(&mut self, value: T) {
        let node = Box::new(Node {
            value,
            sibling: None,
            child: None,
        });
        self.root = Some(match self.root.take() {
            None => node,
            Some(root) => meld(root, node),
        });
        self.len += 1;
    }

    pub fn peek_min(&self) -> Option<&T> {
        self.root.as_ref().map(|n| &n.value)
    }

    pub fn pop_min(&mut self) -> Option<T> {
        let root = self.root.take()?;
        self.len -= 1;
        self.root = merge_pairs(root.child);
        Some(root.value)
    }
}

impl<T: Ord> Default for PairingHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn meld<T: Ord>(a: Box<Node<T>>, b: Box<Node<T>>) -> Box<Node<T>> {
    let (mut min, mut max) = if a.value <= b.value { (a, b) } else { (b, a) };
    max.sibling = min.child.take();
    min.child = Some(max);
    min
}

/// Two-pass pairwise meld of a child list, iterative so that long sibling
/// chains cannot overflow the kernel stack.
fn merge_pairs<T: Ord>(mut list: Option<Box<Node<T>>>) -> Option<Box<Node<T>>> {
    // First pass: meld adjacent pairs left to right.
    let mut pairs: Option<Box<Node<T>>> = None;
    while let Some(mut first) = list {
        list = first.sibling.take();
        let melded = match list {
            Some(mut second) => {
                list = second.sibling.take();
                meld(first, second)
            }
            None => first,
        };
        // Push onto the pairs stack.
        let mut melded = melded;
        melded.sibling = pairs;
        pairs = Some(melded);
    }
    // Second pass: meld the stack right to left.
    let mut result: Option<Box<Node<T>>> = None;
    while let Some(mut node) = pairs {
        pairs = node.sibling.take();
        result = Some(match result {
            None => node,
            Some(acc) => meld(node, acc),
        });
    }
    result
}

// Dropping node by node keeps deep heaps from recursing through Box drops.
impl<T: Ord> Drop for PairingHeap<T> {
    fn drop(&mut self) {
        while self.pop_min().is_some() {}
    }
}
