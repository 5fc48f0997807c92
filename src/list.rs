use std::{marker::PhantomData, ptr::NonNull};

use crate::Pointer;

/// Intrusive doubly-linked list node. The small-block pool header is a
/// `Node<SmallPool>`: the links come first, the pool data after, and the
/// whole thing lives at the start of the pool's memory.
pub(crate) struct Node<T> {
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
    pub data: T,
}

/// All the headers we store through this list point to their previous and
/// next header, so we might as well consider them linked list nodes. Type
/// alias for when we want to talk about a header without thinking about
/// list nodes.
pub(crate) type Header<T> = Node<T>;

/// Minimal intrusive linked list. Unlike a container it never allocates and
/// never constructs nodes: the nodes are block headers that already exist in
/// mapped memory, the list only links and unlinks them (pools move between
/// the partially-free list and "full" limbo many times over their life, and
/// their data has to survive that).
pub(crate) struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    /// Links an existing node at the front of the list. The node's previous
    /// links are overwritten, so it must not currently be linked anywhere.
    ///
    /// # Safety
    ///
    /// `node` must be valid and unlinked.
    pub(crate) unsafe fn push_front(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().prev = None;
        node.as_mut().next = self.head;

        if let Some(mut head) = self.head {
            head.as_mut().prev = Some(node);
        } else {
            self.tail = Some(node);
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Removes `node` from the list without touching its data.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this list.
    pub(crate) unsafe fn remove(&mut self, mut node: NonNull<Node<T>>) {
        if self.len == 1 {
            self.head = None;
            self.tail = None;
        } else if node == self.head.unwrap() {
            node.as_mut().next.unwrap().as_mut().prev = None;
            self.head = node.as_ref().next;
        } else if node == self.tail.unwrap() {
            node.as_mut().prev.unwrap().as_mut().next = None;
            self.tail = node.as_ref().prev;
        } else {
            let mut next = node.as_ref().next.unwrap();
            let mut prev = node.as_ref().prev.unwrap();
            prev.as_mut().next = Some(next);
            next.as_mut().prev = Some(prev);
        }

        node.as_mut().next = None;
        node.as_mut().prev = None;
        self.len -= 1;
    }

    /// Iterates over the nodes. Only used for inspection in tests; the
    /// pointers stay valid because the tests own the nodes.
    #[cfg(test)]
    pub(crate) unsafe fn iter(&self) -> impl Iterator<Item = NonNull<Node<T>>> {
        let mut current = self.head;
        std::iter::from_fn(move || {
            let node = current?;
            current = node.as_ref().next;
            Some(node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_remove_relink() {
        let mut nodes: Vec<Node<u32>> = (0..3)
            .map(|i| Node {
                next: None,
                prev: None,
                data: i,
            })
            .collect();

        let mut list = LinkedList::new();
        unsafe {
            let ptrs: Vec<NonNull<Node<u32>>> = nodes
                .iter_mut()
                .map(|n| NonNull::new_unchecked(n as *mut _))
                .collect();

            list.push_front(ptrs[0]);
            list.push_front(ptrs[1]);
            list.push_front(ptrs[2]);
            assert_eq!(list.len, 3);
            assert_eq!(list.first().unwrap().as_ref().data, 2);

            // Remove the middle node and make sure data survives a relink.
            list.remove(ptrs[1]);
            assert_eq!(list.len, 2);
            list.push_front(ptrs[1]);
            assert_eq!(list.first().unwrap().as_ref().data, 1);

            let order: Vec<u32> = list.iter().map(|n| n.as_ref().data).collect();
            assert_eq!(order, [1, 2, 0]);
        }
    }
}
