//! Intrusive circular doubly linked list whose elements live in an indexable
//! pool and refer to each other by index.
use core::{cell::Cell, fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items. The last item's `next` and the first item's
/// `prev` wrap around.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A cell whose contents can be read or written by presenting a key.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);
}

impl<Element: Copy> CellLike<()> for Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// Accessor to a linked list whose head is stored in `HeadCell` and whose
/// per-element links are found by `MapLink`.
///
/// Structural inconsistencies (e.g., a linked neighbor whose link is `None`)
/// indicate a kernel bug and cause a panic.
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: Copy + Eq,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    /// Get the element identified by `i`.
    #[inline]
    pub fn element(&self, i: Index) -> &'a Element {
        &self.pool[i]
    }

    pub fn is_linked(&self, i: Index) -> bool {
        (self.map_link)(&self.pool[i]).get(&self.cell_key).is_some()
    }

    #[inline]
    fn link(&self, i: Index) -> Link<Index> {
        match (self.map_link)(&self.pool[i]).get(&self.cell_key) {
            Some(link) => link,
            None => panic!("inconsistent list structure"),
        }
    }

    #[inline]
    fn update_link(&mut self, i: Index, f: impl FnOnce(&mut Link<Index>)) {
        let cell = (self.map_link)(&self.pool[i]);
        let mut link = match cell.get(&self.cell_key) {
            Some(link) => link,
            None => panic!("inconsistent list structure"),
        };
        f(&mut link);
        cell.set(&mut self.cell_key, Some(link));
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|first| self.link(first).prev)
    }

    /// Insert `item` before the position `at` (if `at` is `Some(_)`) or to the
    /// list's back (if `at` is `None`).
    ///
    /// `item` must be unlinked, and `at` must be an element of this list.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(!self.is_linked(item), "item is already linked");

        let mut head = self.head();

        let Some(first) = head.first else {
            debug_assert!(at.is_none());
            (self.map_link)(&self.pool[item]).set(
                &mut self.cell_key,
                Some(Link {
                    prev: item,
                    next: item,
                }),
            );
            head.first = Some(item);
            self.set_head(head);
            return;
        };

        let next = at.unwrap_or(first);
        let prev = self.link(next).prev;

        self.update_link(prev, |l| l.next = item);
        self.update_link(next, |l| l.prev = item);
        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, Some(Link { prev, next }));

        if at == Some(first) {
            head.first = Some(item);
            self.set_head(head);
        }
    }

    /// Remove `item` from the list. `item` must be an element of this list.
    pub fn remove(&mut self, item: Index) {
        let link = self.link(item);
        let mut head = self.head();

        if head.first == Some(item) {
            if link.next == item {
                // The list just became empty
                head.first = None;
                self.set_head(head);
                (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
                return;
            }

            head.first = Some(link.next);
            self.set_head(head);
        }

        self.update_link(link.prev, |l| l.next = link.next);
        self.update_link(link.next, |l| l.prev = link.prev);
        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        let item = self.front()?;
        self.remove(item);
        Some(item)
    }

    /// Get the element following `i`, or `None` if `i` is the last one.
    #[inline]
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link(i).next;
        if Some(next) == self.head().first {
            None
        } else {
            Some(next)
        }
    }

    /// Get the element preceding `i`, or `None` if `i` is the first one.
    #[inline]
    pub fn prev(&self, i: Index) -> Option<Index> {
        if Some(i) == self.head().first {
            None
        } else {
            Some(self.link(i).prev)
        }
    }
}

impl<HeadCell, Pool, MapLink, CellKey> fmt::Debug
    for ListAccessorCell<'_, HeadCell, Pool, MapLink, CellKey>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ListAccessorCell { .. }")
    }
}
