//! Linked list operations
//!
//! Doubly-linked node chains addressed by object ID, with the list head's
//! object ID doubling as the chain sentinel (a node pointing at the head is
//! at an end of the chain; 0 means detached). Attach/detach are O(1).
//!
//! A streamed list records only previous-pointers while appending; it must
//! be normalized (one backward pass reconstructing next-pointers, `first`
//! and the node count) before bidirectional iteration or non-append
//! mutation. Traversal validates neighbor pointers on every step and treats
//! a mismatch as a fatal loop-detected condition rather than iterating
//! forever.

use crate::engine::Ifds;
use crate::error::{IfdsError, Result};
use crate::object::{ObjHandle, ObjectId, TypeInfo};
use crate::structure::{TYPE_LINKED_LIST, TYPE_STREAMED};
use tracing::debug;

/// Where to attach a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAttach {
    /// After the current last node
    Last,
    /// Before the current first node
    First,
    /// After the node with this object ID
    After(u32),
}

/// Linked list traversal state
///
/// Holds an open handle on the current node; advancing releases it.
#[derive(Debug)]
pub struct ListIter {
    list: ObjHandle,
    node: Option<ObjHandle>,
}

impl ListIter {
    /// Handle of the node the iterator currently rests on
    pub fn node(&self) -> Option<ObjHandle> {
        self.node
    }

    /// Restart the iteration from the ends of the list
    pub fn reset(&mut self) {
        self.node = None;
    }
}

impl Ifds {
    fn check_list_head(&self, h: ObjHandle) -> Result<()> {
        let rec = self.arena.get(h)?;
        if rec.base_type() != TYPE_LINKED_LIST || rec.is_leaf() {
            return Err(IfdsError::InvalidObject(
                "object is not a linked list".into(),
            ));
        }
        Ok(())
    }

    fn check_list_node(&self, h: ObjHandle, id: i64) -> Result<()> {
        let rec = self.arena.get(h)?;
        if rec.base_type() != TYPE_LINKED_LIST || !rec.is_leaf() {
            return Err(IfdsError::InvalidObject(format!(
                "object attached to the linked list is not a linked list node (object ID {id})"
            )));
        }
        Ok(())
    }

    fn head_info(&self, h: ObjHandle) -> Result<(u32, u32, u32)> {
        match self.arena.get(h)?.info {
            TypeInfo::LinkedList { nodes, first, last } => Ok((nodes, first, last)),
            _ => Ok((0, 0, 0)),
        }
    }

    fn set_head_info(&mut self, h: ObjHandle, nodes: u32, first: u32, last: u32) -> Result<()> {
        let rec = self.arena.get_mut(h)?;
        rec.info = TypeInfo::LinkedList { nodes, first, last };
        rec.header_dirty = true;
        Ok(())
    }

    fn node_links(&self, h: ObjHandle) -> Result<(u32, u32)> {
        match self.arena.get(h)?.info {
            TypeInfo::ListNode { prev, next } => Ok((prev, next)),
            _ => Ok((0, 0)),
        }
    }

    fn set_node_links(&mut self, h: ObjHandle, prev: u32, next: u32) -> Result<()> {
        let rec = self.arena.get_mut(h)?;
        rec.info = TypeInfo::ListNode { prev, next };
        rec.header_dirty = true;
        Ok(())
    }

    pub fn num_linked_list_nodes(&self, h: ObjHandle) -> Result<u32> {
        Ok(self.head_info(h)?.0)
    }

    /// Rebuild next-pointers, `first` and the node count of a streamed list
    ///
    /// Walks the previous-pointer chain backwards from `last`; afterwards
    /// the list behaves like a regular doubly-linked list.
    pub fn normalize_linked_list(&mut self, h: ObjHandle) -> Result<()> {
        self.check_list_head(h)?;
        if !self.arena.get(h)?.is_streamed() {
            return Ok(());
        }

        let head_id = self.arena.get(h)?.id;
        let (_, _, last) = self.head_info(h)?;
        debug!(head_id, "Normalizing streamed linked list");

        let mut num = 0u32;
        let mut next_id: ObjectId = head_id;
        let mut id = last as ObjectId;

        while id > 0 && id != head_id {
            self.reduce_cache()?;

            let nh = self.get_object_by_id(id, false)?;
            if let Err(e) = self.check_list_node(nh, id) {
                self.release(nh)?;
                return Err(e);
            }

            let (prev, next) = self.node_links(nh)?;
            if next as ObjectId != next_id {
                if next > 0 && next as ObjectId != head_id {
                    self.release(nh)?;
                    return Err(IfdsError::LoopDetected(next_id as u32));
                }
                let next_fixed = if next_id == head_id && head_id < 0 {
                    0
                } else {
                    next_id as u32
                };
                self.set_node_links(nh, prev, next_fixed)?;
            }

            next_id = id;
            id = prev as ObjectId;
            self.release(nh)?;

            if id == last as ObjectId {
                return Err(IfdsError::LoopDetected(next_id as u32));
            }
            num += 1;
        }

        let first = if next_id > 0 { next_id as u32 } else { 0 };
        let (_, _, last) = self.head_info(h)?;
        self.set_head_info(h, num, first, last)?;
        let rec = self.arena.get_mut(h)?;
        rec.type_byte ^= TYPE_STREAMED;
        rec.header_dirty = true;
        Ok(())
    }

    /// Begin iterating; streamed lists are normalized first
    pub fn create_linked_list_iterator(&mut self, h: ObjHandle) -> Result<ListIter> {
        self.check_list_head(h)?;
        if self.arena.get(h)?.is_streamed() {
            self.normalize_linked_list(h)?;
        }
        Ok(ListIter {
            list: h,
            node: None,
        })
    }

    /// Advance to the next node; `false` at the end of the chain
    pub fn next_linked_list_node(&mut self, iter: &mut ListIter) -> Result<bool> {
        self.reduce_cache()?;

        let head_id = self.arena.get(iter.list)?.id;
        let (prev_id, id) = match iter.node {
            None => {
                let (_, first, _) = self.head_info(iter.list)?;
                (0i64, first as i64)
            }
            Some(nh) => {
                let node_id = self.arena.get(nh)?.id;
                let (_, next) = self.node_links(nh)?;
                (node_id, next as i64)
            }
        };

        if id < 1 || id == head_id {
            if let Some(nh) = iter.node.take() {
                self.release(nh)?;
            }
            return Ok(false);
        }

        let nh = self.get_object_by_id(id, false)?;
        if let Err(e) = self.check_list_node(nh, id) {
            self.release(nh)?;
            return Err(e);
        }

        let (prev, _) = self.node_links(nh)?;
        if prev as i64 != prev_id && prev as i64 != head_id {
            self.release(nh)?;
            return Err(IfdsError::LoopDetected(id as u32));
        }

        if let Some(old) = iter.node.replace(nh) {
            self.release(old)?;
        }
        Ok(true)
    }

    /// Step to the previous node; `false` at the start of the chain
    pub fn prev_linked_list_node(&mut self, iter: &mut ListIter) -> Result<bool> {
        self.reduce_cache()?;

        let head_id = self.arena.get(iter.list)?.id;
        let (next_id, id) = match iter.node {
            None => {
                let (_, _, last) = self.head_info(iter.list)?;
                (0i64, last as i64)
            }
            Some(nh) => {
                let node_id = self.arena.get(nh)?.id;
                let (prev, _) = self.node_links(nh)?;
                (node_id, prev as i64)
            }
        };

        if id < 1 || id == head_id {
            if let Some(nh) = iter.node.take() {
                self.release(nh)?;
            }
            return Ok(false);
        }

        let nh = self.get_object_by_id(id, false)?;
        if let Err(e) = self.check_list_node(nh, id) {
            self.release(nh)?;
            return Err(e);
        }

        let (_, next) = self.node_links(nh)?;
        if next as i64 != next_id && next as i64 != head_id {
            self.release(nh)?;
            return Err(IfdsError::LoopDetected(id as u32));
        }

        if let Some(old) = iter.node.replace(nh) {
            self.release(old)?;
        }
        Ok(true)
    }

    /// Attach a detached node to the list
    pub fn attach_linked_list_node(
        &mut self,
        head: ObjHandle,
        node: ObjHandle,
        at: ListAttach,
    ) -> Result<()> {
        self.check_list_head(head)?;
        {
            let rec = self.arena.get(node)?;
            if rec.base_type() != TYPE_LINKED_LIST || !rec.is_leaf() {
                return Err(IfdsError::InvalidObject(
                    "object is not a linked list node".into(),
                ));
            }
            if rec.id < 1 {
                return Err(IfdsError::InvalidOperation(
                    "linked list node does not have an object ID".into(),
                ));
            }
        }
        let (nprev, nnext) = self.node_links(node)?;
        if nprev > 0 || nnext > 0 {
            return Err(IfdsError::InvalidOperation(
                "node is already attached to a linked list".into(),
            ));
        }
        if let ListAttach::After(0) = at {
            return Err(IfdsError::InvalidOperation(
                "invalid 'after' object ID".into(),
            ));
        }

        self.reduce_cache()?;

        let head_id = self.arena.get(head)?.id as u32;
        let node_id = self.arena.get(node)?.id as u32;

        // Streamed lists support O(1) tail appends without normalizing.
        if self.arena.get(head)?.is_streamed() {
            let (num, first, last) = self.head_info(head)?;
            let appending = matches!(at, ListAttach::Last)
                || matches!(at, ListAttach::After(id) if id == last);
            if appending {
                let prev = if last < 1 { head_id } else { last };
                self.set_node_links(node, prev, head_id)?;
                let first = if first < 1 { node_id } else { first };
                self.set_head_info(head, num + 1, first, node_id)?;
                return Ok(());
            }
            self.normalize_linked_list(head)?;
        }

        if at == ListAttach::First {
            let (num, first, last) = self.head_info(head)?;
            let next_id = first;
            if next_id > 0 {
                let nexth = self.get_object_by_id(next_id as i64, false)?;
                if let Err(e) = self.check_list_node(nexth, next_id as i64) {
                    self.release(nexth)?;
                    return Err(e);
                }
                let (_, nn) = self.node_links(nexth)?;
                self.set_node_links(nexth, node_id, nn)?;
                self.release(nexth)?;
            }
            self.set_node_links(node, head_id, if next_id > 0 { next_id } else { head_id })?;
            let last = if last < 1 { node_id } else { last };
            self.set_head_info(head, num + 1, node_id, last)?;
            return Ok(());
        }

        let (num, first, last) = self.head_info(head)?;
        let after = match at {
            ListAttach::Last => last,
            ListAttach::After(id) => id,
            ListAttach::First => unreachable!(),
        };

        let mut next_id = head_id;
        if after > 0 {
            let prevh = self.get_object_by_id(after as i64, false)?;
            if let Err(e) = self.check_list_node(prevh, after as i64) {
                self.release(prevh)?;
                return Err(e);
            }
            let (pp, pn) = self.node_links(prevh)?;
            next_id = pn;

            if next_id > 0 && next_id != head_id {
                let nexth = self.get_object_by_id(next_id as i64, false)?;
                if let Err(e) = self.check_list_node(nexth, next_id as i64) {
                    self.release(nexth)?;
                    self.release(prevh)?;
                    return Err(e);
                }
                let (_, nn) = self.node_links(nexth)?;
                self.set_node_links(nexth, node_id, nn)?;
                self.release(nexth)?;
            }

            self.set_node_links(node, after, next_id)?;
            self.set_node_links(prevh, pp, node_id)?;
            self.release(prevh)?;
        } else {
            self.set_node_links(node, head_id, head_id)?;
        }

        let first = if first < 1 { node_id } else { first };
        let last = if after == last { node_id } else { last };
        self.set_head_info(head, num + 1, first, last)?;
        Ok(())
    }

    /// Detach a node, stitching its neighbors together
    pub fn detach_linked_list_node(&mut self, head: ObjHandle, node: ObjHandle) -> Result<()> {
        self.check_list_head(head)?;
        {
            let rec = self.arena.get(node)?;
            if rec.base_type() != TYPE_LINKED_LIST || !rec.is_leaf() {
                return Err(IfdsError::InvalidObject(
                    "object is not a linked list node".into(),
                ));
            }
            if rec.id < 1 {
                return Err(IfdsError::InvalidOperation(
                    "linked list node does not have an object ID".into(),
                ));
            }
        }

        self.reduce_cache()?;

        if self.arena.get(head)?.is_streamed() {
            self.normalize_linked_list(head)?;
        }

        let head_id = self.arena.get(head)?.id as u32;
        let node_id = self.arena.get(node)?.id as u32;
        let (nprev, nnext) = self.node_links(node)?;

        let prev_id = if nprev < 1 { head_id } else { nprev };
        let next_id = if nnext < 1 { head_id } else { nnext };

        let mut prevh = None;
        if prev_id > 0 && prev_id != head_id {
            let ph = self.get_object_by_id(prev_id as i64, false)?;
            if let Err(e) = self.check_list_node(ph, prev_id as i64) {
                self.release(ph)?;
                return Err(e);
            }
            prevh = Some(ph);
        }
        let mut nexth = None;
        if next_id > 0 && next_id != head_id {
            let nh = self.get_object_by_id(next_id as i64, false)?;
            if let Err(e) = self.check_list_node(nh, next_id as i64) {
                if let Some(ph) = prevh {
                    self.release(ph)?;
                }
                self.release(nh)?;
                return Err(e);
            }
            nexth = Some(nh);
        }

        let (mut num, mut first, mut last) = self.head_info(head)?;

        if let Some(ph) = prevh {
            let (pp, _) = self.node_links(ph)?;
            self.set_node_links(ph, pp, next_id)?;
            if next_id < 1 || next_id == head_id {
                last = self.arena.get(ph)?.id as u32;
            }
            self.release(ph)?;
        }
        if let Some(nh) = nexth {
            let (_, nn) = self.node_links(nh)?;
            self.set_node_links(nh, prev_id, nn)?;
            if prev_id < 1 || prev_id == head_id {
                first = self.arena.get(nh)?.id as u32;
            }
            self.release(nh)?;
        }

        self.set_node_links(node, 0, 0)?;

        if first == node_id {
            first = 0;
        }
        if last == node_id {
            last = 0;
        }
        if num > 0 {
            num -= 1;
        }
        self.set_head_info(head, num, first, last)?;
        Ok(())
    }

    /// Detach and delete one node
    pub fn delete_linked_list_node(&mut self, head: ObjHandle, node: ObjHandle) -> Result<()> {
        self.detach_linked_list_node(head, node)?;
        self.delete_object(node)
    }

    /// Delete every node, then the list head itself
    pub fn delete_linked_list(&mut self, head: ObjHandle) -> Result<()> {
        let mut iter = self.create_linked_list_iterator(head)?;
        while self.next_linked_list_node(&mut iter)? {
            if let Some(node) = iter.node() {
                self.delete_linked_list_node(head, node)?;
                iter.reset();
            }
        }
        self.delete_object(head)
    }
}
