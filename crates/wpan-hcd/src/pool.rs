//! Link records and the bounded pool that recycles them.
//!
//! A [`UrbLink`] carries one in-flight URB through the controller. At any time it is held by
//! exactly one container, and its [`LinkLocation`] tag names that container. Links only change
//! hands through [`LinkQueue`], which keeps the tag and the physical container in step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{HcdError, HcdResult};
use crate::lock;
use crate::urb::UrbHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkLocation {
    /// Pooled, or detached and owned by a local variable.
    Free,
    Pending,
    /// Queued on an endpoint; `endpoint` is the endpoint address (bit 7 set for IN).
    Endpoint { port: usize, endpoint: u8 },
    Cancelling,
    Orphaned,
}

#[derive(Debug)]
pub struct UrbLink {
    pub(crate) urb: Option<UrbHandle>,
    pub(crate) port: usize,
    /// Endpoint address, bit 7 set for IN.
    pub(crate) endpoint: u8,
    pub(crate) req_id: u8,
    /// EP0 resend counter. Zero means "not armed".
    pub(crate) submit_counter: u32,
    location: LinkLocation,
}

impl UrbLink {
    fn blank() -> Self {
        Self {
            urb: None,
            port: 0,
            endpoint: 0,
            req_id: 0,
            submit_counter: 0,
            location: LinkLocation::Free,
        }
    }

    pub fn location(&self) -> LinkLocation {
        self.location
    }

    pub(crate) fn holds(&self, urb: &UrbHandle) -> bool {
        self.urb.as_ref().is_some_and(|held| Arc::ptr_eq(held, urb))
    }
}

pub(crate) type LinkBox = Box<UrbLink>;

/// Bounded free list of link records.
///
/// `acquire` never blocks on allocation: it either reuses a pooled record or allocates a fresh one,
/// and fails with `OutOfMemory` once `limit` live records exist.
#[derive(Debug)]
pub struct LinkPool {
    free: Mutex<Vec<LinkBox>>,
    capacity: usize,
    limit: Option<usize>,
    outstanding: AtomicUsize,
}

impl LinkPool {
    pub fn new(capacity: usize, limit: Option<usize>) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            limit,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self) -> HcdResult<LinkBox> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match self.limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            });
        if reserved.is_err() {
            tracing::warn!(limit = ?self.limit, "link pool exhausted");
            return Err(HcdError::OutOfMemory);
        }
        let pooled = lock(&self.free).pop();
        Ok(pooled.unwrap_or_else(|| Box::new(UrbLink::blank())))
    }

    pub(crate) fn release(&self, mut link: LinkBox) {
        *link = UrbLink::blank();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut free = lock(&self.free);
        if free.len() < self.capacity {
            free.push(link);
        }
    }

    /// Idle records currently held for reuse.
    pub fn pooled(&self) -> usize {
        lock(&self.free).len()
    }

    /// Records handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// FIFO of links that all share one [`LinkLocation`].
#[derive(Debug)]
pub(crate) struct LinkQueue {
    tag: LinkLocation,
    links: VecDeque<LinkBox>,
}

impl LinkQueue {
    pub(crate) fn new(tag: LinkLocation) -> Self {
        Self {
            tag,
            links: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn push_back(&mut self, mut link: LinkBox) {
        link.location = self.tag;
        self.links.push_back(link);
    }

    pub(crate) fn pop_front(&mut self) -> Option<LinkBox> {
        let mut link = self.links.pop_front()?;
        link.location = LinkLocation::Free;
        Some(link)
    }

    pub(crate) fn front(&self) -> Option<&UrbLink> {
        self.links.front().map(|link| &**link)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &UrbLink> {
        self.links.iter().map(|link| &**link)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut UrbLink> {
        self.links.iter_mut().map(|link| &mut **link)
    }

    /// Detaches the first link matching `pred`.
    pub(crate) fn remove_where(
        &mut self,
        mut pred: impl FnMut(&UrbLink) -> bool,
    ) -> Option<LinkBox> {
        let pos = self.links.iter().position(|link| pred(&**link))?;
        let mut link = self.links.remove(pos)?;
        link.location = LinkLocation::Free;
        Some(link)
    }

    pub(crate) fn remove_urb(&mut self, urb: &UrbHandle) -> Option<LinkBox> {
        self.remove_where(|link| link.holds(urb))
    }

    /// Moves every link matching `pred` to the back of `dst`, preserving order.
    pub(crate) fn move_where(
        &mut self,
        dst: &mut LinkQueue,
        mut pred: impl FnMut(&UrbLink) -> bool,
    ) {
        let mut kept = VecDeque::with_capacity(self.links.len());
        for link in self.links.drain(..) {
            if pred(&*link) {
                dst.push_back(link);
            } else {
                kept.push_back(link);
            }
        }
        self.links = kept;
    }

    /// Detaches every link matching `pred`, preserving order.
    pub(crate) fn take_where(&mut self, mut pred: impl FnMut(&UrbLink) -> bool) -> Vec<LinkBox> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.links.len());
        for mut link in self.links.drain(..) {
            if pred(&*link) {
                link.location = LinkLocation::Free;
                taken.push(link);
            } else {
                kept.push_back(link);
            }
        }
        self.links = kept;
        taken
    }

    pub(crate) fn move_all(&mut self, dst: &mut LinkQueue) {
        self.move_where(dst, |_| true);
    }

    pub(crate) fn drain(&mut self) -> Vec<LinkBox> {
        let mut out = Vec::with_capacity(self.links.len());
        while let Some(link) = self.pop_front() {
            out.push(link);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urb::Urb;
    use crate::usb::Direction;

    #[test]
    fn acquire_past_limit_fails_and_release_recycles() {
        let pool = LinkPool::new(2, Some(3));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), HcdError::OutOfMemory);
        assert_eq!(pool.outstanding(), 3);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.pooled(), 2, "pool keeps at most its capacity");
        assert_eq!(pool.outstanding(), 0);

        let reused = pool.acquire().unwrap();
        assert_eq!(reused.location(), LinkLocation::Free);
        assert!(reused.urb.is_none());
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn queue_moves_update_location_tags() {
        let pool = LinkPool::new(4, None);
        let mut pending = LinkQueue::new(LinkLocation::Pending);
        let mut orphans = LinkQueue::new(LinkLocation::Orphaned);

        let urbs: Vec<UrbHandle> = (0..3)
            .map(|i| Urb::bulk(1, 1, Direction::Out, vec![i]).into_handle())
            .collect();
        for (i, urb) in urbs.iter().enumerate() {
            let mut link = pool.acquire().unwrap();
            link.urb = Some(urb.clone());
            link.port = i;
            pending.push_back(link);
        }
        assert!(pending.iter().all(|l| l.location() == LinkLocation::Pending));

        pending.move_where(&mut orphans, |l| l.port != 1);
        assert_eq!(pending.len(), 1);
        assert_eq!(orphans.len(), 2);
        assert!(orphans.iter().all(|l| l.location() == LinkLocation::Orphaned));
        assert_eq!(orphans.front().map(|l| l.port), Some(0));

        let found = orphans.remove_urb(&urbs[2]).unwrap();
        assert_eq!(found.location(), LinkLocation::Free);
        assert_eq!(found.port, 2);
        assert!(orphans.remove_urb(&urbs[2]).is_none());
    }
}
