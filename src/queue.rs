//! An unbounded lock-free multi-producer multi-consumer FIFO queue.
//!
//! Michael and Scott. Simple, Fast, and Practical Non-Blocking and Blocking
//! Concurrent Queue Algorithms. PODC 1996.
//! http://dl.acm.org/citation.cfm?id=248052.248106

use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, unprotected, Atomic, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

/// A node in the linked list backing the queue.
///
/// The node at `head` is the sentinel: its `value` slot is vacant, either
/// because it was never filled (the initial dummy) or because the pop that
/// made it the sentinel already moved the value out. A node's `next` field
/// transitions from null to non-null at most once, always by CAS.
struct Node<T> {
    value: MaybeUninit<T>,

    next: Atomic<Node<T>>,
}

/// An unbounded lock-free queue.
///
/// `head` always refers to the sentinel node and `tail` to some node
/// reachable from it. `tail` may transiently lag behind the last node in
/// the list; both push and pop swing it forward when they find it lagging,
/// so no thread ever has to wait for another to finish.
///
/// Retired sentinels are reclaimed with epoch-based reclamation, which
/// rules out use-after-free and ABA on node addresses: a node is freed only
/// once every thread that was pinned at retirement time has unpinned.
pub struct Queue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };

        let sentinel = Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        });

        unsafe {
            let guard = unprotected();
            let sentinel = sentinel.into_shared(guard);
            queue.head.store(sentinel, Relaxed);
            queue.tail.store(sentinel, Relaxed);
        }

        queue
    }

    /// Pushes `value` onto the back of the queue.
    ///
    /// Never blocks and never fails. The value is visible to other threads
    /// from the instant the new node is linked into the list, regardless of
    /// whether the subsequent tail swing lands.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();

        let mut new = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Acquire, guard);
            // Safety: `tail` is always non-null, and the guard keeps the
            // node alive even if it has already been popped and retired.
            let t = unsafe { tail.deref() };
            let next = t.next.load(Acquire, guard);

            // The snapshot is stale if `tail` moved between the two loads.
            if self.tail.load(Acquire, guard) != tail {
                continue;
            }

            if !next.is_null() {
                // `tail` lags behind a half-finished push. Help swing it
                // forward and retry; failure means someone else already did.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, guard);
                continue;
            }

            match t.next.compare_exchange(Shared::null(), new, Release, Relaxed, guard) {
                Ok(new) => {
                    // Linked: the push has taken effect. The tail swing is
                    // best-effort; a loser here leaves `tail` lagging for
                    // the next operation to repair.
                    let _ = self
                        .tail
                        .compare_exchange(tail, new, Release, Relaxed, guard);
                    return;
                }
                Err(e) => {
                    new = e.new;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the value at the front of the queue, or returns `None` if the
    /// queue is empty.
    ///
    /// `None` reflects the state at the pop's linearization point; a racing
    /// push that has not yet linked its node does not count as present.
    pub fn try_pop(&self) -> Option<T> {
        let guard = &epoch::pin();

        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Acquire, guard);
            let tail = self.tail.load(Acquire, guard);
            // Safety: `head` is always non-null; the guard pins its node.
            let h = unsafe { head.deref() };
            let next = h.next.load(Acquire, guard);

            if self.head.load(Acquire, guard) != head {
                backoff.spin();
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // A push linked its node but has not swung `tail` yet.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, guard);
                continue;
            }

            // `head != tail`, so the sentinel has a successor.
            // Safety: the guard keeps the successor alive.
            let n = unsafe { next.deref() };

            // Read the payload before publishing the new head; once the CAS
            // lands, another thread may retire and later free `head`'s node.
            // Safety: `n` is linked and non-sentinel, so its value slot is
            // initialized; losers of the CAS below forget their copy without
            // dropping it, so the value is moved out exactly once.
            let value = unsafe { ptr::read(n.value.as_ptr()) };

            match self.head.compare_exchange(head, next, Release, Relaxed, guard) {
                Ok(_) => {
                    // `next`'s node is the new sentinel; the old one is
                    // unreachable and can be reclaimed once no pinned
                    // thread may still hold it. Its value slot is vacant,
                    // so deferred destruction frees only the allocation.
                    unsafe {
                        guard.defer_destroy(head);
                    }
                    return Some(value);
                }
                Err(_) => {
                    mem::forget(value);
                    backoff.spin();
                }
            }
        }
    }

    /// Returns `true` if the queue held no values at the instant of the
    /// check.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Acquire, guard);
        // Safety: `head` is always non-null; the guard pins its node.
        let h = unsafe { head.deref() };
        h.next.load(Acquire, guard).is_null()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        unsafe {
            // Safety: `&mut self` means no other thread touches the queue,
            // so walking the list without pinning is fine.
            let guard = unprotected();

            let mut curr = self.head.load(Relaxed, guard);
            let mut is_sentinel = true;
            while !curr.is_null() {
                let mut node = curr.into_owned();
                curr = node.next.load(Relaxed, guard);
                // The sentinel's value slot is vacant; every other node
                // still owns its payload.
                if !is_sentinel {
                    ptr::drop_in_place(node.value.as_mut_ptr());
                }
                is_sentinel = false;
            }
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Queue { .. }")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_utils::thread;

    use super::Queue;

    const THREADS: usize = 8;
    const COUNT: usize = 10_000;

    #[test]
    fn push_try_pop() {
        let q: Queue<i32> = Queue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.try_pop(), Some(1));
        q.push(3);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn fifo_order() {
        let q: Queue<usize> = Queue::new();
        for i in 0..100 {
            q.push(i);
        }
        for i in 0..100 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn empty_detection() {
        let q: Queue<&str> = Queue::new();
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);

        q.push("a");
        assert!(!q.is_empty());
        assert_eq!(q.try_pop(), Some("a"));
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn concurrent_push() {
        let q: Queue<usize> = Queue::new();

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| {
                    for i in 0..COUNT {
                        q.push(i);
                    }
                });
            }
        })
        .unwrap();

        let mut popped = 0;
        while q.try_pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, THREADS * COUNT);
    }

    #[test]
    fn mpmc_no_loss_no_duplication() {
        let q: Queue<usize> = Queue::new();
        let popped = AtomicUsize::new(0);
        let seen: Vec<AtomicUsize> = (0..THREADS * COUNT).map(|_| AtomicUsize::new(0)).collect();

        thread::scope(|scope| {
            for t in 0..THREADS {
                let q = &q;
                scope.spawn(move |_| {
                    for i in 0..COUNT {
                        q.push(t * COUNT + i);
                    }
                });
            }
            for _ in 0..THREADS {
                let q = &q;
                let popped = &popped;
                let seen = &seen;
                scope.spawn(move |_| {
                    while popped.load(Ordering::SeqCst) < THREADS * COUNT {
                        if let Some(v) = q.try_pop() {
                            seen[v].fetch_add(1, Ordering::SeqCst);
                            popped.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(q.try_pop(), None);
        for (v, count) in seen.iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 1, "value {} lost or duplicated", v);
        }
    }

    #[test]
    fn drop_exactly_once() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted(#[allow(dead_code)] usize);

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let q: Queue<Counted> = Queue::new();
            for i in 0..100 {
                q.push(Counted(i));
            }
            for _ in 0..50 {
                assert!(q.try_pop().is_some());
            }
            assert_eq!(DROPS.load(Ordering::SeqCst), 50);
            // The remaining 50 are dropped by the queue itself.
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 100);
    }
}
