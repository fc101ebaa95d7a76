//! Bounded FIFO with byte accounting and watermark-driven level changes.
//!
//! High watermarks are evaluated on enqueue, low watermarks on dequeue.
//! Only the single most-recently-active index on either side is tracked, so
//! an enqueue that jumps several thresholds fires only the final level's
//! callback. Callbacks run synchronously inside the enqueue or dequeue that
//! triggered them and must not touch the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Items a drain worker processes before yielding its slice.
pub const MAX_WORK_LOAD: usize = 16;

/// Default bound on queued items.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 1024;

/// Accounting hook: how much an item adds to the queue size.
pub trait Weighted {
    /// Accounted size of this item, in bytes.
    fn weight(&self) -> usize;
}

/// A size threshold paired with the callback fired when it becomes the
/// active threshold.
pub struct WaterMark {
    /// Queue size at which this mark is crossed.
    pub size: usize,
    /// Invoked with the current queue size when this mark becomes active.
    pub callback: Box<dyn Fn(usize) + Send + Sync>,
}

impl std::fmt::Debug for WaterMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterMark").field("size", &self.size).finish()
    }
}

struct Inner<T> {
    queue: VecDeque<T>,
    qsize: usize,
    max_qlen: usize,
    high_watermarks: Vec<WaterMark>,
    low_watermarks: Vec<WaterMark>,
    hwm_index: isize,
    lwm_index: isize,
}

/// Bounded FIFO with cumulative byte-size accounting and two-sided sorted
/// watermark tables.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    max_len: Option<usize>,
    num_enqueues: AtomicU64,
    num_dequeues: AtomicU64,
    drops: AtomicU64,
    runner_active: AtomicBool,
}

impl<T: Weighted> WorkQueue<T> {
    /// Creates an unbounded queue.
    pub fn new() -> Self {
        Self::with_bound(None)
    }

    /// Creates a queue refusing enqueues past `max_len` items.
    pub fn bounded(max_len: usize) -> Self {
        Self::with_bound(Some(max_len))
    }

    fn with_bound(max_len: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                qsize: 0,
                max_qlen: 0,
                high_watermarks: Vec::new(),
                low_watermarks: Vec::new(),
                hwm_index: -1,
                lwm_index: -1,
            }),
            max_len,
            num_enqueues: AtomicU64::new(0),
            num_dequeues: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            runner_active: AtomicBool::new(false),
        }
    }

    /// Installs the high watermark table, replacing any previous one.
    /// Duplicate sizes are weeded out; the table is kept sorted ascending.
    pub fn set_high_watermarks(&self, marks: Vec<WaterMark>) {
        let mut inner = self.inner.lock().unwrap();
        inner.high_watermarks = dedup_sorted(marks);
        inner.hwm_index = -1;
        inner.lwm_index = -1;
    }

    /// Installs the low watermark table, replacing any previous one.
    pub fn set_low_watermarks(&self, marks: Vec<WaterMark>) {
        let mut inner = self.inner.lock().unwrap();
        inner.low_watermarks = dedup_sorted(marks);
        inner.hwm_index = -1;
        inner.lwm_index = -1;
    }

    /// Enqueues an item. Returns the item back when the bounded queue
    /// refuses it.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(max_len) = self.max_len {
            if inner.queue.len() >= max_len {
                self.drops.fetch_add(1, Ordering::Relaxed);
                return Err(item);
            }
        }
        inner.qsize += item.weight();
        if inner.qsize > inner.max_qlen {
            inner.max_qlen = inner.qsize;
        }
        self.num_enqueues.fetch_add(1, Ordering::Relaxed);
        Self::process_high_watermarks(&mut inner);
        inner.queue.push_back(item);
        Ok(())
    }

    /// Pops the oldest item, re-evaluating low watermarks.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.queue.pop_front()?;
        inner.qsize -= item.weight();
        self.num_dequeues.fetch_add(1, Ordering::Relaxed);
        Self::process_low_watermarks(&mut inner);
        Some(item)
    }

    /// Current accounted size.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().qsize
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// Largest accounted size ever observed.
    pub fn max_qlen(&self) -> usize {
        self.inner.lock().unwrap().max_qlen
    }

    /// Total successful enqueues.
    pub fn num_enqueues(&self) -> u64 {
        self.num_enqueues.load(Ordering::Relaxed)
    }

    /// Total dequeues.
    pub fn num_dequeues(&self) -> u64 {
        self.num_dequeues.load(Ordering::Relaxed)
    }

    /// Total refused enqueues.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// The (high, low) active watermark indices; -1 means none.
    pub fn watermark_indices(&self) -> (isize, isize) {
        let inner = self.inner.lock().unwrap();
        (inner.hwm_index, inner.lwm_index)
    }

    /// Claims the drain-runner slot. Returns false when a runner already
    /// holds it.
    pub fn try_claim_runner(&self) -> bool {
        !self.runner_active.swap(true, Ordering::AcqRel)
    }

    /// Releases the drain-runner slot.
    pub fn release_runner(&self) {
        self.runner_active.store(false, Ordering::Release);
    }

    /// Whether a drain runner currently holds the slot.
    pub fn runner_active(&self) -> bool {
        self.runner_active.load(Ordering::Acquire)
    }

    fn process_high_watermarks(inner: &mut Inner<T>) {
        if inner.high_watermarks.is_empty() {
            return;
        }
        // Index of the first mark above the current size; the mark below it
        // is the one we have crossed.
        let qsize = inner.qsize;
        let index = inner.high_watermarks.partition_point(|wm| wm.size <= qsize);
        if index == 0 {
            return;
        }
        let hwm = (index - 1) as isize;
        if hwm == inner.hwm_index {
            return;
        }
        inner.hwm_index = hwm;
        inner.lwm_index = hwm + 1;
        (inner.high_watermarks[hwm as usize].callback)(qsize);
    }

    fn process_low_watermarks(inner: &mut Inner<T>) {
        if inner.low_watermarks.is_empty() {
            return;
        }
        // Index of the first mark at or above the current size.
        let qsize = inner.qsize;
        let index = inner.low_watermarks.partition_point(|wm| wm.size < qsize);
        if index == inner.low_watermarks.len() {
            return;
        }
        let lwm = index as isize;
        if lwm == inner.lwm_index {
            return;
        }
        inner.hwm_index = lwm - 1;
        inner.lwm_index = lwm;
        (inner.low_watermarks[lwm as usize].callback)(qsize);
    }
}

impl<T: Weighted> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn dedup_sorted(mut marks: Vec<WaterMark>) -> Vec<WaterMark> {
    marks.sort_by_key(|wm| wm.size);
    marks.dedup_by_key(|wm| wm.size);
    marks
}
