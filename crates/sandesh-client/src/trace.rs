//! Fixed-capacity trace rings with independent per-consumer read cursors.
//!
//! Each buffer assigns a monotonically increasing sequence number to every
//! entry, wrapping inside the reserved range; 0 and the u32 maximum are
//! sentinels and never assigned. Read cursors are created lazily per
//! context, advance with consumption, and are pruned once the buffer's
//! oldest retained slot catches up to them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Largest assignable trace sequence number.
pub const MAX_TRACE_SEQNO: u32 = u32::MAX - 1;
/// Smallest assignable trace sequence number.
pub const MIN_TRACE_SEQNO: u32 = 1;

struct Inner {
    entries: VecDeque<String>,
    enabled: bool,
    seqno: u32,
    wrapped: bool,
    read_index: usize,
    write_index: usize,
    read_contexts: HashMap<String, usize>,
}

/// A fixed-capacity circular buffer of trace entries.
pub struct TraceBuffer {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl TraceBuffer {
    /// Creates a buffer holding at most `capacity` entries.
    pub fn new(name: impl Into<String>, capacity: usize, enabled: bool) -> Self {
        Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                enabled,
                seqno: 0,
                wrapped: false,
                read_index: 0,
                write_index: 0,
                read_contexts: HashMap::new(),
            }),
        }
    }

    /// Buffer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enables recording.
    pub fn trace_on(&self) {
        self.inner.lock().unwrap().enabled = true;
    }

    /// Disables recording.
    pub fn trace_off(&self) {
        self.inner.lock().unwrap().enabled = false;
    }

    /// Whether recording is enabled.
    pub fn is_trace_on(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Appends an entry, evicting the oldest once full. Returns the
    /// assigned sequence number, or `None` while tracing is disabled.
    pub fn write(&self, entry: impl Into<String>) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return None;
        }
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry.into());
        // Once the buffer has wrapped, every write advances the oldest
        // retained slot.
        if inner.wrapped {
            inner.read_index = (inner.read_index + 1) % self.capacity;
        }
        inner.write_index += 1;
        if inner.write_index == self.capacity {
            inner.write_index = 0;
            inner.wrapped = true;
        }
        // A cursor sitting on the oldest retained slot has nothing stale
        // left to read; forget it so the context starts fresh next time.
        let oldest = inner.read_index;
        inner.read_contexts.retain(|_, position| *position != oldest);
        inner.seqno = if inner.seqno >= MAX_TRACE_SEQNO {
            MIN_TRACE_SEQNO
        } else {
            inner.seqno + 1
        };
        Some(inner.seqno)
    }

    /// Reads up to `count` entries (0 means the whole buffer) for
    /// `context`, invoking `callback(entry, has_more)` in oldest-to-newest
    /// order from the context's cursor.
    pub fn read<F: FnMut(&str, bool)>(&self, context: &str, count: usize, mut callback: F) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            return;
        }
        let count = if count == 0 { inner.entries.len() } else { count };
        let stored = inner.read_contexts.get(context).copied();
        let offset = match stored {
            Some(position) => {
                let delta = position as isize - inner.read_index as isize;
                if delta > 0 {
                    delta as usize
                } else {
                    (self.capacity as isize + delta) as usize
                }
            }
            None => {
                let start = inner.read_index;
                inner.read_contexts.insert(context.to_string(), start);
                0
            }
        };
        let len = inner.entries.len();
        let mut delivered = 0usize;
        for index in offset..len {
            if delivered == count {
                break;
            }
            let has_more = index != len - 1;
            callback(&inner.entries[index], has_more);
            delivered += 1;
        }
        // Advance the stored cursor modulo capacity.
        let position = inner.read_contexts.get(context).copied().unwrap_or(0);
        let advanced = position + delivered;
        let advanced = if advanced >= self.capacity {
            advanced - self.capacity
        } else {
            advanced
        };
        inner.read_contexts.insert(context.to_string(), advanced);
    }

    /// Forgets a context's read cursor.
    pub fn read_done(&self, context: &str) {
        self.inner.lock().unwrap().read_contexts.remove(context);
    }

    #[cfg(test)]
    fn cursor(&self, context: &str) -> Option<usize> {
        self.inner.lock().unwrap().read_contexts.get(context).copied()
    }
}

/// Registry of named trace buffers, constructed once at startup.
#[derive(Default)]
pub struct TraceRegistry {
    buffers: Mutex<HashMap<String, std::sync::Arc<TraceBuffer>>>,
    enabled: Mutex<bool>,
}

impl TraceRegistry {
    /// Creates an empty registry with tracing enabled.
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            enabled: Mutex::new(true),
        }
    }

    /// Enables tracing globally.
    pub fn trace_on(&self) {
        *self.enabled.lock().unwrap() = true;
    }

    /// Disables tracing globally.
    pub fn trace_off(&self) {
        *self.enabled.lock().unwrap() = false;
    }

    /// Whether tracing is enabled globally.
    pub fn is_trace_on(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    /// Adds a named buffer. A zero capacity or duplicate name is ignored.
    pub fn add(&self, name: impl Into<String>, capacity: usize, enabled: bool) {
        if capacity == 0 {
            return;
        }
        let name = name.into();
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(name.clone())
            .or_insert_with(|| std::sync::Arc::new(TraceBuffer::new(name, capacity, enabled)));
    }

    /// Removes a named buffer.
    pub fn delete(&self, name: &str) {
        self.buffers.lock().unwrap().remove(name);
    }

    /// A named buffer, if present.
    pub fn get(&self, name: &str) -> Option<std::sync::Arc<TraceBuffer>> {
        self.buffers.lock().unwrap().get(name).cloned()
    }

    /// Names of every registered buffer.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Writes to a named buffer. Returns the assigned sequence number when
    /// the buffer exists and is enabled.
    pub fn write(&self, name: &str, entry: impl Into<String>) -> Option<u32> {
        self.get(name).and_then(|buffer| buffer.write(entry))
    }

    /// Reads from a named buffer; see [`TraceBuffer::read`].
    pub fn read<F: FnMut(&str, bool)>(&self, name: &str, context: &str, count: usize, callback: F) {
        if let Some(buffer) = self.get(name) {
            buffer.read(context, count, callback);
        }
    }

    /// Forgets a context's cursor on a named buffer.
    pub fn read_done(&self, name: &str, context: &str) {
        if let Some(buffer) = self.get(name) {
            buffer.read_done(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &TraceBuffer, context: &str, count: usize) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        buffer.read(context, count, |entry, has_more| {
            out.push((entry.to_string(), has_more));
        });
        out
    }

    #[test]
    fn test_seqno_assignment_and_wrap() {
        let buffer = TraceBuffer::new("init", 4, true);
        assert_eq!(buffer.write("one"), Some(1));
        assert_eq!(buffer.write("two"), Some(2));
        // Force the counter to the reserved maximum and verify the wrap
        // back to the minimum.
        {
            let mut inner = buffer.inner.lock().unwrap();
            inner.seqno = MAX_TRACE_SEQNO;
        }
        assert_eq!(buffer.write("three"), Some(MIN_TRACE_SEQNO));
    }

    #[test]
    fn test_disabled_buffer_drops_writes() {
        let buffer = TraceBuffer::new("init", 4, true);
        buffer.trace_off();
        assert_eq!(buffer.write("lost"), None);
        assert!(buffer.is_empty());
        buffer.trace_on();
        assert_eq!(buffer.write("kept"), Some(1));
    }

    #[test]
    fn test_wraparound_keeps_last_capacity_entries() {
        let capacity = 8;
        let buffer = TraceBuffer::new("oper", capacity, true);
        for n in 0..capacity + 5 {
            buffer.write(format!("entry-{}", n));
        }
        assert_eq!(buffer.len(), capacity);

        // A fresh context with count 0 reads the whole buffer: exactly the
        // last `capacity` entries in write order.
        let got = collect(&buffer, "fresh", 0);
        assert_eq!(got.len(), capacity);
        for (index, (entry, _)) in got.iter().enumerate() {
            assert_eq!(entry, &format!("entry-{}", index + 5));
        }
        // has_more set on all but the last delivered entry.
        assert!(got[..capacity - 1].iter().all(|(_, more)| *more));
        assert!(!got[capacity - 1].1);
    }

    #[test]
    fn test_batched_reads_resume_from_cursor() {
        let buffer = TraceBuffer::new("oper", 8, true);
        for n in 0..6 {
            buffer.write(format!("entry-{}", n));
        }
        let first = collect(&buffer, "batch", 4);
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].0, "entry-0");
        assert_eq!(first[3].0, "entry-3");
        // Stopping short of the buffer end leaves has_more set.
        assert!(first[3].1);

        let second = collect(&buffer, "batch", 4);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].0, "entry-4");
        assert_eq!(second[1].0, "entry-5");
        assert!(!second[1].1);
    }

    #[test]
    fn test_new_entries_visible_to_existing_cursor() {
        let buffer = TraceBuffer::new("oper", 8, true);
        buffer.write("entry-0");
        buffer.write("entry-1");
        let first = collect(&buffer, "tail", 0);
        assert_eq!(first.len(), 2);

        buffer.write("entry-2");
        let second = collect(&buffer, "tail", 0);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, "entry-2");
    }

    #[test]
    fn test_cursor_pruned_when_caught_up() {
        let capacity = 4;
        let buffer = TraceBuffer::new("oper", capacity, true);
        for n in 0..capacity {
            buffer.write(format!("entry-{}", n));
        }
        let _ = collect(&buffer, "reader", 0);
        assert!(buffer.cursor("reader").is_some());

        // The buffer wraps far enough that the oldest retained slot reaches
        // the stored cursor; the cursor is pruned.
        for n in 0..capacity {
            buffer.write(format!("late-{}", n));
        }
        assert!(buffer.cursor("reader").is_none());

        // The pruned context reads like a fresh one.
        let got = collect(&buffer, "reader", 0);
        assert_eq!(got.len(), capacity);
        assert_eq!(got[0].0, "late-0");
    }

    #[test]
    fn test_read_done_forgets_cursor() {
        let buffer = TraceBuffer::new("oper", 4, true);
        buffer.write("entry-0");
        let _ = collect(&buffer, "once", 0);
        assert!(buffer.cursor("once").is_some());
        buffer.read_done("once");
        assert!(buffer.cursor("once").is_none());
    }

    #[test]
    fn test_registry_add_write_read_delete() {
        let registry = TraceRegistry::new();
        registry.add("init", 4, true);
        registry.add("init", 8, true);
        registry.add("empty", 0, true);
        assert_eq!(registry.names(), vec!["init".to_string()]);
        // The duplicate add did not replace the original capacity.
        assert_eq!(registry.get("init").unwrap().capacity(), 4);

        assert_eq!(registry.write("init", "hello"), Some(1));
        assert_eq!(registry.write("missing", "hello"), None);

        let mut seen = Vec::new();
        registry.read("init", "ctx", 0, |entry, _| seen.push(entry.to_string()));
        assert_eq!(seen, vec!["hello".to_string()]);

        registry.delete("init");
        assert!(registry.get("init").is_none());
    }
}
