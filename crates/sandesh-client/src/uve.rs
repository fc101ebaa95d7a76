//! Per-type UVE cache with tombstone semantics and collector delta sync.
//!
//! Each registered UVE type caches its latest snapshot per `(table, name)`
//! key. Deletes never remove an entry: the tombstone stays so a late
//! duplicate delete is detectable, and a later non-delete update with the
//! same key gets a brand-new entry instead of reviving the old one.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::message::{SandeshLevel, SandeshMessage, SandeshType, SANDESH_SYNC_HINT};

/// How successive updates merge into a cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Every update replaces the whole snapshot.
    Overwrite,
    /// Non-null top-level elements merge in, keyed by sorted map keys.
    Dynamic,
}

/// Distinguishes plain UVE types from alarm types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UveKind {
    /// Periodic state snapshot.
    Uve,
    /// Alarm snapshot.
    Alarm,
}

/// A single UVE update handed to the cache.
#[derive(Debug, Clone)]
pub struct UveUpdate {
    /// Registered UVE type name.
    pub type_name: String,
    /// Object table; must be non-empty.
    pub table: String,
    /// Object name within the table.
    pub name: String,
    /// Marks the object deleted.
    pub deleted: bool,
    /// Opaque snapshot fields.
    pub data: Value,
    /// Per-type sequence number; assigned on the send path.
    pub seqnum: u32,
}

/// One cached entry.
#[derive(Debug, Clone)]
pub struct UveEntry {
    /// Latest merged snapshot.
    pub data: Value,
    /// Tombstone flag.
    pub deleted: bool,
    /// Sequence number of the last applied update.
    pub seqno: u32,
    /// Updates merged into this entry since it was created.
    pub update_count: u64,
}

/// Cache for one UVE type: `table -> name -> entry`.
pub struct UvePerTypeMap {
    type_name: String,
    kind: UveKind,
    merge: MergeMode,
    map: Mutex<HashMap<String, HashMap<String, UveEntry>>>,
    seqnum: AtomicU32,
}

impl UvePerTypeMap {
    fn new(type_name: String, kind: UveKind, merge: MergeMode) -> Self {
        Self {
            type_name,
            kind,
            merge,
            map: Mutex::new(HashMap::new()),
            seqnum: AtomicU32::new(0),
        }
    }

    /// Registered type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// UVE or alarm.
    pub fn kind(&self) -> UveKind {
        self.kind
    }

    /// Next per-type transmit sequence number.
    pub fn next_seqnum(&self) -> u32 {
        self.seqnum.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Latest transmit sequence number handed out.
    pub fn seqnum(&self) -> u32 {
        self.seqnum.load(Ordering::Relaxed)
    }

    /// Tables with at least one cached entry.
    pub fn tables(&self) -> Vec<String> {
        self.map.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of one cached entry.
    pub fn entry(&self, table: &str, name: &str) -> Option<UveEntry> {
        self.map
            .lock()
            .unwrap()
            .get(table)
            .and_then(|names| names.get(name))
            .cloned()
    }

    /// Applies an update to the cache. Returns false when the update is
    /// rejected.
    pub fn update(&self, update: &UveUpdate) -> bool {
        if update.table.is_empty() {
            tracing::error!(
                uve_type = %self.type_name,
                name = %update.name,
                "UVE update failed: empty table"
            );
            return false;
        }
        let mut map = self.map.lock().unwrap();
        let table = map.entry(update.table.clone()).or_default();
        match table.entry(update.name.clone()) {
            Entry::Vacant(slot) => {
                tracing::debug!(
                    uve_type = %self.type_name,
                    table = %update.table,
                    name = %update.name,
                    seqno = update.seqnum,
                    "add UVE"
                );
                slot.insert(fresh_entry(update));
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.deleted {
                    if !update.deleted {
                        // The cached entry is a tombstone and this key is
                        // being recreated: replace with a brand-new entry,
                        // not a merge.
                        tracing::debug!(
                            uve_type = %self.type_name,
                            table = %update.table,
                            name = %update.name,
                            seqno = update.seqnum,
                            "re-add UVE over tombstone"
                        );
                        *entry = fresh_entry(update);
                    } else {
                        tracing::error!(
                            uve_type = %self.type_name,
                            name = %update.name,
                            "duplicate UVE delete"
                        );
                    }
                } else {
                    entry.data = merge_snapshot(self.merge, &entry.data, &update.data);
                    entry.deleted = update.deleted;
                    entry.seqno = update.seqnum;
                    entry.update_count += 1;
                }
            }
        }
        true
    }

    /// Re-sends cached entries newer than `since_seqno` (0 means all)
    /// through `sink`, marking all but the last with the more flag. Returns
    /// the number sent.
    pub fn sync(
        &self,
        table: Option<&str>,
        since_seqno: u32,
        ctx: &str,
        sink: &dyn Fn(SandeshMessage),
    ) -> usize {
        let map = self.map.lock().unwrap();
        let mut pending = Vec::new();
        for (uve_table, names) in map.iter() {
            if let Some(filter) = table {
                if uve_table != filter {
                    continue;
                }
            }
            for (name, entry) in names.iter() {
                if since_seqno == 0 || entry.seqno > since_seqno {
                    pending.push((uve_table.clone(), name.clone(), entry.clone()));
                }
            }
        }
        let total = pending.len();
        for (index, (uve_table, name, entry)) in pending.into_iter().enumerate() {
            let more = index + 1 < total;
            tracing::debug!(
                uve_type = %self.type_name,
                table = %uve_table,
                name = %name,
                seqno = entry.seqno,
                "sync UVE"
            );
            sink(self.entry_message(&uve_table, &name, &entry, ctx, more, SANDESH_SYNC_HINT));
        }
        total
    }

    /// Sends one named entry on demand. Returns true when it was found.
    pub fn send(
        &self,
        table: Option<&str>,
        name: &str,
        ctx: &str,
        sink: &dyn Fn(SandeshMessage),
    ) -> bool {
        let map = self.map.lock().unwrap();
        for (uve_table, names) in map.iter() {
            if let Some(filter) = table {
                if uve_table != filter {
                    continue;
                }
            }
            if let Some(entry) = names.get(name) {
                sink(self.entry_message(uve_table, name, entry, ctx, false, SANDESH_SYNC_HINT));
                return true;
            }
        }
        false
    }

    /// Builds the outbound message for a fresh update.
    pub fn uve_message(&self, update: &UveUpdate) -> SandeshMessage {
        let entry = fresh_entry(update);
        self.entry_message(&update.table, &update.name, &entry, "", false, 0)
    }

    fn entry_message(
        &self,
        table: &str,
        name: &str,
        entry: &UveEntry,
        ctx: &str,
        more: bool,
        hints: u32,
    ) -> SandeshMessage {
        let payload = serde_json::json!({
            "name": name,
            "table": table,
            "deleted": entry.deleted,
            "data": entry.data,
        });
        let msg_type = match self.kind {
            UveKind::Uve => SandeshType::Uve,
            UveKind::Alarm => SandeshType::Alarm,
        };
        let mut msg = SandeshMessage::new(
            self.type_name.clone(),
            msg_type,
            SandeshLevel::SysNotice,
            payload,
        );
        msg.seqnum = entry.seqno;
        msg.context = ctx.to_string();
        msg.hints = hints;
        msg.more = more;
        msg
    }
}

fn fresh_entry(update: &UveUpdate) -> UveEntry {
    UveEntry {
        data: update.data.clone(),
        deleted: update.deleted,
        seqno: update.seqnum,
        update_count: 0,
    }
}

fn merge_snapshot(mode: MergeMode, current: &Value, incoming: &Value) -> Value {
    match mode {
        MergeMode::Overwrite => incoming.clone(),
        MergeMode::Dynamic => {
            let mut merged: BTreeMap<String, Value> = current
                .as_object()
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            if let Some(incoming) = incoming.as_object() {
                for (key, value) in incoming {
                    if !value.is_null() {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(merged.into_iter().collect())
        }
    }
}

/// Explicit registry of UVE types, constructed once at startup and passed
/// by handle to everything that needs it.
#[derive(Default)]
pub struct UveTypeRegistry {
    map: Mutex<HashMap<String, Arc<UvePerTypeMap>>>,
}

impl UveTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a UVE type.
    pub fn register(
        &self,
        type_name: impl Into<String>,
        kind: UveKind,
        merge: MergeMode,
    ) -> Result<Arc<UvePerTypeMap>> {
        let type_name = type_name.into();
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&type_name) {
            return Err(ClientError::DuplicateUveType(type_name));
        }
        let per_type = Arc::new(UvePerTypeMap::new(type_name.clone(), kind, merge));
        map.insert(type_name, per_type.clone());
        Ok(per_type)
    }

    /// Looks up a registered type.
    pub fn get(&self, type_name: &str) -> Option<Arc<UvePerTypeMap>> {
        self.map.lock().unwrap().get(type_name).cloned()
    }

    /// Every registered type name, advertised in the handshake.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Delta-syncs every registered type against the collector's
    /// per-type acknowledged sequence numbers (absent means 0: send all).
    pub fn sync_all(&self, peer_seqnos: &HashMap<String, u32>, sink: &dyn Fn(SandeshMessage)) {
        let maps: Vec<Arc<UvePerTypeMap>> = self.map.lock().unwrap().values().cloned().collect();
        for per_type in maps {
            let since = peer_seqnos
                .get(per_type.type_name())
                .copied()
                .unwrap_or(0);
            per_type.sync(None, since, "", sink);
        }
    }
}
