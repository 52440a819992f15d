use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::engine::PendingBreakpoint;
use crate::proto;
use crate::tracepoint::Tracepoint;

/// The client-visible shape of one requested breakpoint, used to decide
/// whether an existing engine-side breakpoint can be kept. Any change in
/// condition or log message forces a delete-and-recreate (rebinding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub condition: Option<String>,
    pub log_message: Option<String>,
}

impl Fingerprint {
    pub fn new(condition: Option<String>, log_message: Option<String>) -> Self {
        Fingerprint {
            condition,
            log_message,
        }
    }
}

/// One live breakpoint request: the engine-side pending handle plus the
/// request descriptor and the cached result of the last bind attempt.
/// `bind_result` answers repeated set-breakpoints calls without touching
/// the engine; asynchronous bound/error events overwrite it.
pub struct BreakpointRecord {
    pub id: u32,
    pub fingerprint: Fingerprint,
    pub tracepoint: Option<Tracepoint>,
    pub pending: Arc<dyn PendingBreakpoint>,
    pub bind_result: Option<proto::Breakpoint>,
    /// Requested source line, used when the engine has not reported an
    /// authoritative bound line yet.
    pub requested_line: Option<u32>,
}

impl BreakpointRecord {
    pub fn has_tracepoint(&self) -> bool {
        self.tracepoint.is_some()
    }
}

/// Which of the four independent tables a breakpoint lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Source,
    Function,
    Instruction,
    Data,
}

/// Outcome of diffing an existing table against a new request: pure data,
/// computed before any engine call.
#[derive(Debug, PartialEq, Eq)]
pub struct ReconcilePlan<K> {
    pub delete: Vec<K>,
    pub keep: Vec<K>,
    pub create: Vec<K>,
}

impl<K> Default for ReconcilePlan<K> {
    fn default() -> Self {
        ReconcilePlan {
            delete: Vec::new(),
            keep: Vec::new(),
            create: Vec::new(),
        }
    }
}

/// Diff `existing` against `requested`. Entries absent from the request
/// are deleted; present entries with an unchanged fingerprint are kept;
/// new entries, and entries whose fingerprint changed, are created (a
/// changed entry is also deleted first). `invalidate_all` forces
/// delete-and-recreate of everything (modified-source handling).
pub fn plan<K: Eq + Hash + Clone>(
    existing: &IndexMap<K, BreakpointRecord>,
    requested: &[(K, Fingerprint)],
    invalidate_all: bool,
) -> ReconcilePlan<K> {
    let mut plan = ReconcilePlan::default();

    for (key, record) in existing {
        let matched = requested
            .iter()
            .find(|(requested_key, _)| requested_key == key);
        match matched {
            Some((_, fingerprint)) if !invalidate_all && *fingerprint == record.fingerprint => {}
            _ => plan.delete.push(key.clone()),
        }
    }

    for (key, fingerprint) in requested {
        let reusable = existing
            .get(key)
            .is_some_and(|record| !invalidate_all && record.fingerprint == *fingerprint);
        if reusable {
            if !plan.keep.contains(key) {
                plan.keep.push(key.clone());
            }
        } else if !plan.create.contains(key) {
            plan.create.push(key.clone());
        }
    }

    plan
}

/// All four breakpoint tables plus the id counter shared between them.
/// Assigned ids are session-stable and never reused. The counter is
/// atomic so ids can be allocated while one of the tables is borrowed.
pub struct BreakpointStore {
    next_id: AtomicU32,
    pub source: IndexMap<String, IndexMap<u32, BreakpointRecord>>,
    pub function: IndexMap<String, BreakpointRecord>,
    pub instruction: IndexMap<String, BreakpointRecord>,
    pub data: IndexMap<String, BreakpointRecord>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        BreakpointStore {
            next_id: AtomicU32::new(0),
            source: IndexMap::new(),
            function: IndexMap::new(),
            instruction: IndexMap::new(),
            data: IndexMap::new(),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Per-path line table, created on first use.
    pub fn source_table(&mut self, path: &str) -> &mut IndexMap<u32, BreakpointRecord> {
        self.source.entry(path.to_string()).or_default()
    }

    /// One of the three string-keyed tables. Source breakpoints live in
    /// per-path tables instead, see [`source_table`](Self::source_table).
    pub fn keyed_table(&mut self, kind: BreakpointKind) -> &mut IndexMap<String, BreakpointRecord> {
        match kind {
            BreakpointKind::Function => &mut self.function,
            BreakpointKind::Instruction => &mut self.instruction,
            BreakpointKind::Data => &mut self.data,
            BreakpointKind::Source => unreachable!("source breakpoints are keyed per path"),
        }
    }

    /// Find a record in any table by its stable id.
    pub fn find_by_id(&self, id: u32) -> Option<(BreakpointKind, &BreakpointRecord)> {
        for table in self.source.values() {
            if let Some(record) = table.values().find(|record| record.id == id) {
                return Some((BreakpointKind::Source, record));
            }
        }
        if let Some(record) = self.function.values().find(|record| record.id == id) {
            return Some((BreakpointKind::Function, record));
        }
        if let Some(record) = self.instruction.values().find(|record| record.id == id) {
            return Some((BreakpointKind::Instruction, record));
        }
        if let Some(record) = self.data.values().find(|record| record.id == id) {
            return Some((BreakpointKind::Data, record));
        }
        None
    }

    /// Like [`find_by_id`](Self::find_by_id) but mutable, and with the
    /// table key rendered as human-readable context for diagnostics.
    pub fn find_by_id_mut(
        &mut self,
        id: u32,
    ) -> Option<(BreakpointKind, String, &mut BreakpointRecord)> {
        for (path, table) in self.source.iter_mut() {
            if let Some((line, record)) = table.iter_mut().find(|(_, record)| record.id == id) {
                let context = format!("{path}:{line}");
                return Some((BreakpointKind::Source, context, record));
            }
        }
        if let Some((name, record)) = self.function.iter_mut().find(|(_, record)| record.id == id) {
            return Some((BreakpointKind::Function, name.clone(), record));
        }
        if let Some((reference, record)) = self
            .instruction
            .iter_mut()
            .find(|(_, record)| record.id == id)
        {
            return Some((BreakpointKind::Instruction, reference.clone(), record));
        }
        if let Some((data_id, record)) = self.data.iter_mut().find(|(_, record)| record.id == id) {
            return Some((BreakpointKind::Data, data_id.clone(), record));
        }
        None
    }
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Clients may send drive letters with inconsistent casing, which would
/// split one file across two table keys. Upper-case the drive letter of
/// Windows-style paths before keying.
pub fn normalize_path_key(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() > 2 && bytes[1] == b':' && bytes[0].is_ascii_lowercase() {
        let mut normalized = String::with_capacity(path.len());
        normalized.push(bytes[0].to_ascii_uppercase() as char);
        normalized.push_str(&path[1..]);
        return normalized;
    }
    path.to_string()
}
