//! State shared by every task of a pipeline run.

use crate::config::Configuration;
use crate::mapping::NameResolver;
use crate::method::{Classified, IgnoreReason, IgnoredMethod, MethodKey, TraceMethod};
use crate::{DISPATCH_CLASS, DISPATCH_DESC, DISPATCH_METHOD, Error, METHOD_ID_DISPATCH, Result};
use crate::{UI_ENTRY_BASES, dotted};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mtrace_core::class_file::ACC_PUBLIC;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Counters reported at the end of a run.
#[derive(Debug, Default)]
pub struct Stats {
    pub classes_scanned: AtomicUsize,
    pub methods_traced: AtomicUsize,
    pub methods_ignored: AtomicUsize,
    pub focus_candidates: AtomicUsize,
    pub classes_rewritten: AtomicUsize,
    pub probes_inserted: AtomicUsize,
    pub focus_synthesized: AtomicUsize,
    pub copied_through: AtomicUsize,
    pub check_failures: AtomicUsize,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        StatsSnapshot {
            classes_scanned: load(&self.classes_scanned),
            methods_traced: load(&self.methods_traced),
            methods_ignored: load(&self.methods_ignored),
            focus_candidates: load(&self.focus_candidates),
            classes_rewritten: load(&self.classes_rewritten),
            probes_inserted: load(&self.probes_inserted),
            focus_synthesized: load(&self.focus_synthesized),
            copied_through: load(&self.copied_through),
            check_failures: load(&self.check_failures),
        }
    }
}

/// Plain copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub classes_scanned: usize,
    pub methods_traced: usize,
    pub methods_ignored: usize,
    pub focus_candidates: usize,
    pub classes_rewritten: usize,
    pub probes_inserted: usize,
    pub focus_synthesized: usize,
    pub copied_through: usize,
    pub check_failures: usize,
}

/// Configuration, name oracle, collected tables and counters of one run.
pub struct PipelineContext {
    pub config: Configuration,
    pub resolver: Arc<dyn NameResolver>,
    /// Internal class name to internal superclass name.
    pub hierarchy: DashMap<String, String>,
    /// Traced and ignored methods; a key holds exactly one decision.
    methods: DashMap<MethodKey, Classified>,
    pub stats: Stats,
    last_id: AtomicU32,
}

impl PipelineContext {
    pub fn new(config: Configuration, resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            config,
            resolver,
            hierarchy: DashMap::new(),
            methods: DashMap::new(),
            stats: Stats::default(),
            last_id: AtomicU32::new(0),
        }
    }

    /// Returns the next unused id; the first is 1.
    pub fn next_id(&self) -> u32 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Makes sure future ids are greater than `id`.
    pub fn raise_counter(&self, id: u32) {
        self.last_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn last_id(&self) -> u32 {
        self.last_id.load(Ordering::SeqCst)
    }

    /// Records `class -> super` unless the class already has an edge.
    pub fn record_edge(&self, class_name: &str, super_name: &str) {
        self.hierarchy
            .entry(class_name.to_string())
            .or_insert_with(|| super_name.to_string());
    }

    /// Assigns an id to `key` unless it is already traced or ignored.
    ///
    /// # Returns
    /// The id of a newly traced method, or `None` when the key was already known.
    pub fn claim(&self, key: MethodKey, access_flags: u16) -> Option<u32> {
        match self.methods.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = self.next_id();
                let key = slot.key().clone();
                slot.insert(Classified::Traced(TraceMethod {
                    id,
                    access_flags,
                    key,
                }));
                Stats::bump(&self.stats.methods_traced);
                Some(id)
            }
        }
    }

    /// Records `key` as ignored unless it is already traced or ignored.
    pub fn ignore(&self, key: MethodKey, access_flags: u16, reason: IgnoreReason) -> bool {
        match self.methods.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(Classified::Ignored(IgnoredMethod {
                    access_flags,
                    key,
                    reason,
                }));
                Stats::bump(&self.stats.methods_ignored);
                true
            }
        }
    }

    /// Id assigned to the method, if it is traced.
    pub fn trace_id(&self, key: &MethodKey) -> Option<u32> {
        match self.methods.get(key)?.value() {
            Classified::Traced(method) => Some(method.id),
            Classified::Ignored(_) => None,
        }
    }

    /// Why the method was ignored, if it was.
    pub fn ignore_reason(&self, key: &MethodKey) -> Option<IgnoreReason> {
        match self.methods.get(key)?.value() {
            Classified::Ignored(method) => Some(method.reason),
            Classified::Traced(_) => None,
        }
    }

    /// Snapshot of the traced table.
    pub fn traced_methods(&self) -> Vec<TraceMethod> {
        self.methods
            .iter()
            .filter_map(|entry| match entry.value() {
                Classified::Traced(method) => Some(method.clone()),
                Classified::Ignored(_) => None,
            })
            .collect()
    }

    /// Snapshot of the ignored table.
    pub fn ignored_methods(&self) -> Vec<IgnoredMethod> {
        self.methods
            .iter()
            .filter_map(|entry| match entry.value() {
                Classified::Ignored(method) => Some(method.clone()),
                Classified::Traced(_) => None,
            })
            .collect()
    }

    pub fn traced_len(&self) -> usize {
        self.methods
            .iter()
            .filter(|entry| matches!(entry.value(), Classified::Traced(_)))
            .count()
    }

    pub fn ignored_len(&self) -> usize {
        self.methods.len() - self.traced_len()
    }

    /// Returns true if the class is blocked.
    pub fn is_blocked(&self, class_name: &str) -> bool {
        self.config
            .block_set
            .is_blocked(class_name, self.resolver.as_ref())
    }

    /// Returns true if `class_name` descends from one of the UI entry bases.
    pub fn is_ui_entry(&self, class_name: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = class_name.to_string();
        while seen.insert(current.clone()) {
            let Some(parent) = self.hierarchy.get(&current).map(|p| p.value().clone()) else {
                return false;
            };
            if UI_ENTRY_BASES.contains(&parent.as_str()) {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Loads a previous method map so unchanged methods keep their ids.
    ///
    /// Entries are re-keyed to obfuscated names; blocked entries and malformed lines are
    /// dropped. The counter is raised past every id read except the dispatch id, including
    /// ids of entries that are then dropped.
    pub fn preload_base_map(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut loaded = 0;
        for line in text.lines() {
            let Some(mut method) = TraceMethod::parse_mapping_line(line) else {
                continue;
            };
            if method.id != METHOD_ID_DISPATCH {
                self.raise_counter(method.id);
            }
            method.key = method.key.proguard(self.resolver.as_ref());
            if self.is_blocked(&method.key.class_name) {
                continue;
            }
            self.methods
                .entry(method.key.clone())
                .or_insert(Classified::Traced(method));
            loaded += 1;
        }
        tracing::info!("preloaded {} ids from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Adds the reserved dispatch entry to the traced table.
    pub fn insert_dispatch_entry(&self) {
        let key = MethodKey {
            class_name: DISPATCH_CLASS.to_string(),
            method_name: DISPATCH_METHOD.to_string(),
            descriptor: DISPATCH_DESC.to_string(),
        };
        self.methods
            .entry(key.clone())
            .or_insert(Classified::Traced(TraceMethod {
                id: METHOD_ID_DISPATCH,
                access_flags: ACC_PUBLIC,
                key,
            }));
    }

    /// Dotted original name of a class given its internal name.
    pub fn original_class_name(&self, class_name: &str) -> String {
        let name = dotted(class_name);
        self.resolver.original_class_name(&name, &name)
    }
}
