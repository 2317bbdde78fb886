//! Scope gating.
//!
//! Memory accesses and heap events are only recorded while one of the
//! designated top-level scopes is running. Those scopes are assumed to run one
//! after the other: entering a scope while another one is active, or leaving
//! a scope that is not the active one, is ignored.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::fmt::{self, Display};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::ProfilerConfig,
    events::MemoryEventHandler,
    ledger::AllocationLedger,
    records::{AccessKind, TraceRecord},
    regions::RegionSet,
    sink::TraceSink,
    Addr, Error,
};

/// Identifies a designated top-level scope
#[repr(transparent)]
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ScopeId(pub u32);

impl Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The designated scopes, by name
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ScopeTable {
    names: Vec<String>,
}

impl ScopeTable {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Designate the scope `name`. Registering a name twice returns the same id.
    pub fn register<S>(&mut self, name: S) -> ScopeId
    where
        S: AsRef<str>,
    {
        let name = name.as_ref();
        if let Some(id) = self.id(name) {
            return id;
        }
        let id = ScopeId(self.names.len() as u32);
        self.names.push(name.to_string());
        id
    }

    /// The id of the scope `name`, if it is designated
    #[must_use]
    pub fn id(&self, name: &str) -> Option<ScopeId> {
        self.names
            .iter()
            .position(|known| known == name)
            .map(|idx| ScopeId(idx as u32))
    }

    /// The label of `id`
    #[must_use]
    pub fn name(&self, id: ScopeId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Number of designated scopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// `true` if no scope is designated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Whether a designated scope is currently executing
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeState {
    /// Nothing is recorded
    #[default]
    Idle,
    /// Accesses and heap events are attributed to this scope
    Active(ScopeId),
}

/// Owns everything recorded for the observed process and routes events to it.
///
/// One controller lives for the whole observed run. Records go to the sink
/// `S`: the scope's regions when it exits, heap events as they happen, and
/// the outstanding allocations on [`ScopeController::shutdown`].
#[derive(Debug)]
pub struct ScopeController<S> {
    state: ScopeState,
    scopes: ScopeTable,
    reads: RegionSet,
    writes: RegionSet,
    ledger: AllocationLedger,
    sink: S,
}

impl<S> ScopeController<S>
where
    S: TraceSink,
{
    /// Create a new, idle controller
    #[must_use]
    pub fn new(config: ProfilerConfig, scopes: ScopeTable, sink: S) -> Self {
        Self {
            state: ScopeState::Idle,
            scopes,
            reads: RegionSet::new(config),
            writes: RegionSet::new(config),
            ledger: AllocationLedger::new(),
            sink,
        }
    }

    /// The current state
    #[must_use]
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// The active scope, if any
    #[must_use]
    pub fn active_scope(&self) -> Option<ScopeId> {
        match self.state {
            ScopeState::Idle => None,
            ScopeState::Active(id) => Some(id),
        }
    }

    /// The designated scopes
    #[must_use]
    pub fn scopes(&self) -> &ScopeTable {
        &self.scopes
    }

    /// The designated scopes (mutable)
    pub fn scopes_mut(&mut self) -> &mut ScopeTable {
        &mut self.scopes
    }

    /// Regions read by the active (or last) scope
    #[must_use]
    pub fn reads(&self) -> &RegionSet {
        &self.reads
    }

    /// Regions written by the active (or last) scope
    #[must_use]
    pub fn writes(&self) -> &RegionSet {
        &self.writes
    }

    /// Live allocations
    #[must_use]
    pub fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    /// The sink records go to
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The sink records go to (mutable)
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the controller, returning its sink
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn label(&self, id: ScopeId) -> String {
        self.scopes
            .name(id)
            .map_or_else(|| id.to_string(), ToString::to_string)
    }

    /// Emit every record, even if an earlier one failed. Returns the first error.
    fn emit_all<I>(&mut self, records: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = TraceRecord>,
    {
        let mut result = Ok(());
        for record in records {
            if let Err(err) = self.sink.emit(&record) {
                error!("failed to emit `{record}`: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// A designated scope starts executing.
    ///
    /// Clears the region sets and starts recording, unless a scope is active
    /// already or `id` was never designated.
    pub fn on_scope_enter(&mut self, id: ScopeId) -> Result<(), Error> {
        if self.scopes.name(id).is_none() {
            warn!("ignoring entry to unregistered scope {id}");
            return Ok(());
        }
        if let ScopeState::Active(active) = self.state {
            debug!(
                "ignoring entry to {} while {} is active",
                self.label(id),
                self.label(active)
            );
            return Ok(());
        }

        self.reads.clear();
        self.writes.clear();
        self.state = ScopeState::Active(id);

        let scope = self.label(id);
        info!("{scope}: enter");
        self.emit_all([TraceRecord::ScopeEntered { scope }])
    }

    /// A designated scope returns.
    ///
    /// If it is the active scope, emits the exit record followed by the read
    /// and write regions, and stops recording. Otherwise does nothing.
    pub fn on_scope_exit(&mut self, id: ScopeId) -> Result<(), Error> {
        if self.state != ScopeState::Active(id) {
            debug!("ignoring exit from {} which is not active", self.label(id));
            return Ok(());
        }
        self.state = ScopeState::Idle;

        let scope = self.label(id);
        info!(
            "{scope}: exit, {} read regions, {} write regions",
            self.reads.len(),
            self.writes.len()
        );
        let mut records = Vec::with_capacity(1 + self.reads.len() + self.writes.len());
        records.push(TraceRecord::ScopeExited {
            scope: scope.clone(),
        });
        records.extend(self.reads.export(&scope, AccessKind::Read));
        records.extend(self.writes.export(&scope, AccessKind::Write));
        self.emit_all(records)
    }

    /// An instruction accessed `len` bytes at `address`
    #[inline]
    pub fn on_access(&mut self, address: Addr, len: usize, kind: AccessKind) {
        if self.state == ScopeState::Idle {
            return;
        }
        match kind {
            AccessKind::Read => self.reads.record_access(address, len),
            AccessKind::Write => self.writes.record_access(address, len),
        }
    }

    /// An allocator returned `address` for a request of `size` bytes.
    ///
    /// A null `address` is a failed allocation and is not tracked.
    pub fn on_alloc(&mut self, address: Addr, size: usize, caller: &str) -> Result<(), Error> {
        self.allocation(address, size, None, caller)
    }

    /// An aligned allocator returned `address` for a request of `size` bytes aligned to `alignment`.
    pub fn on_aligned_alloc(
        &mut self,
        address: Addr,
        alignment: usize,
        size: usize,
        caller: &str,
    ) -> Result<(), Error> {
        self.allocation(address, size, Some(alignment), caller)
    }

    fn allocation(
        &mut self,
        address: Addr,
        size: usize,
        alignment: Option<usize>,
        caller: &str,
    ) -> Result<(), Error> {
        let Some(id) = self.active_scope() else {
            return Ok(());
        };
        if address == 0 {
            debug!("ignoring failed allocation of {size:#x} bytes by {caller}");
            return Ok(());
        }

        match alignment {
            Some(alignment) => self
                .ledger
                .record_aligned_allocation(address, size, alignment),
            None => self.ledger.record_allocation(address, size),
        }
        let scope = self.label(id);
        self.emit_all([TraceRecord::Allocation {
            scope,
            size,
            alignment,
            address,
            caller: caller.to_string(),
        }])
    }

    /// `address` is being freed
    pub fn on_free(&mut self, address: Addr, caller: &str) -> Result<(), Error> {
        let Some(id) = self.active_scope() else {
            return Ok(());
        };

        let size = self.ledger.record_free(address);
        if size.is_none() {
            debug!("free of untracked address {address:#x} by {caller}");
        }
        let scope = self.label(id);
        self.emit_all([TraceRecord::Free {
            scope,
            address,
            size,
            caller: caller.to_string(),
        }])
    }

    /// The observed process exits: report the allocations never freed, then flush the sink.
    ///
    /// Works in any state and leaves the state untouched.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let mut entries = self.ledger.outstanding_entries();
        entries.sort_unstable();
        info!(
            "{} outstanding allocations, {:#x} bytes",
            entries.len(),
            self.ledger.outstanding_bytes()
        );
        let emitted = self.emit_all([TraceRecord::OutstandingAllocations { entries }]);
        let flushed = self.sink.flush();
        emitted.and(flushed)
    }
}

impl<S> MemoryEventHandler for ScopeController<S>
where
    S: TraceSink,
{
    fn on_scope_enter(&mut self, scope: ScopeId) -> Result<(), Error> {
        ScopeController::on_scope_enter(self, scope)
    }

    fn on_scope_exit(&mut self, scope: ScopeId) -> Result<(), Error> {
        ScopeController::on_scope_exit(self, scope)
    }

    fn on_access(&mut self, address: Addr, len: usize, kind: AccessKind) {
        ScopeController::on_access(self, address, len, kind);
    }

    fn on_alloc(&mut self, address: Addr, size: usize, caller: &str) -> Result<(), Error> {
        ScopeController::on_alloc(self, address, size, caller)
    }

    fn on_aligned_alloc(
        &mut self,
        address: Addr,
        alignment: usize,
        size: usize,
        caller: &str,
    ) -> Result<(), Error> {
        ScopeController::on_aligned_alloc(self, address, alignment, size, caller)
    }

    fn on_free(&mut self, address: Addr, caller: &str) -> Result<(), Error> {
        ScopeController::on_free(self, address, caller)
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        ScopeController::shutdown(self)
    }

    fn resolve_scope(&mut self, name: &str) -> Option<ScopeId> {
        self.scopes.id(name)
    }

    fn register_scope(&mut self, name: &str) -> Option<ScopeId> {
        Some(self.scopes.register(name))
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{regions::MemoryRegion, sink::VecSink};

    fn controller(names: &[&str]) -> ScopeController<VecSink> {
        let mut scopes = ScopeTable::new();
        for name in names {
            scopes.register(name);
        }
        ScopeController::new(
            ProfilerConfig::new(64, 64).unwrap(),
            scopes,
            VecSink::new(),
        )
    }

    #[test]
    fn test_scope_table() {
        let mut scopes = ScopeTable::new();
        let init = scopes.register("init");
        let run = scopes.register("run");
        assert_eq!(scopes.register("init"), init);
        assert_ne!(init, run);
        assert_eq!(scopes.name(run), Some("run"));
        assert_eq!(scopes.id("run"), Some(run));
        assert_eq!(scopes.id("other"), None);
        assert_eq!(scopes.len(), 2);
    }

    #[test]
    fn test_idle_ignores_events() {
        let mut ctl = controller(&["init"]);
        ctl.on_access(0x100, 8, AccessKind::Read);
        ctl.on_access(0x200, 8, AccessKind::Write);
        ctl.on_alloc(0x1000, 16, "main").unwrap();
        ctl.on_free(0x1000, "main").unwrap();

        assert!(ctl.reads().is_empty());
        assert!(ctl.writes().is_empty());
        assert!(ctl.ledger().is_empty());
        assert!(ctl.sink().records().is_empty());
    }

    #[test]
    fn test_nested_enter_is_ignored() {
        let mut ctl = controller(&["a", "b"]);
        let a = ctl.scopes().id("a").unwrap();
        let b = ctl.scopes().id("b").unwrap();

        ctl.on_scope_enter(a).unwrap();
        ctl.on_access(0x100, 8, AccessKind::Read);
        ctl.on_scope_enter(b).unwrap();

        assert_eq!(ctl.state(), ScopeState::Active(a));
        assert_eq!(ctl.reads().len(), 1);
        assert_eq!(ctl.sink().records().len(), 1);
    }

    #[test]
    fn test_mismatched_exit_is_ignored() {
        let mut ctl = controller(&["a", "b"]);
        let a = ctl.scopes().id("a").unwrap();
        let b = ctl.scopes().id("b").unwrap();

        ctl.on_scope_exit(a).unwrap();
        assert_eq!(ctl.state(), ScopeState::Idle);

        ctl.on_scope_enter(a).unwrap();
        ctl.on_scope_exit(b).unwrap();
        assert_eq!(ctl.state(), ScopeState::Active(a));

        ctl.on_scope_exit(a).unwrap();
        assert_eq!(ctl.state(), ScopeState::Idle);
        assert_eq!(
            ctl.sink().records(),
            [
                TraceRecord::ScopeEntered { scope: "a".into() },
                TraceRecord::ScopeExited { scope: "a".into() },
            ]
        );
    }

    #[test]
    fn test_unregistered_scope_is_ignored() {
        let mut ctl = controller(&["a"]);
        ctl.on_scope_enter(ScopeId(7)).unwrap();
        assert_eq!(ctl.state(), ScopeState::Idle);
        assert!(ctl.sink().records().is_empty());
    }

    #[test]
    fn test_enter_clears_previous_regions() {
        let mut ctl = controller(&["a"]);
        let a = ctl.scopes().id("a").unwrap();
        ctl.on_scope_enter(a).unwrap();
        ctl.on_access(0x100, 8, AccessKind::Write);
        ctl.on_scope_exit(a).unwrap();
        assert_eq!(ctl.writes().len(), 1);

        ctl.on_scope_enter(a).unwrap();
        assert!(ctl.writes().is_empty());
    }

    #[test]
    fn test_exit_reports_regions() {
        let mut ctl = controller(&["init"]);
        let init = ctl.scopes().id("init").unwrap();
        ctl.on_scope_enter(init).unwrap();
        ctl.on_access(0, 16, AccessKind::Write);
        ctl.on_access(16, 16, AccessKind::Write);
        ctl.on_access(0x100, 4, AccessKind::Read);
        ctl.on_scope_exit(init).unwrap();

        let records = ctl.sink_mut().drain();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[1],
            TraceRecord::ScopeExited {
                scope: "init".into()
            }
        );
        assert_eq!(
            records[2],
            TraceRecord::Region {
                scope: "init".into(),
                access: AccessKind::Read,
                region: ctl.reads().get(0x100).cloned().unwrap(),
            }
        );
        let TraceRecord::Region { access, region, .. } = &records[3] else {
            panic!("expected a region, got {:?}", records[3]);
        };
        assert_eq!(*access, AccessKind::Write);
        let MemoryRegion {
            start,
            end,
            total_bytes_accessed,
            ..
        } = region;
        assert_eq!((*start, *end, *total_bytes_accessed), (0, 31, 32));
        assert_eq!(region.histogram.iter().collect::<Vec<_>>(), [(16, 2)]);
    }

    #[test]
    fn test_heap_events() {
        let mut ctl = controller(&["init"]);
        let init = ctl.scopes().id("init").unwrap();
        ctl.on_scope_enter(init).unwrap();
        ctl.on_alloc(0x1000, 0x100, "main").unwrap();
        ctl.on_aligned_alloc(0x2000, 0x20, 0x40, "fftw_malloc")
            .unwrap();
        ctl.on_alloc(0, 0x100, "main").unwrap();
        ctl.on_free(0x1000, "main").unwrap();
        ctl.on_free(0x1000, "main").unwrap();
        ctl.on_scope_exit(init).unwrap();
        ctl.shutdown().unwrap();

        let records = ctl.sink().records();
        assert_eq!(
            records[1],
            TraceRecord::Allocation {
                scope: "init".into(),
                size: 0x100,
                alignment: None,
                address: 0x1000,
                caller: "main".into(),
            }
        );
        assert_eq!(
            records[3],
            TraceRecord::Free {
                scope: "init".into(),
                address: 0x1000,
                size: Some(0x100),
                caller: "main".into(),
            }
        );
        assert_eq!(
            records[4],
            TraceRecord::Free {
                scope: "init".into(),
                address: 0x1000,
                size: None,
                caller: "main".into(),
            }
        );
        assert_eq!(
            records.last(),
            Some(&TraceRecord::OutstandingAllocations {
                entries: vec![(0x2000, 0x40)]
            })
        );
    }

    #[test]
    fn test_shutdown_while_active() {
        let mut ctl = controller(&["init"]);
        let init = ctl.scopes().id("init").unwrap();
        ctl.on_scope_enter(init).unwrap();
        ctl.on_alloc(0x3000, 8, "main").unwrap();
        ctl.on_alloc(0x1000, 8, "main").unwrap();
        ctl.shutdown().unwrap();

        assert_eq!(ctl.state(), ScopeState::Active(init));
        assert_eq!(
            ctl.sink().records().last(),
            Some(&TraceRecord::OutstandingAllocations {
                entries: vec![(0x1000, 8), (0x3000, 8)]
            })
        );
    }
}
