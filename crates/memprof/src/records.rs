//! Records handed to a [`crate::TraceSink`].
//!
//! Every record renders as one line of the CSV trace through [`Display`]:
//! the scope label, the event kind, then `key=value` pairs specific to the kind.
//! Numbers are printed in hex with a `0x` prefix, except the access sizes
//! naming the histogram buckets.

use alloc::{string::String, vec::Vec};
use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::{regions::MemoryRegion, Addr};

/// Label used for records that do not belong to a scope.
pub const NO_SCOPE_LABEL: &str = "N/A";

/// Direction of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// The instruction read memory
    Read,
    /// The instruction wrote memory
    Write,
}

impl AccessKind {
    /// `true` for [`AccessKind::Write`]
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    /// The event kind used for region records of this direction
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Read => "memory read",
            Self::Write => "memory write",
        }
    }
}

impl From<bool> for AccessKind {
    fn from(is_write: bool) -> Self {
        if is_write {
            Self::Write
        } else {
            Self::Read
        }
    }
}

/// One line of profiler output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceRecord {
    /// A designated scope started executing
    ScopeEntered {
        /// Scope label
        scope: String,
    },
    /// The active scope returned. Followed by its read and write regions.
    ScopeExited {
        /// Scope label
        scope: String,
    },
    /// One merged region touched by the scope
    Region {
        /// Scope label
        scope: String,
        /// Whether this region was read or written
        access: AccessKind,
        /// Bounds and statistics
        region: MemoryRegion,
    },
    /// Two exported regions overlap or touch, the merge pass is broken.
    MergeFault {
        /// Scope label
        scope: String,
        /// Region set the fault was found in
        access: AccessKind,
        /// End of the earlier region
        previous_end: Addr,
        /// Start of the region that should have been merged
        start: Addr,
    },
    /// A heap allocation made while the scope was active
    Allocation {
        /// Scope label
        scope: String,
        /// Requested size
        size: usize,
        /// Requested alignment, for `memalign`-style allocators
        alignment: Option<usize>,
        /// Returned pointer
        address: Addr,
        /// Resolved caller, opaque to us
        caller: String,
    },
    /// A free made while the scope was active
    Free {
        /// Scope label
        scope: String,
        /// Freed pointer
        address: Addr,
        /// Size of the allocation, `None` if we never saw it being allocated
        size: Option<usize>,
        /// Resolved caller, opaque to us
        caller: String,
    },
    /// Allocations never freed, emitted once at shutdown
    OutstandingAllocations {
        /// `(address, size)` pairs
        entries: Vec<(Addr, usize)>,
    },
}

impl TraceRecord {
    /// The scope this record is attributed to, [`NO_SCOPE_LABEL`] for process-wide records
    #[must_use]
    pub fn scope(&self) -> &str {
        match self {
            Self::ScopeEntered { scope }
            | Self::ScopeExited { scope }
            | Self::Region { scope, .. }
            | Self::MergeFault { scope, .. }
            | Self::Allocation { scope, .. }
            | Self::Free { scope, .. } => scope,
            Self::OutstandingAllocations { .. } => NO_SCOPE_LABEL,
        }
    }

    /// `true` for records flagging an internal consistency fault
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::MergeFault { .. })
    }
}

impl Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeEntered { scope } => write!(f, "{scope},enter"),
            Self::ScopeExited { scope } => write!(f, "{scope},exit"),
            Self::Region {
                scope,
                access,
                region,
            } => {
                write!(
                    f,
                    "{scope},{},start_addr={:#x},end_addr={:#x},size={:#x},total_bytes_accessed={:#x}",
                    access.label(),
                    region.start,
                    region.end,
                    region.size(),
                    region.total_bytes_accessed
                )?;
                if region.growth_up_count > 0 {
                    write!(f, ",cache_line_increments={:#x}", region.growth_up_count)?;
                }
                if region.growth_down_count > 0 {
                    write!(f, ",cache_line_decrements={:#x}", region.growth_down_count)?;
                }
                if region.histogram.overflow() > 0 {
                    write!(f, ",unknown size accesses={:#x}", region.histogram.overflow())?;
                }
                for (size, count) in region.histogram.iter() {
                    write!(f, ",{size} byte accesses={count:#x}")?;
                }
                Ok(())
            }
            Self::MergeFault {
                scope,
                access,
                previous_end,
                start,
            } => write!(
                f,
                "{scope},{},**ERROR** merge of adjacent regions failed,previous_end_addr={previous_end:#x},start_addr={start:#x}",
                access.label()
            ),
            Self::Allocation {
                scope,
                size,
                alignment: None,
                address,
                caller,
            } => write!(
                f,
                "{scope},malloc,size={size:#x},data_ptr={address:#x},caller={caller}"
            ),
            Self::Allocation {
                scope,
                size,
                alignment: Some(alignment),
                address,
                caller,
            } => write!(
                f,
                "{scope},memalign,boundary={alignment:#x},size={size:#x},data_ptr={address:#x},caller={caller}"
            ),
            Self::Free {
                scope,
                address,
                size,
                caller,
            } => {
                write!(f, "{scope},free,data_ptr={address:#x},size=")?;
                match size {
                    Some(size) => write!(f, "{size:#x}")?,
                    None => f.write_str("unknown")?,
                }
                write!(f, ",caller={caller}")
            }
            Self::OutstandingAllocations { entries } => {
                write!(f, "{NO_SCOPE_LABEL},outstanding_allocations")?;
                for (address, size) in entries {
                    write!(f, ",{address:#x}({size:#x})")?;
                }
                Ok(())
            }
        }
    }
}
