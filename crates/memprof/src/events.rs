//! The event stream coming from an instrumentation source.
//!
//! An instrumentation source (a binary instrumentation tool, a hooked
//! allocator, a recorded log) drives a [`MemoryEventHandler`] directly, in
//! event order. For recording and replaying, the same stream can be
//! materialized as [`MemoryEvent`]s, one per line in a plain text log or
//! `postcard` encoded as a whole.
//!
//! The text form looks like this:
//!
//! ```text
//! # comment
//! enter fft_initialise
//! malloc 0x55d0c0 0x100 main
//! memalign 0x7f00 0x20 0x800 fftw_malloc
//! write 0x55d0c0 8
//! read 0x55d0c8 16
//! free 0x55d0c0 main
//! exit fft_initialise
//! ```

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::{
    fmt::{self, Display},
    str::FromStr,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{records::AccessKind, scope::ScopeId, Addr, Error};

/// Subscriber interface an instrumentation source calls into.
///
/// All calls are synchronous and made in event order from the thread being
/// observed.
pub trait MemoryEventHandler {
    /// A designated scope starts executing
    fn on_scope_enter(&mut self, scope: ScopeId) -> Result<(), Error>;

    /// A designated scope returns
    fn on_scope_exit(&mut self, scope: ScopeId) -> Result<(), Error>;

    /// An instruction accessed `len` bytes at `address`
    fn on_access(&mut self, address: Addr, len: usize, kind: AccessKind);

    /// An allocation of `size` bytes returned `address`
    fn on_alloc(&mut self, address: Addr, size: usize, caller: &str) -> Result<(), Error>;

    /// An aligned allocation of `size` bytes returned `address`
    fn on_aligned_alloc(
        &mut self,
        address: Addr,
        alignment: usize,
        size: usize,
        caller: &str,
    ) -> Result<(), Error>;

    /// `address` is being freed
    fn on_free(&mut self, address: Addr, caller: &str) -> Result<(), Error>;

    /// The observed process exits
    fn shutdown(&mut self) -> Result<(), Error>;

    /// Map a scope name to its id, if the scope is designated
    fn resolve_scope(&mut self, name: &str) -> Option<ScopeId>;

    /// Designate a scope on the fly. Handlers with a fixed set of scopes return `None`.
    fn register_scope(&mut self, _name: &str) -> Option<ScopeId> {
        None
    }
}

/// One event of the stream, with scopes referred to by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryEvent {
    /// A scope starts executing
    ScopeEnter {
        /// Scope name
        scope: String,
    },
    /// A scope returns
    ScopeExit {
        /// Scope name
        scope: String,
    },
    /// A memory read or write
    Access {
        /// First byte accessed
        address: Addr,
        /// Number of bytes accessed
        len: usize,
        /// Read or write
        kind: AccessKind,
    },
    /// `malloc`-style allocation
    Alloc {
        /// Returned pointer, 0 on failure
        address: Addr,
        /// Requested size
        size: usize,
        /// Resolved caller
        caller: String,
    },
    /// `memalign`-style allocation
    AlignedAlloc {
        /// Returned pointer, 0 on failure
        address: Addr,
        /// Requested alignment
        alignment: usize,
        /// Requested size
        size: usize,
        /// Resolved caller
        caller: String,
    },
    /// A free
    Free {
        /// Freed pointer
        address: Addr,
        /// Resolved caller
        caller: String,
    },
}

/// Parse a decimal or `0x` prefixed hex number
fn parse_number(token: &str) -> Result<usize, Error> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|err| Error::illegal_argument(format!("invalid number `{token}`: {err}")))
}

impl FromStr for MemoryEvent {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let kind = tokens
            .next()
            .ok_or_else(|| Error::illegal_argument("empty event"))?;
        let mut next = |what: &str| {
            tokens
                .next()
                .ok_or_else(|| Error::illegal_argument(format!("`{kind}` event is missing the {what}")))
        };

        let event = match kind {
            "enter" => Self::ScopeEnter {
                scope: next("scope name")?.to_string(),
            },
            "exit" => Self::ScopeExit {
                scope: next("scope name")?.to_string(),
            },
            "read" | "write" => Self::Access {
                address: parse_number(next("address")?)?,
                len: parse_number(next("length")?)?,
                kind: AccessKind::from(kind == "write"),
            },
            "malloc" => Self::Alloc {
                address: parse_number(next("address")?)?,
                size: parse_number(next("size")?)?,
                caller: next("caller")?.to_string(),
            },
            "memalign" => Self::AlignedAlloc {
                address: parse_number(next("address")?)?,
                alignment: parse_number(next("boundary")?)?,
                size: parse_number(next("size")?)?,
                caller: next("caller")?.to_string(),
            },
            "free" => Self::Free {
                address: parse_number(next("address")?)?,
                caller: next("caller")?.to_string(),
            },
            _ => {
                return Err(Error::illegal_argument(format!(
                    "unknown event kind `{kind}`"
                )))
            }
        };

        if let Some(extra) = tokens.next() {
            return Err(Error::illegal_argument(format!(
                "unexpected `{extra}` after `{kind}` event"
            )));
        }
        Ok(event)
    }
}

impl Display for MemoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeEnter { scope } => write!(f, "enter {scope}"),
            Self::ScopeExit { scope } => write!(f, "exit {scope}"),
            Self::Access {
                address,
                len,
                kind: AccessKind::Read,
            } => write!(f, "read {address:#x} {len}"),
            Self::Access {
                address,
                len,
                kind: AccessKind::Write,
            } => write!(f, "write {address:#x} {len}"),
            Self::Alloc {
                address,
                size,
                caller,
            } => write!(f, "malloc {address:#x} {size:#x} {caller}"),
            Self::AlignedAlloc {
                address,
                alignment,
                size,
                caller,
            } => write!(f, "memalign {address:#x} {alignment:#x} {size:#x} {caller}"),
            Self::Free { address, caller } => write!(f, "free {address:#x} {caller}"),
        }
    }
}

/// Parse a text event log. Blank lines and `#` comments are skipped.
pub fn parse_event_log(text: &str) -> Result<Vec<MemoryEvent>, Error> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = line.parse::<MemoryEvent>().map_err(|err| {
            Error::illegal_argument(format!("event log line {}: {err}", idx + 1))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Encode events as a `postcard` blob
pub fn to_postcard(events: &[MemoryEvent]) -> Result<Vec<u8>, Error> {
    Ok(postcard::to_allocvec(events)?)
}

/// Decode events from a `postcard` blob written by [`to_postcard`]
pub fn from_postcard(bytes: &[u8]) -> Result<Vec<MemoryEvent>, Error> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Feeds recorded [`MemoryEvent`]s into a [`MemoryEventHandler`].
///
/// Scope names are resolved through the handler. Events naming a scope the
/// handler does not know are dropped, unless auto registration is on, in which
/// case every scope seen is designated.
#[derive(Debug)]
pub struct Replayer<H> {
    handler: H,
    auto_register: bool,
    dispatched: usize,
}

impl<H> Replayer<H>
where
    H: MemoryEventHandler,
{
    /// Replay into `handler`, designating new scopes on the fly if `auto_register`
    #[must_use]
    pub fn new(handler: H, auto_register: bool) -> Self {
        Self {
            handler,
            auto_register,
            dispatched: 0,
        }
    }

    /// The handler events go to
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Number of events passed to [`Self::dispatch`] so far
    #[must_use]
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Consume the replayer, returning its handler
    #[must_use]
    pub fn into_handler(self) -> H {
        self.handler
    }

    fn scope(&mut self, name: &str) -> Option<ScopeId> {
        let id = self.handler.resolve_scope(name).or_else(|| {
            if self.auto_register {
                self.handler.register_scope(name)
            } else {
                None
            }
        });
        if id.is_none() {
            debug!("scope `{name}` is not designated, skipping");
        }
        id
    }

    /// Pass one event on to the handler
    pub fn dispatch(&mut self, event: &MemoryEvent) -> Result<(), Error> {
        self.dispatched += 1;
        match event {
            MemoryEvent::ScopeEnter { scope } => match self.scope(scope) {
                Some(id) => self.handler.on_scope_enter(id),
                None => Ok(()),
            },
            MemoryEvent::ScopeExit { scope } => match self.scope(scope) {
                Some(id) => self.handler.on_scope_exit(id),
                None => Ok(()),
            },
            MemoryEvent::Access { address, len, kind } => {
                self.handler.on_access(*address, *len, *kind);
                Ok(())
            }
            MemoryEvent::Alloc {
                address,
                size,
                caller,
            } => self.handler.on_alloc(*address, *size, caller),
            MemoryEvent::AlignedAlloc {
                address,
                alignment,
                size,
                caller,
            } => self
                .handler
                .on_aligned_alloc(*address, *alignment, *size, caller),
            MemoryEvent::Free { address, caller } => self.handler.on_free(*address, caller),
        }
    }

    /// Dispatch every event, then shut the handler down.
    ///
    /// A failing event does not stop the replay; the first error is returned
    /// once all events went through.
    pub fn run<'a, I>(&mut self, events: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a MemoryEvent>,
    {
        let mut result = Ok(());
        for event in events {
            if let Err(err) = self.dispatch(event) {
                warn!("event `{event}` failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        let shutdown = self.handler.shutdown();
        result.and(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{
        config::ProfilerConfig,
        records::TraceRecord,
        scope::{ScopeController, ScopeTable},
        sink::VecSink,
    };

    const LOG: &str = "
        # recorded by hand
        enter init
        write 0 16
        write 0x10 16
        read 0x100 4
        malloc 0x1000 0x100 main
        memalign 0x2000 32 64 fftw_malloc

        free 0x1000 main
        exit init
    ";

    #[test]
    fn test_parse_log() {
        let events = parse_event_log(LOG).unwrap();
        assert_eq!(events.len(), 8);
        assert_eq!(
            events[0],
            MemoryEvent::ScopeEnter {
                scope: "init".into()
            }
        );
        assert_eq!(
            events[2],
            MemoryEvent::Access {
                address: 0x10,
                len: 16,
                kind: AccessKind::Write
            }
        );
        assert_eq!(
            events[5],
            MemoryEvent::AlignedAlloc {
                address: 0x2000,
                alignment: 32,
                size: 64,
                caller: "fftw_malloc".into()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("jump 0x10".parse::<MemoryEvent>().is_err());
        assert!("read 0x10".parse::<MemoryEvent>().is_err());
        assert!("read 0xzz 4".parse::<MemoryEvent>().is_err());
        assert!("free 0x10 main extra".parse::<MemoryEvent>().is_err());

        let err = parse_event_log("enter init\nwrite 1\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_display_parses_back() {
        for event in parse_event_log(LOG).unwrap() {
            assert_eq!(event.to_string().parse::<MemoryEvent>().unwrap(), event);
        }
    }

    #[test]
    fn test_postcard() {
        let events = parse_event_log(LOG).unwrap();
        let bytes = to_postcard(&events).unwrap();
        assert_eq!(from_postcard(&bytes).unwrap(), events);
        assert!(from_postcard(&bytes[..bytes.len() / 2]).is_err());
    }

    fn controller(scopes: &[&str]) -> ScopeController<VecSink> {
        let mut table = ScopeTable::new();
        for scope in scopes {
            table.register(scope);
        }
        ScopeController::new(ProfilerConfig::new(64, 64).unwrap(), table, VecSink::new())
    }

    #[test]
    fn test_replay_designated_only() {
        let events = parse_event_log(LOG).unwrap();
        let mut replayer = Replayer::new(controller(&["other"]), false);
        replayer.run(&events).unwrap();
        assert_eq!(replayer.dispatched(), events.len());

        let ctl = replayer.into_handler();
        assert_eq!(
            ctl.sink().records(),
            [TraceRecord::OutstandingAllocations { entries: vec![] }]
        );
    }

    #[test]
    fn test_replay_auto_register() {
        let events = parse_event_log(LOG).unwrap();
        let mut replayer = Replayer::new(controller(&[]), true);
        replayer.run(&events).unwrap();

        let ctl = replayer.into_handler();
        assert_eq!(ctl.scopes().id("init"), Some(ScopeId(0)));
        let records = ctl.sink().records();
        assert_eq!(records.first().map(TraceRecord::scope), Some("init"));
        assert_eq!(
            records.last(),
            Some(&TraceRecord::OutstandingAllocations {
                entries: vec![(0x2000, 64)]
            })
        );
    }
}
