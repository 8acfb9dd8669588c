//! Hybrid logical clock: a monotonic, causally-correct timestamp used to
//! order every local write and every merged remote row (spec.md §3, §4.1).

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

/// `(millis, counter, node_id)`, compared lexicographically in that field
/// order (field declaration order drives the derived `Ord`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hlc {
    pub millis: i64,
    pub counter: u32,
    pub node_id: String,
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.counter.cmp(&other.counter))
            .then(self.node_id.cmp(&other.node_id))
    }
}

const DELIMITER: char = ':';

impl fmt::Display for Hlc {
    /// Fixed-width, zero-padded textual form whose string sort order matches
    /// the numeric order of the triple (spec.md §6 "HLC wire format").
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:019}{d}{:010}{d}{}",
            self.millis,
            self.counter,
            self.node_id,
            d = DELIMITER
        )
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, DELIMITER);
        let millis = parts
            .next()
            .ok_or_else(|| Error::HlcParse(s.to_owned()))?
            .parse::<i64>()
            .map_err(|_| Error::HlcParse(s.to_owned()))?;
        let counter = parts
            .next()
            .ok_or_else(|| Error::HlcParse(s.to_owned()))?
            .parse::<u32>()
            .map_err(|_| Error::HlcParse(s.to_owned()))?;
        let node_id = parts
            .next()
            .ok_or_else(|| Error::HlcParse(s.to_owned()))?
            .to_owned();
        // `splitn(3, ..)` folds any further delimiters into `node_id` rather
        // than yielding a 4th part, so a trailing extra field has to be
        // caught explicitly here.
        if node_id.contains(DELIMITER) {
            return Err(Error::HlcParse(s.to_owned()));
        }
        Ok(Hlc {
            millis,
            counter,
            node_id,
        })
    }
}

impl Hlc {
    /// A sentinel "beginning of time" HLC for a given node, useful as the
    /// initial high-water mark before any sync has happened.
    pub fn zero(node_id: impl Into<String>) -> Self {
        Hlc {
            millis: 0,
            counter: 0,
            node_id: node_id.into(),
        }
    }
}

/// Process-wide HLC source. Internal state is serialized behind a single
/// mutex so concurrent `now()` callers are totally ordered by the mutex
/// acquisition order, and in turn by the counter they observe.
pub struct HlcClock {
    node_id: String,
    last: Mutex<Option<Hlc>>,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        HlcClock {
            node_id: node_id.into(),
            last: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Emits a new HLC strictly greater than any previously emitted or
    /// observed HLC on this clock.
    pub fn now(&self) -> Hlc {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut guard = self.last.lock().expect("HLC mutex poisoned");
        let next = match guard.as_ref() {
            Some(last) if wall <= last.millis => Hlc {
                millis: last.millis,
                counter: last.counter + 1,
                node_id: self.node_id.clone(),
            },
            _ => Hlc {
                millis: wall,
                counter: 0,
                node_id: self.node_id.clone(),
            },
        };
        *guard = Some(next.clone());
        next
    }

    /// Advances internal state to `max(internal, remote)` so a later
    /// `now()` call is causally after anything merged from `remote`.
    pub fn observe(&self, remote: &Hlc) {
        let mut guard = self.last.lock().expect("HLC mutex poisoned");
        let advance = match guard.as_ref() {
            Some(last) if last >= remote => false,
            _ => true,
        };
        if advance {
            *guard = Some(remote.clone());
        }
    }
}

static GLOBAL: Mutex<Option<Arc<HlcClock>>> = Mutex::new(None);

/// Returns the process-wide clock, creating one with a freshly generated
/// node id on first access.
pub fn global() -> Arc<HlcClock> {
    let mut guard = GLOBAL.lock().expect("HLC global mutex poisoned");
    if guard.is_none() {
        *guard = Some(Arc::new(HlcClock::new(uuid::Uuid::new_v4().to_string())));
    }
    guard.as_ref().unwrap().clone()
}

/// Returns the process-wide clock, seeding it with `node_id` if it has not
/// yet been created. Has no effect on an already-initialized clock.
pub fn global_with_node_id(node_id: impl Into<String>) -> Arc<HlcClock> {
    let mut guard = GLOBAL.lock().expect("HLC global mutex poisoned");
    if guard.is_none() {
        *guard = Some(Arc::new(HlcClock::new(node_id)));
    }
    guard.as_ref().unwrap().clone()
}

/// Drops the process-wide clock so the next `global()`/`global_with_node_id()`
/// call constructs a fresh one. Tests must call this between cases that rely
/// on HLC ordering starting from a clean slate (spec.md §9).
pub fn reset_for_testing() {
    let mut guard = GLOBAL.lock().expect("HLC global mutex poisoned");
    *guard = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let hlc = Hlc {
            millis: 1_700_000_000_123,
            counter: 42,
            node_id: "node-a".into(),
        };
        let text = hlc.to_string();
        let parsed: Hlc = text.parse().unwrap();
        assert_eq!(hlc, parsed);
    }

    #[test]
    fn string_order_matches_numeric_order() {
        let a = Hlc {
            millis: 5,
            counter: 9,
            node_id: "a".into(),
        };
        let b = Hlc {
            millis: 5,
            counter: 10,
            node_id: "a".into(),
        };
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn parse_rejects_extra_fields() {
        assert!("1:2:node:extra".parse::<Hlc>().is_err());
        assert!("1:2".parse::<Hlc>().is_err());
        assert!("notanumber:2:node".parse::<Hlc>().is_err());
    }

    #[test]
    fn now_is_monotonic_even_if_wall_clock_does_not_advance() {
        let clock = HlcClock::new("node-a");
        let first = clock.now();
        let second = clock.now();
        assert!(second > first);
        // Same millisecond in practice collapses to a counter bump; either
        // way strict monotonicity must hold.
    }

    #[test]
    fn observe_advances_but_never_regresses() {
        let clock = HlcClock::new("node-a");
        let local = clock.now();
        let earlier_remote = Hlc {
            millis: 0,
            counter: 0,
            node_id: "node-b".into(),
        };
        clock.observe(&earlier_remote);
        let after_stale_observe = clock.now();
        assert!(after_stale_observe > local);

        let later_remote = Hlc {
            millis: local.millis + 10_000,
            counter: 0,
            node_id: "node-b".into(),
        };
        clock.observe(&later_remote);
        let after_future_observe = clock.now();
        assert!(after_future_observe > later_remote);
    }
}
