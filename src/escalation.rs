//! Failure-to-handler resolution across the hierarchy.
//!
//! Search order for a failure raised by a job:
//!
//! 1. the failing job's own table, then each parallel owner's table walking
//!    up the owner chain;
//! 2. the thread (office) table;
//! 3. the resource-source tables of the resource that caused the failure
//!    (runtime registrations first, then its static table), then the
//!    process-type resource-source table;
//! 4. the process table.
//!
//! Levels 2-4 are gated by the thread's [`EscalationLevel`]: once a handler
//! was found at a level, that level and every level below it are never
//! consulted again on that thread. Nothing matching means the failure is
//! fatal to the process.

use serde::{Deserialize, Serialize};

use crate::error::{Failure, FailureKind};
use crate::graph::JobIndex;

#[derive(Debug, Clone)]
struct EscalationEntry {
    kind: FailureKind,
    handler: JobIndex,
}

/// Ordered mapping from failure kinds to handler jobs.
#[derive(Debug, Clone, Default)]
pub struct EscalationTable {
    entries: Vec<EscalationEntry>,
}

impl EscalationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: FailureKind, handler: JobIndex) {
        self.entries.push(EscalationEntry { kind, handler });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most specific handler for `failure`; ties go to the earliest entry.
    pub fn find(&self, failure: &Failure) -> Option<JobIndex> {
        let mut best: Option<(usize, JobIndex)> = None;
        for entry in &self.entries {
            if let Some(depth) = entry.kind.specificity(&failure.kind) {
                if best.is_none_or(|(d, _)| depth > d) {
                    best = Some((depth, entry.handler));
                }
            }
        }
        best.map(|(_, handler)| handler)
    }
}

/// How far up the hierarchy escalation has already gone on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EscalationLevel {
    /// Only job-local and owner-chain tables consulted so far.
    Flow,
    Office,
    ResourceSource,
    Process,
    Fatal,
}

impl EscalationLevel {
    /// Levels still available above `self`, nearest first.
    pub fn remaining(self) -> impl Iterator<Item = EscalationLevel> {
        [
            EscalationLevel::Office,
            EscalationLevel::ResourceSource,
            EscalationLevel::Process,
        ]
        .into_iter()
        .filter(move |level| *level > self)
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationLevel::Flow => write!(f, "FLOW"),
            EscalationLevel::Office => write!(f, "OFFICE"),
            EscalationLevel::ResourceSource => write!(f, "RESOURCE_SOURCE"),
            EscalationLevel::Process => write!(f, "PROCESS"),
            EscalationLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

/// View of one job in the owner chain, as seen by the search.
pub(crate) struct ChainLink<'a, N> {
    pub table: &'a EscalationTable,
    pub owner: Option<N>,
    /// The job is the first job of an escalation handler flow.
    pub handler_root: bool,
}

/// Where a handler was found.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution<N> {
    /// In the table of `escalated`; `path` runs from the failing job up to
    /// and including `escalated`.
    Chain {
        handler: JobIndex,
        path: Vec<N>,
        owner: Option<N>,
    },
    /// At a thread-level or higher; `path` is the whole owner chain.
    Level {
        handler: JobIndex,
        level: EscalationLevel,
        path: Vec<N>,
    },
    /// A failure escaped an escalation handler.
    Unrecoverable { path: Vec<N> },
    /// Nothing matched anywhere.
    Fatal { path: Vec<N> },
}

/// Tables consulted above the owner chain, in search order per level.
pub(crate) struct LevelTables<'a> {
    pub office: &'a EscalationTable,
    pub resource_source: Vec<&'a EscalationTable>,
    pub process: &'a EscalationTable,
}

impl LevelTables<'_> {
    fn find(&self, level: EscalationLevel, failure: &Failure) -> Option<JobIndex> {
        match level {
            EscalationLevel::Office => self.office.find(failure),
            EscalationLevel::ResourceSource => {
                self.resource_source.iter().find_map(|t| t.find(failure))
            }
            EscalationLevel::Process => self.process.find(failure),
            EscalationLevel::Flow | EscalationLevel::Fatal => None,
        }
    }
}

/// Runs the search for `failure` raised by `start`.
///
/// `link` describes each job of the owner chain. `reached` is the thread's
/// current escalation level; only levels above it are tried.
pub(crate) fn resolve<'a, N, F>(
    start: N,
    failure: &Failure,
    mut link: F,
    levels: &LevelTables<'_>,
    reached: EscalationLevel,
) -> Resolution<N>
where
    N: Copy,
    F: FnMut(N) -> ChainLink<'a, N>,
{
    let mut path = Vec::new();
    let mut within_handler = false;
    let mut current = Some(start);
    while let Some(node) = current {
        let view = link(node);
        path.push(node);
        if let Some(handler) = view.table.find(failure) {
            return Resolution::Chain {
                handler,
                path,
                owner: view.owner,
            };
        }
        if view.handler_root {
            within_handler = true;
            break;
        }
        current = view.owner;
    }

    if within_handler {
        return Resolution::Unrecoverable { path };
    }

    for level in reached.remaining() {
        if let Some(handler) = levels.find(level, failure) {
            // The rest of the owner chain is abandoned along with the path.
            let mut current = path.last().and_then(|n| link(*n).owner);
            while let Some(node) = current {
                path.push(node);
                current = link(node).owner;
            }
            return Resolution::Level {
                handler,
                level,
                path,
            };
        }
    }
    Resolution::Fatal { path }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, usize)]) -> EscalationTable {
        let mut table = EscalationTable::new();
        for (kind, job) in entries {
            table.push(FailureKind::new(*kind), JobIndex(*job));
        }
        table
    }

    #[test]
    fn table_prefers_most_specific() {
        let t = table(&[("*", 1), ("io", 2), ("io.read", 3)]);
        assert_eq!(t.find(&Failure::new("io.read.eof", "")), Some(JobIndex(3)));
        assert_eq!(t.find(&Failure::new("io.write", "")), Some(JobIndex(2)));
        assert_eq!(t.find(&Failure::new("db", "")), Some(JobIndex(1)));
    }

    #[test]
    fn table_ties_go_to_first_entry() {
        let t = table(&[("io", 4), ("io", 5)]);
        assert_eq!(t.find(&Failure::new("io", "")), Some(JobIndex(4)));
    }

    #[test]
    fn remaining_levels_are_strictly_above() {
        let levels: Vec<_> = EscalationLevel::Office.remaining().collect();
        assert_eq!(
            levels,
            vec![EscalationLevel::ResourceSource, EscalationLevel::Process]
        );
        assert_eq!(EscalationLevel::Process.remaining().count(), 0);
        assert_eq!(EscalationLevel::Flow.remaining().count(), 3);
    }

    // Owner chain: 0 -> 1 -> 2 (root).
    struct Chain {
        tables: Vec<EscalationTable>,
        handler_root: Vec<bool>,
    }

    impl Chain {
        fn link(&self, n: usize) -> ChainLink<'_, usize> {
            ChainLink {
                table: &self.tables[n],
                owner: if n < 2 { Some(n + 1) } else { None },
                handler_root: self.handler_root[n],
            }
        }
    }

    fn empty_levels(empty: &EscalationTable) -> LevelTables<'_> {
        LevelTables {
            office: empty,
            resource_source: Vec::new(),
            process: empty,
        }
    }

    #[test]
    fn owner_chain_is_walked_nearest_first() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[("io", 7)]), table(&[("*", 8)])],
            handler_root: vec![false; 3],
        };
        let empty = EscalationTable::new();
        let res = resolve(
            0,
            &Failure::new("io", ""),
            |n| chain.link(n),
            &empty_levels(&empty),
            EscalationLevel::Flow,
        );
        assert_eq!(
            res,
            Resolution::Chain {
                handler: JobIndex(7),
                path: vec![0, 1],
                owner: Some(2),
            }
        );
    }

    #[test]
    fn office_level_takes_whole_chain() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[]), table(&[])],
            handler_root: vec![false; 3],
        };
        let office = table(&[("*", 9)]);
        let empty = EscalationTable::new();
        let levels = LevelTables {
            office: &office,
            resource_source: Vec::new(),
            process: &empty,
        };
        let res = resolve(0, &Failure::new("x", ""), |n| chain.link(n), &levels, EscalationLevel::Flow);
        assert_eq!(
            res,
            Resolution::Level {
                handler: JobIndex(9),
                level: EscalationLevel::Office,
                path: vec![0, 1, 2],
            }
        );
    }

    #[test]
    fn reached_level_is_never_retried() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[]), table(&[])],
            handler_root: vec![false; 3],
        };
        let office = table(&[("*", 9)]);
        let process = table(&[("*", 10)]);
        let levels = LevelTables {
            office: &office,
            resource_source: Vec::new(),
            process: &process,
        };
        let res = resolve(
            0,
            &Failure::new("x", ""),
            |n| chain.link(n),
            &levels,
            EscalationLevel::Office,
        );
        assert!(matches!(
            res,
            Resolution::Level { handler: JobIndex(10), level: EscalationLevel::Process, .. }
        ));
    }

    #[test]
    fn resource_source_tables_in_order() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[]), table(&[])],
            handler_root: vec![false; 3],
        };
        let empty = EscalationTable::new();
        let runtime = table(&[("resource", 11)]);
        let declared = table(&[("*", 12)]);
        let levels = LevelTables {
            office: &empty,
            resource_source: vec![&runtime, &declared],
            process: &empty,
        };
        let res = resolve(
            0,
            &Failure::new("resource.load", ""),
            |n| chain.link(n),
            &levels,
            EscalationLevel::Flow,
        );
        assert!(matches!(res, Resolution::Level { handler: JobIndex(11), .. }));
    }

    #[test]
    fn failure_escaping_handler_is_unrecoverable() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[]), table(&[("*", 8)])],
            handler_root: vec![false, true, false],
        };
        let office = table(&[("*", 9)]);
        let empty = EscalationTable::new();
        let levels = LevelTables {
            office: &office,
            resource_source: Vec::new(),
            process: &empty,
        };
        let res = resolve(0, &Failure::new("x", ""), |n| chain.link(n), &levels, EscalationLevel::Flow);
        assert_eq!(res, Resolution::Unrecoverable { path: vec![0, 1] });
    }

    #[test]
    fn nothing_matching_is_fatal() {
        let chain = Chain {
            tables: vec![table(&[]), table(&[]), table(&[])],
            handler_root: vec![false; 3],
        };
        let empty = EscalationTable::new();
        let res = resolve(
            0,
            &Failure::new("x", ""),
            |n| chain.link(n),
            &empty_levels(&empty),
            EscalationLevel::Flow,
        );
        assert_eq!(res, Resolution::Fatal { path: vec![0, 1, 2] });
    }
}
