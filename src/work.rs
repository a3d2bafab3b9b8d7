//! The scheduler: computes which vertices reachable from a target are stale,
//! then hands them to pull-based workers in dependency order.
//!
//! Readiness is count-driven: each vertex tracks how many of its
//! dependencies are not yet done, and completion of a dependency decrements
//! the count.  Vertices with no path between them may therefore run
//! concurrently regardless of the order the traversal discovered them.

use crate::densemap::DenseMap;
use crate::graph::{Graph, VertexId};
use crate::version::{Oracle, Version};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Construction found a dependency cycle; no schedule is produced.
#[derive(Debug)]
pub struct CycleError {
    /// Some vertex on the cycle.
    pub name: String,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency cycle through {:?}", self.name)
    }
}
impl std::error::Error for CycleError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexState {
    /// Waiting on at least one dependency.  Also the resting state of
    /// vertices the target doesn't reach.
    Blocked,
    /// All dependencies done and the vertex is stale: dispatchable.
    Ready,
    /// Handed to a worker, not yet reported back.
    InProgress,
    /// Complete, whether by a finished action or by pass-through.
    Done,
    /// Its action failed; set alongside the run's sticky error flag.
    Failed,
}

/// One failed action: the vertex and the tool output it produced.
#[derive(Debug)]
pub struct Failure {
    pub vertex: VertexId,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Schedule {
    reachable: bool,
    stale: bool,
    /// Dependencies not yet done.
    remaining: usize,
    state: VertexState,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            reachable: false,
            stale: false,
            remaining: 0,
            state: VertexState::Blocked,
        }
    }
}

#[derive(Debug)]
struct WorkState {
    sched: DenseMap<VertexId, Schedule>,
    ready: VecDeque<VertexId>,
    /// Reachable vertices not yet done or failed; zero means drained.
    incomplete: usize,
    /// Actions completed successfully, for the run summary.
    ran: usize,
    /// Sticky error flag; once set, nothing further becomes ready.
    failed: bool,
    first_failure: Option<Failure>,
}

impl WorkState {
    /// A vertex's last dependency has settled: dispatch it if stale,
    /// otherwise complete it immediately (pass-through).
    fn settle(&mut self, graph: &Graph, id: VertexId) {
        if self.sched[id].stale {
            self.sched[id].state = VertexState::Ready;
            self.ready.push_back(id);
        } else {
            self.complete(graph, id);
        }
    }

    /// Record a vertex done and cascade to its dependents.  After the error
    /// flag is set, completions are still recorded but nothing new settles.
    fn complete(&mut self, graph: &Graph, id: VertexId) {
        self.sched[id].state = VertexState::Done;
        self.incomplete -= 1;
        if self.failed {
            return;
        }
        for &dependent in graph.dependents(id) {
            let sched = &mut self.sched[dependent];
            if !sched.reachable || sched.state != VertexState::Blocked {
                continue;
            }
            sched.remaining -= 1;
            if sched.remaining == 0 {
                self.settle(graph, dependent);
            }
        }
    }
}

#[derive(Debug)]
pub struct Work<'a> {
    graph: &'a Graph,
    state: Mutex<WorkState>,
    cond: Condvar,
    /// The stale reachable set, in dependency-before-dependent order;
    /// fixed at construction.
    updated: Vec<VertexId>,
}

#[derive(Copy, Clone, PartialEq)]
enum Visit {
    None,
    InStack,
    Done,
}

/// Post-order traversal over dependency edges, computing versions and
/// staleness as it returns.  A vertex revisited while still on the stack is
/// a cycle.
fn visit(
    graph: &Graph,
    oracle: &Oracle,
    id: VertexId,
    visits: &mut DenseMap<VertexId, Visit>,
    versions: &mut DenseMap<VertexId, Version>,
    sched: &mut DenseMap<VertexId, Schedule>,
    order: &mut Vec<VertexId>,
) -> anyhow::Result<()> {
    match visits[id] {
        Visit::Done => return Ok(()),
        Visit::InStack => {
            return Err(CycleError {
                name: graph.vertex(id).name.clone(),
            }
            .into())
        }
        Visit::None => {}
    }
    visits[id] = Visit::InStack;

    let version = oracle.version(graph, id)?;
    let mut dep_stale = false;
    let mut newest_dep = Version::Missing;
    for &dep in graph.deps(id) {
        visit(graph, oracle, dep, visits, versions, sched, order)?;
        dep_stale = dep_stale || sched[dep].stale;
        newest_dep = newest_dep.max(versions[dep]);
    }

    // Staleness propagates through stale dependencies: a dependency about
    // to be rebuilt will come out newer than this vertex is now.
    let stale = graph.vertex(id).kind.produces_action()
        && (version == Version::Missing || dep_stale || newest_dep > version);

    versions[id] = version;
    sched[id] = Schedule {
        reachable: true,
        stale,
        remaining: graph.deps(id).len(),
        state: VertexState::Blocked,
    };
    order.push(id);
    visits[id] = Visit::Done;
    Ok(())
}

impl<'a> Work<'a> {
    /// Walk backward from `target`, version every reachable vertex through
    /// the oracle, and seed the ready set.  Fails on a dependency cycle or
    /// an oracle error, producing no schedule.
    pub fn new(graph: &'a Graph, target: VertexId, oracle: &Oracle) -> anyhow::Result<Work<'a>> {
        let end = graph.next_id();
        let mut visits = DenseMap::new_sized(end, Visit::None);
        let mut versions = DenseMap::new_sized(end, Version::Missing);
        let mut sched = DenseMap::new_sized(end, Schedule::default());
        let mut order = Vec::new();
        visit(
            graph,
            oracle,
            target,
            &mut visits,
            &mut versions,
            &mut sched,
            &mut order,
        )?;

        let updated: Vec<VertexId> = order.iter().copied().filter(|&id| sched[id].stale).collect();

        let mut state = WorkState {
            sched,
            ready: VecDeque::new(),
            incomplete: order.len(),
            ran: 0,
            failed: false,
            first_failure: None,
        };
        // Leaves settle now; everything else settles off the cascade.
        for &id in &order {
            if state.sched[id].remaining == 0 && state.sched[id].state == VertexState::Blocked {
                state.settle(graph, id);
            }
        }

        Ok(Work {
            graph,
            state: Mutex::new(state),
            cond: Condvar::new(),
            updated,
        })
    }

    /// Pop one ready vertex and move it in-progress.  `None` means stop: the
    /// run is drained or the error flag is set.  With `block`, waits for one
    /// of those conditions; without, returns immediately.
    ///
    /// Each ready vertex is delivered to exactly one caller, and never
    /// before all of its dependencies are done.
    pub fn get_item(&self, block: bool) -> Option<VertexId> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.failed {
                return None;
            }
            if let Some(id) = state.ready.pop_front() {
                state.sched[id].state = VertexState::InProgress;
                return Some(id);
            }
            if state.incomplete == 0 || !block {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Report an in-progress vertex complete, unblocking dependents whose
    /// last dependency this was.
    pub fn mark_done(&self, id: VertexId) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.sched[id].state, VertexState::InProgress);
        state.ran += 1;
        state.complete(self.graph, id);
        self.cond.notify_all();
    }

    /// Report an in-progress vertex failed.  The first report latches the
    /// sticky error flag and is kept for the aggregate run failure; every
    /// blocked get_item call wakes up and drains.
    pub fn mark_error(&self, id: VertexId, output: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.sched[id].state, VertexState::InProgress);
        state.sched[id].state = VertexState::Failed;
        state.incomplete -= 1;
        if !state.failed {
            state.failed = true;
            state.first_failure = Some(Failure { vertex: id, output });
        }
        self.cond.notify_all();
    }

    /// The reachable stale set as computed at construction; the same
    /// computation the execution path dispatches from, so a dry run and a
    /// real run agree against identical on-disk state.
    pub fn get_updated(&self) -> &[VertexId] {
        &self.updated
    }

    /// Count of successfully completed actions.
    pub fn tasks_run(&self) -> usize {
        self.state.lock().unwrap().ran
    }

    pub fn take_failure(&self) -> Option<Failure> {
        self.state.lock().unwrap().first_failure.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envstore::EnvStore;
    use crate::graph::VertexKind;
    use filetime::{set_file_mtime, FileTime};
    use std::sync::Mutex;

    /// A scratch directory of real files, since the oracle stats ground
    /// truth.  Mtimes are set explicitly; stamps are milliseconds.
    struct Space {
        dir: tempfile::TempDir,
    }

    impl Space {
        fn new() -> Space {
            Space {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_str().unwrap().to_string()
        }

        fn file(&self, name: &str, mtime_ms: u64) -> String {
            let path = self.path(name);
            std::fs::write(&path, name).unwrap();
            self.set_mtime(&path, mtime_ms);
            path
        }

        fn set_mtime(&self, path: &str, mtime_ms: u64) {
            let ft = FileTime::from_unix_time(
                (mtime_ms / 1000) as i64,
                ((mtime_ms % 1000) * 1_000_000) as u32,
            );
            set_file_mtime(path, ft).unwrap();
        }

        fn env(&self) -> EnvStore {
            EnvStore::load(self.dir.path().join(".env_vars")).unwrap()
        }
    }

    /// A miniature project: h.h and a.c files, an a.o artifact, and a
    /// lib.a final output.
    struct Scenario {
        graph: Graph,
        h: String,
        obj: VertexId,
        lib: VertexId,
    }

    fn scenario(space: &Space) -> Scenario {
        let mut graph = Graph::new();
        let h = space.file("h.h", 1_000);
        let c = space.file("a.c", 2_000);
        let h_id = graph.add_vertex(&h, VertexKind::File).unwrap();
        let c_id = graph.add_vertex(&c, VertexKind::File).unwrap();
        let obj = graph
            .add_vertex(&space.path("a.o"), VertexKind::Artifact)
            .unwrap();
        graph.add_edge(obj, c_id);
        graph.add_edge(obj, h_id);
        let lib = graph
            .add_vertex(&space.path("lib.a"), VertexKind::FinalOutput)
            .unwrap();
        graph.add_edge(lib, obj);
        Scenario { graph, h, obj, lib }
    }

    fn names(graph: &Graph, ids: &[VertexId]) -> Vec<String> {
        ids.iter().map(|&id| graph.vertex(id).name.clone()).collect()
    }

    #[test]
    fn fresh_build_wants_artifact_and_output() {
        let space = Space::new();
        let s = scenario(&space);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&s.graph, s.lib, &oracle).unwrap();
        assert_eq!(work.get_updated(), &[s.obj, s.lib]);
    }

    #[test]
    fn up_to_date_build_is_empty_and_drained() {
        let space = Space::new();
        let s = scenario(&space);
        space.file("a.o", 3_000);
        space.file("lib.a", 4_000);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&s.graph, s.lib, &oracle).unwrap();
        assert!(work.get_updated().is_empty());
        // Everything passed through at construction; a blocking pull
        // returns the stop sentinel instead of hanging.
        assert_eq!(work.get_item(true), None);
        assert_eq!(work.tasks_run(), 0);
    }

    #[test]
    fn touching_header_invalidates_the_path_to_target() {
        let space = Space::new();
        let s = scenario(&space);
        space.file("a.o", 3_000);
        space.file("lib.a", 4_000);
        // lib.a's own dependency a.o is older than lib.a; staleness must
        // flow through the stale a.o, not from direct comparison.
        space.set_mtime(&s.h, 5_000);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&s.graph, s.lib, &oracle).unwrap();
        assert_eq!(work.get_updated(), &[s.obj, s.lib]);
    }

    #[test]
    fn touching_nothing_on_the_path_marks_nothing() {
        let space = Space::new();
        let s = scenario(&space);
        space.file("a.o", 3_000);
        space.file("lib.a", 4_000);
        // A file outside the reachable set.
        let mut graph = s.graph;
        let stray = space.file("stray.h", 9_000);
        graph.add_vertex(&stray, VertexKind::File).unwrap();
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&graph, s.lib, &oracle).unwrap();
        assert!(work.get_updated().is_empty());
    }

    #[test]
    fn delivery_respects_dependency_order() {
        let space = Space::new();
        let s = scenario(&space);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&s.graph, s.lib, &oracle).unwrap();

        let first = work.get_item(false).unwrap();
        assert_eq!(first, s.obj);
        // lib.a can't be delivered while a.o is in progress.
        assert_eq!(work.get_item(false), None);
        work.mark_done(first);

        let second = work.get_item(false).unwrap();
        assert_eq!(second, s.lib);
        work.mark_done(second);

        assert_eq!(work.get_item(true), None);
        assert_eq!(work.tasks_run(), 2);
    }

    #[test]
    fn environment_entry_change_invalidates_dependents() {
        let space = Space::new();
        let mut env = space.env();
        let v0 = env.set("cc", "gcc").unwrap();
        assert_eq!(v0, Version::Stamp(0));

        let mut graph = Graph::new();
        let c = space.file("a.c", 1_000);
        let c_id = graph.add_vertex(&c, VertexKind::File).unwrap();
        let obj_name = space.file("a.o", 2_000);
        let obj = graph.add_vertex(&obj_name, VertexKind::Artifact).unwrap();
        let cc = graph
            .add_vertex(&EnvStore::vertex_name("cc"), VertexKind::EnvEntry)
            .unwrap();
        graph.add_edge(obj, c_id);
        graph.add_edge(obj, cc);

        // Unchanged entry at version 0: nothing stale.
        {
            let oracle = Oracle::new(&env);
            let work = Work::new(&graph, obj, &oracle).unwrap();
            assert!(work.get_updated().is_empty());
        }

        // Switching compilers bumps the version past the artifact's stamp.
        let v1 = env.set("cc", "clang").unwrap();
        assert!(v1 > v0);
        {
            let oracle = Oracle::new(&env);
            let work = Work::new(&graph, obj, &oracle).unwrap();
            assert_eq!(work.get_updated(), &[obj]);
        }

        // Re-setting the same value keeps the version: after a rebuild the
        // artifact stays clean.
        assert_eq!(env.set("cc", "clang").unwrap(), v1);
        let rebuilt = crate::version::now_ms() + 60_000;
        space.set_mtime(&obj_name, rebuilt);
        {
            let oracle = Oracle::new(&env);
            let work = Work::new(&graph, obj, &oracle).unwrap();
            assert!(work.get_updated().is_empty());
        }
    }

    #[test]
    fn absent_directory_is_created_and_present_never_invalidates() {
        let space = Space::new();
        let mut graph = Graph::new();
        let c = space.file("a.c", 1_000);
        let c_id = graph.add_vertex(&c, VertexKind::File).unwrap();
        let out = space.path("out");
        let out_id = graph.add_vertex(&out, VertexKind::Directory).unwrap();
        let obj = graph
            .add_vertex(&space.path("out/a.o"), VertexKind::Artifact)
            .unwrap();
        graph.add_edge(obj, out_id);
        graph.add_edge(obj, c_id);

        let env = space.env();
        // Absent: the directory itself needs making.
        {
            let oracle = Oracle::new(&env);
            let work = Work::new(&graph, obj, &oracle).unwrap();
            assert_eq!(names(&graph, work.get_updated()), vec![out.clone(), space.path("out/a.o")]);
        }
        // Present: it stamps 0 and the up-to-date artifact stays clean.
        std::fs::create_dir(&out).unwrap();
        space.file("out/a.o", 2_000);
        {
            let oracle = Oracle::new(&env);
            let work = Work::new(&graph, obj, &oracle).unwrap();
            assert!(work.get_updated().is_empty());
        }
    }

    #[test]
    fn cycle_is_fatal_at_construction() {
        let space = Space::new();
        let mut graph = Graph::new();
        let a = graph
            .add_vertex(&space.path("a.o"), VertexKind::Artifact)
            .unwrap();
        let b = graph
            .add_vertex(&space.path("b.o"), VertexKind::Artifact)
            .unwrap();
        graph.add_edge(a, b);
        graph.add_edge(b, a);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let err = Work::new(&graph, a, &oracle).unwrap_err();
        assert!(err.downcast_ref::<CycleError>().is_some());
    }

    #[test]
    fn exactly_once_delivery_under_concurrency() {
        let space = Space::new();
        let mut graph = Graph::new();
        let c = space.file("a.c", 1_000);
        let c_id = graph.add_vertex(&c, VertexKind::File).unwrap();
        let lib = graph
            .add_vertex(&space.path("lib.a"), VertexKind::FinalOutput)
            .unwrap();
        let mut objs = Vec::new();
        for i in 0..24 {
            let obj = graph
                .add_vertex(&space.path(&format!("{}.o", i)), VertexKind::Artifact)
                .unwrap();
            graph.add_edge(obj, c_id);
            graph.add_edge(lib, obj);
            objs.push(obj);
        }
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&graph, lib, &oracle).unwrap();

        let delivered = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(id) = work.get_item(true) {
                        delivered.lock().unwrap().push(id);
                        work.mark_done(id);
                    }
                });
            }
        });

        let delivered = delivered.into_inner().unwrap();
        assert_eq!(delivered.len(), objs.len() + 1);
        let mut unique = delivered.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), delivered.len());
        // The output depends on every object, so it must come out last.
        assert_eq!(*delivered.last().unwrap(), lib);
        assert_eq!(work.tasks_run(), objs.len() + 1);
    }

    #[test]
    fn failure_is_fail_fast_but_in_flight_work_finishes() {
        // B is a dependency of A and C; D is independent of B.
        let space = Space::new();
        let mut graph = Graph::new();
        let src = space.file("a.c", 1_000);
        let src_id = graph.add_vertex(&src, VertexKind::File).unwrap();
        let b = graph
            .add_vertex(&space.path("b.o"), VertexKind::Artifact)
            .unwrap();
        let a = graph
            .add_vertex(&space.path("a.o"), VertexKind::Artifact)
            .unwrap();
        let c = graph
            .add_vertex(&space.path("c.o"), VertexKind::Artifact)
            .unwrap();
        let d = graph
            .add_vertex(&space.path("d.o"), VertexKind::Artifact)
            .unwrap();
        let lib = graph
            .add_vertex(&space.path("lib.a"), VertexKind::FinalOutput)
            .unwrap();
        graph.add_edge(b, src_id);
        graph.add_edge(d, src_id);
        graph.add_edge(a, b);
        graph.add_edge(c, b);
        for &obj in &[a, c, d] {
            graph.add_edge(lib, obj);
        }

        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&graph, lib, &oracle).unwrap();

        // Both roots are ready; pull them as two in-flight workers would.
        let first = work.get_item(true).unwrap();
        let second = work.get_item(true).unwrap();
        let mut roots = vec![first, second];
        roots.sort();
        let mut want = vec![b, d];
        want.sort();
        assert_eq!(roots, want);

        work.mark_error(b, b"b.o: boom".to_vec());
        // The in-flight independent vertex still completes.
        work.mark_done(d);
        // But nothing further is ever delivered, blocked or not.
        assert_eq!(work.get_item(true), None);
        assert_eq!(work.tasks_run(), 1);

        let failure = work.take_failure().unwrap();
        assert_eq!(failure.vertex, b);
        assert_eq!(failure.output, b"b.o: boom");
    }

    #[test]
    fn first_failure_wins() {
        let space = Space::new();
        let mut graph = Graph::new();
        let a = graph
            .add_vertex(&space.path("a.o"), VertexKind::Artifact)
            .unwrap();
        let b = graph
            .add_vertex(&space.path("b.o"), VertexKind::Artifact)
            .unwrap();
        let lib = graph
            .add_vertex(&space.path("lib.a"), VertexKind::FinalOutput)
            .unwrap();
        graph.add_edge(lib, a);
        graph.add_edge(lib, b);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&graph, lib, &oracle).unwrap();

        let first = work.get_item(true).unwrap();
        let second = work.get_item(true).unwrap();
        work.mark_error(first, b"first".to_vec());
        work.mark_error(second, b"second".to_vec());
        assert_eq!(work.take_failure().unwrap().vertex, first);
    }

    #[test]
    fn blocked_pull_wakes_on_error() {
        let space = Space::new();
        let mut graph = Graph::new();
        let a = graph
            .add_vertex(&space.path("a.o"), VertexKind::Artifact)
            .unwrap();
        let lib = graph
            .add_vertex(&space.path("lib.a"), VertexKind::FinalOutput)
            .unwrap();
        graph.add_edge(lib, a);
        let env = space.env();
        let oracle = Oracle::new(&env);
        let work = Work::new(&graph, lib, &oracle).unwrap();

        let id = work.get_item(true).unwrap();
        assert_eq!(id, a);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| work.get_item(true));
            work.mark_error(a, Vec::new());
            assert_eq!(waiter.join().unwrap(), None);
        });
    }
}
