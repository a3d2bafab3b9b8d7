//! Drives one build invocation end to end: load the environment store,
//! discover sources, extract dependencies, build the graph, then run
//! pull-based workers against the scheduler.

use crate::deps;
use crate::envstore::EnvStore;
use crate::graph::{Graph, VertexId, VertexKind};
use crate::progress::ConsoleProgress;
use crate::task::{self, TaskContext, TaskResult};
use crate::version::Oracle;
use crate::work::Work;
use anyhow::bail;
use rayon::prelude::*;

const ENV_DIR: &str = ".env_vars";
const SRC_DIR: &str = "src";
const INCLUDE_DIR: &str = "inc";
const OUT_DIR: &str = "out";

pub struct Options {
    pub parallelism: usize,
    pub verbose: bool,
    /// Compiler override; persisted to the environment store, so switching
    /// compilers invalidates everything built with the old one.
    pub cc: Option<String>,
    /// Path of the final archive.
    pub output: String,
    /// Pseudo-target "print" lists stale vertices without building.
    pub targets: Vec<String>,
}

/// List regular files under `dir` with the given suffix, sorted for a
/// deterministic graph.  A missing directory is just empty.
fn discover(dir: &str, suffix: &str) -> anyhow::Result<Vec<String>> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(err) => bail!("read {}: {}", dir, err),
    };
    for entry in entries {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.ends_with(suffix) && entry.file_type()?.is_file() {
            found.push(format!("{}/{}", dir, name));
        }
    }
    found.sort();
    Ok(found)
}

/// Build the full graph for one invocation: an output directory, one
/// artifact per source fed by its extracted dependency closure, the final
/// archive over all artifacts, and the compiler entry feeding everything
/// compiled.
fn build_graph(cc: &str, opts: &Options) -> anyhow::Result<(Graph, VertexId)> {
    let sources = discover(SRC_DIR, ".c")?;
    if sources.is_empty() {
        bail!("no C sources under {}/", SRC_DIR);
    }
    let headers = discover(INCLUDE_DIR, ".h")?;

    // Extraction is read-only, so all sources run in parallel.
    let quiet = !opts.verbose;
    let extracted = sources
        .par_iter()
        .map(|src| deps::extract(src, INCLUDE_DIR, quiet, cc))
        .collect::<Result<Vec<_>, _>>()?;

    let mut graph = Graph::new();
    let out_dir = graph.add_vertex(OUT_DIR, VertexKind::Directory)?;
    let finale = graph.add_vertex(&opts.output, VertexKind::FinalOutput)?;
    let cc_entry = graph.add_vertex(&EnvStore::vertex_name("cc"), VertexKind::EnvEntry)?;
    graph.add_edge(finale, cc_entry);
    for header in &headers {
        graph.add_vertex(header, VertexKind::File)?;
    }
    for (source, rule) in sources.iter().zip(&extracted) {
        graph.add_vertex(source, VertexKind::File)?;
        let obj = graph.add_vertex(
            &format!("{}/{}", OUT_DIR, rule.target),
            VertexKind::Artifact,
        )?;
        graph.add_edge(obj, out_dir);
        for dep in &rule.deps {
            // The rule lists the source itself plus every reachable header.
            let dep_id = graph.add_vertex(dep, VertexKind::File)?;
            graph.add_edge(obj, dep_id);
        }
        graph.add_edge(obj, cc_entry);
        graph.add_edge(finale, obj);
    }
    Ok((graph, finale))
}

fn worker(graph: &Graph, work: &Work, ctx: &TaskContext, progress: &ConsoleProgress) {
    while let Some(id) = work.get_item(true) {
        let msg = task::describe(graph, id);
        progress.task_started(&msg);
        let result = task::run_task(graph, id, ctx).unwrap_or_else(|err| TaskResult {
            success: false,
            output: err.to_string().into_bytes(),
        });
        progress.task_finished(&msg, &result);
        if result.success {
            work.mark_done(id);
        } else {
            work.mark_error(id, result.output);
        }
    }
}

/// Run one build; returns the process exit code.
pub fn run(opts: Options) -> anyhow::Result<i32> {
    let mut env = EnvStore::load(ENV_DIR)?;
    let cc = match &opts.cc {
        Some(cc) => {
            env.set("cc", cc)?;
            cc.clone()
        }
        None => match env.get("cc") {
            Some(cc) => cc.to_string(),
            None => {
                env.set("cc", "gcc")?;
                "gcc".to_string()
            }
        },
    };

    let (graph, target) = build_graph(&cc, &opts)?;
    let oracle = Oracle::new(&env);
    let work = Work::new(&graph, target, &oracle)?;

    if opts.targets.iter().any(|t| t == "print") {
        for &id in work.get_updated() {
            println!("{}", graph.vertex(id).name);
        }
        return Ok(0);
    }

    let progress = ConsoleProgress::new(opts.verbose);
    let ctx = TaskContext {
        cc: &cc,
        include_dir: INCLUDE_DIR,
    };
    std::thread::scope(|scope| {
        for _ in 0..opts.parallelism.max(1) {
            scope.spawn(|| worker(&graph, &work, &ctx, &progress));
        }
    });

    if let Some(failure) = work.take_failure() {
        // The worker already printed the tool output.
        progress.log(&format!(
            "buildo: build of {} failed",
            graph.vertex(failure.vertex).name
        ));
        return Ok(1);
    }
    match work.tasks_run() {
        0 => progress.log("buildo: no work to do"),
        n => progress.log(&format!("buildo: ran {} tasks, now up to date", n)),
    }
    Ok(0)
}
