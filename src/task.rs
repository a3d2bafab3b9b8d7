//! Runs the build action behind a single vertex: creating an output
//! directory, compiling one source file, or archiving the final output.
//! Unaware of scheduling; workers call in here and report the result back.

use crate::graph::{Graph, Vertex, VertexId, VertexKind};
use anyhow::{anyhow, bail};
use std::io::Write;
use std::process::Command;

/// The result of executing one build action.
pub struct TaskResult {
    pub success: bool,
    /// Combined stdout/stderr of the tool.
    pub output: Vec<u8>,
}

impl TaskResult {
    fn ok() -> TaskResult {
        TaskResult {
            success: true,
            output: Vec::new(),
        }
    }
}

/// Invocation-wide inputs the actions need.
pub struct TaskContext<'a> {
    pub cc: &'a str,
    pub include_dir: &'a str,
}

/// Short console message for a vertex's action.
pub fn describe(graph: &Graph, id: VertexId) -> String {
    let vertex = graph.vertex(id);
    match vertex.kind {
        VertexKind::Directory => format!("mkdir {}", vertex.name),
        VertexKind::Artifact => format!("cc {}", vertex.name),
        VertexKind::FinalOutput => format!("ar {}", vertex.name),
        _ => vertex.name.clone(),
    }
}

/// Execute the action for a vertex.  Returns Err only when something went
/// wrong outside the tool itself; a failing tool is a TaskResult.
pub fn run_task(graph: &Graph, id: VertexId, ctx: &TaskContext) -> anyhow::Result<TaskResult> {
    let vertex = graph.vertex(id);
    match vertex.kind {
        VertexKind::Directory => {
            std::fs::create_dir_all(&vertex.name)?;
            Ok(TaskResult::ok())
        }
        VertexKind::Artifact => compile(graph, id, ctx),
        VertexKind::FinalOutput => archive(graph, id),
        kind => Err(anyhow!(
            "dispatcher bug: {} of kind {:?} has no action",
            vertex.name,
            kind
        )),
    }
}

/// Compile the vertex's single C source predecessor into the object file.
fn compile(graph: &Graph, id: VertexId, ctx: &TaskContext) -> anyhow::Result<TaskResult> {
    let obj = &graph.vertex(id).name;
    let src = deps_of_kind(graph, id, VertexKind::File)
        .find(|v| v.name.ends_with(".c"))
        .ok_or_else(|| anyhow!("{}: no C source among dependencies", obj))?;
    let tmp = format!("{}.tmp", obj);
    let include = format!("-I{}", ctx.include_dir);
    let result = run_tool(Command::new(ctx.cc).args([
        "-c",
        "-o",
        tmp.as_str(),
        src.name.as_str(),
        "-O2",
        include.as_str(),
    ]))?;
    commit(&tmp, obj, result)
}

/// Archive every artifact predecessor into the final output.
fn archive(graph: &Graph, id: VertexId) -> anyhow::Result<TaskResult> {
    let out = &graph.vertex(id).name;
    let objs: Vec<&str> = deps_of_kind(graph, id, VertexKind::Artifact)
        .map(|v| v.name.as_str())
        .collect();
    if objs.is_empty() {
        bail!("{}: no artifacts to archive", out);
    }
    let tmp = format!("{}.tmp", out);
    // `ar r` updates in place; a stale temp archive would keep dead members.
    let _ = std::fs::remove_file(&tmp);
    let result = run_tool(Command::new("ar").arg("rcs").arg(&tmp).args(&objs))?;
    commit(&tmp, out, result)
}

fn deps_of_kind<'a>(
    graph: &'a Graph,
    id: VertexId,
    kind: VertexKind,
) -> impl Iterator<Item = &'a Vertex> {
    graph
        .deps(id)
        .iter()
        .map(move |&dep| graph.vertex(dep))
        .filter(move |v| v.kind == kind)
}

/// Output lands under a temp name; only a successful tool run publishes it.
fn commit(tmp: &str, out: &str, result: TaskResult) -> anyhow::Result<TaskResult> {
    if result.success {
        std::fs::rename(tmp, out).map_err(|err| anyhow!("rename {} -> {}: {}", tmp, out, err))?;
    } else {
        let _ = std::fs::remove_file(tmp);
    }
    Ok(result)
}

fn run_tool(cmd: &mut Command) -> anyhow::Result<TaskResult> {
    let out = cmd.output()?;
    let mut output = Vec::new();
    output.extend_from_slice(&out.stdout);
    output.extend_from_slice(&out.stderr);
    let success = out.status.success();
    #[cfg(unix)]
    if !success {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = out.status.signal() {
            match sig {
                libc::SIGINT => write!(output, "interrupted").unwrap(),
                _ => write!(output, "signal {}", sig).unwrap(),
            }
        }
    }
    Ok(TaskResult { success, output })
}
