//! Force-directed layout service: an in-process ForceAtlas2 and a runner for
//! an external layout program.

use crate::config::LayoutServiceParams;
use crate::errors::{DataError, ExternalProcessError};
use anyhow::{Context, Result};
use log::{debug, info};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use sc_types::KnnGraph;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
// keep error messages readable when a JVM dumps a long trace
const MAX_STDERR_CHARS: usize = 2000;

/// Undirected, weighted graph to lay out.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutGraph {
    pub n_nodes: usize,
    /// `(i, j, weight)` with `i < j`, each pair once.
    pub edges: Vec<(usize, usize, f64)>,
}

impl LayoutGraph {
    /// Symmetrized neighbor graph with unit edge weights.
    pub fn from_knn(graph: &KnnGraph) -> Self {
        let mut pairs = BTreeSet::new();
        for i in 0..graph.n_cells() {
            for &j in graph.neighbors(i) {
                if i != j {
                    pairs.insert((i.min(j), i.max(j)));
                }
            }
        }
        LayoutGraph {
            n_nodes: graph.n_cells(),
            edges: pairs.into_iter().map(|(i, j)| (i, j, 1.0)).collect(),
        }
    }
}

/// Limits of one layout run.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutBudget {
    /// Maximum number of iterations.
    pub target_steps: usize,
    /// Stop once the mean displacement per node falls below this.
    pub target_change_per_node: f64,
    /// Memory limit of an external layout process, in GB.
    pub memory_gb: usize,
}

/// Computes a force-directed layout starting from `init`. Implementations
/// return one row per node, in node order.
pub trait ForceLayout: Send + Sync {
    fn layout(&self, graph: &LayoutGraph, init: Array2<f64>, budget: &LayoutBudget) -> Result<Array2<f64>>;
}

/// The layout service selected by the options: an external program when
/// `fle_command` is set, otherwise the in-process layout.
pub fn layout_service(params: &LayoutServiceParams) -> Result<Box<dyn ForceLayout>> {
    Ok(match &params.command {
        Some(command) => Box::new(ExternalForceLayout::new(
            command,
            Duration::from_secs(params.timeout_secs),
        )?),
        None => Box::<ForceAtlas2>::default(),
    })
}

/// Uniform start positions in a square whose side grows with `sqrt(n)`.
pub fn random_init(n: usize, seed: u64) -> Array2<f64> {
    let half = (n as f64).sqrt().max(1.0);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    Array2::from_shape_simple_fn((n, 2), || rng.gen_range(-half..half))
}

fn check_init(graph: &LayoutGraph, init: &Array2<f64>) -> Result<()> {
    if init.nrows() != graph.n_nodes {
        return Err(DataError::new(format!(
            "initial layout has {} rows for a graph of {} nodes",
            init.nrows(),
            graph.n_nodes
        ))
        .into());
    }
    if init.iter().any(|x| !x.is_finite()) {
        return Err(DataError::new("initial layout contains non-finite values").into());
    }
    Ok(())
}

/// ForceAtlas2 with linear attraction, degree-weighted repulsion, gravity
/// toward the origin and adaptive global speed.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceAtlas2 {
    pub scaling_ratio: f64,
    pub gravity: f64,
    pub jitter_tolerance: f64,
}

impl Default for ForceAtlas2 {
    fn default() -> Self {
        ForceAtlas2 {
            scaling_ratio: 2.0,
            gravity: 1.0,
            jitter_tolerance: 1.0,
        }
    }
}

impl ForceAtlas2 {
    fn forces(&self, graph: &LayoutGraph, pos: &Array2<f64>, mass: &[f64]) -> Array2<f64> {
        let (n, dim) = pos.dim();
        let rows: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut f = vec![0.0; dim];
                for j in 0..n {
                    if j == i {
                        continue;
                    }
                    let d2: f64 = (0..dim).map(|d| (pos[[i, d]] - pos[[j, d]]).powi(2)).sum();
                    if d2 > 0.0 {
                        let factor = self.scaling_ratio * mass[i] * mass[j] / d2;
                        for (d, fd) in f.iter_mut().enumerate() {
                            *fd += (pos[[i, d]] - pos[[j, d]]) * factor;
                        }
                    }
                }
                let dist: f64 = (0..dim).map(|d| pos[[i, d]].powi(2)).sum::<f64>().sqrt();
                if dist > 0.0 {
                    let factor = self.gravity * mass[i] / dist;
                    for (d, fd) in f.iter_mut().enumerate() {
                        *fd -= pos[[i, d]] * factor;
                    }
                }
                f
            })
            .collect();

        let mut forces = Array2::zeros((n, dim));
        for (i, row) in rows.into_iter().enumerate() {
            for (d, v) in row.into_iter().enumerate() {
                forces[[i, d]] = v;
            }
        }
        for &(i, j, w) in &graph.edges {
            for d in 0..dim {
                let pull = (pos[[i, d]] - pos[[j, d]]) * w;
                forces[[i, d]] -= pull;
                forces[[j, d]] += pull;
            }
        }
        forces
    }
}

impl ForceLayout for ForceAtlas2 {
    fn layout(&self, graph: &LayoutGraph, mut pos: Array2<f64>, budget: &LayoutBudget) -> Result<Array2<f64>> {
        check_init(graph, &pos)?;
        let (n, dim) = pos.dim();
        if n == 0 || budget.target_steps == 0 {
            return Ok(pos);
        }
        let mut mass = vec![1.0; n];
        for &(i, j, _) in &graph.edges {
            mass[i] += 1.0;
            mass[j] += 1.0;
        }

        let mut previous = Array2::<f64>::zeros((n, dim));
        let (mut speed, mut speed_efficiency) = (1.0f64, 1.0f64);
        let estimated_jitter = 0.05 * (n as f64).sqrt();
        let min_jitter = estimated_jitter.sqrt();
        let min_speed_efficiency = 0.05;

        for step in 0..budget.target_steps {
            let forces = self.forces(graph, &pos, &mass);

            let mut swinging = vec![0.0; n];
            let (mut total_swinging, mut total_traction) = (0.0, 0.0);
            for i in 0..n {
                let (mut swing, mut traction) = (0.0, 0.0);
                for d in 0..dim {
                    swing += (forces[[i, d]] - previous[[i, d]]).powi(2);
                    traction += (forces[[i, d]] + previous[[i, d]]).powi(2);
                }
                swinging[i] = mass[i] * swing.sqrt();
                total_swinging += swinging[i];
                total_traction += mass[i] * traction.sqrt() / 2.0;
            }

            let mut jitter = self.jitter_tolerance
                * min_jitter.max(10f64.min(estimated_jitter * total_traction / (n * n) as f64));
            if total_traction > 0.0 && total_swinging / total_traction > 2.0 {
                if speed_efficiency > min_speed_efficiency {
                    speed_efficiency *= 0.5;
                }
                jitter = jitter.max(self.jitter_tolerance);
            }
            let target_speed = if total_swinging > 0.0 {
                jitter * speed_efficiency * total_traction / total_swinging
            } else {
                speed
            };
            if total_swinging > jitter * total_traction {
                if speed_efficiency > min_speed_efficiency {
                    speed_efficiency *= 0.7;
                }
            } else if speed < 1000.0 {
                speed_efficiency *= 1.3;
            }
            speed += (target_speed - speed).min(0.5 * speed);

            let mut moved = 0.0;
            for i in 0..n {
                let factor = speed / (1.0 + (speed * swinging[i]).sqrt());
                let mut step_len = 0.0;
                for d in 0..dim {
                    let delta = forces[[i, d]] * factor;
                    pos[[i, d]] += delta;
                    step_len += delta * delta;
                }
                moved += step_len.sqrt();
            }
            previous = forces;

            let change = moved / n as f64;
            if step % 100 == 99 {
                debug!("layout step {}: mean change {change:.4}", step + 1);
            }
            if change < budget.target_change_per_node {
                debug!("layout converged after {} steps", step + 1);
                break;
            }
        }
        Ok(pos)
    }
}

/// Runs an external layout program with a memory limit and a wall-clock
/// timeout. The program is invoked as
/// `<command> --graph G --coords C --output O --steps S --target-change T --memory Mg`
/// where `G` is a tab-separated edge list `i j weight`, `C` holds the start
/// positions and `O` must receive the final positions, one tab-separated row
/// per node. `JAVA_TOOL_OPTIONS=-XmxMg` is set for JVM-based programs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalForceLayout {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalForceLayout {
    /// `command` is split on whitespace into the program and its leading arguments.
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        let mut words = command.split_whitespace().map(String::from);
        let program = words
            .next()
            .with_context(|| format!("layout command '{command}' is empty"))?;
        Ok(ExternalForceLayout {
            program,
            args: words.collect(),
            timeout,
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn bad_output(&self, reason: impl ToString) -> ExternalProcessError {
        ExternalProcessError::BadOutput {
            command: self.command_line(),
            reason: reason.to_string(),
        }
    }

    fn read_positions(&self, path: &Path, n: usize, dim: usize) -> Result<Array2<f64>, ExternalProcessError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(path)
            .map_err(|e| self.bad_output(e))?;
        let mut values = Vec::with_capacity(n * dim);
        let mut rows = 0;
        for record in reader.records() {
            let record = record.map_err(|e| self.bad_output(e))?;
            if record.len() != dim {
                return Err(self.bad_output(format!(
                    "row {rows} has {} columns, expected {dim}",
                    record.len()
                )));
            }
            for field in record.iter() {
                let v: f64 = field
                    .trim()
                    .parse()
                    .map_err(|_| self.bad_output(format!("'{field}' in row {rows} is not a number")))?;
                if !v.is_finite() {
                    return Err(self.bad_output(format!("row {rows} holds a non-finite value")));
                }
                values.push(v);
            }
            rows += 1;
        }
        if rows != n {
            return Err(self.bad_output(format!("{rows} rows for {n} nodes")));
        }
        Array2::from_shape_vec((n, dim), values).map_err(|e| self.bad_output(e))
    }
}

fn write_tsv<I, R>(path: &Path, rows: I) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = String>,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

impl ForceLayout for ExternalForceLayout {
    fn layout(&self, graph: &LayoutGraph, init: Array2<f64>, budget: &LayoutBudget) -> Result<Array2<f64>> {
        check_init(graph, &init)?;
        let (n, dim) = init.dim();
        let dir = tempfile::tempdir().context("creating a scratch directory for the layout")?;
        let graph_path = dir.path().join("graph.tsv");
        let coords_path = dir.path().join("coords.tsv");
        let output_path = dir.path().join("layout.tsv");
        let stderr_path = dir.path().join("stderr.log");

        write_tsv(
            &graph_path,
            graph
                .edges
                .iter()
                .map(|&(i, j, w)| [i.to_string(), j.to_string(), w.to_string()]),
        )?;
        write_tsv(
            &coords_path,
            init.rows()
                .into_iter()
                .map(|row| row.iter().map(f64::to_string).collect::<Vec<_>>()),
        )?;
        let stderr_file = File::create(&stderr_path)
            .with_context(|| format!("creating {}", stderr_path.display()))?;

        let memory = format!("{}g", budget.memory_gb);
        let command = self.command_line();
        info!("running {command} on {n} nodes with {memory} of memory");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--graph")
            .arg(&graph_path)
            .arg("--coords")
            .arg(&coords_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--steps")
            .arg(budget.target_steps.to_string())
            .arg("--target-change")
            .arg(budget.target_change_per_node.to_string())
            .arg("--memory")
            .arg(&memory)
            .env("JAVA_TOOL_OPTIONS", format!("-Xmx{memory}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| ExternalProcessError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= self.timeout => {
                    // the child may exit between the poll and the kill
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExternalProcessError::Timeout {
                        command,
                        secs: self.timeout.as_secs(),
                    }
                    .into());
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(ExternalProcessError::Spawn {
                        command,
                        reason: format!("waiting for the process failed: {e}"),
                    }
                    .into())
                }
            }
        };

        if !status.success() {
            let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
            let stderr = stderr.trim();
            let skip = stderr.chars().count().saturating_sub(MAX_STDERR_CHARS);
            return Err(ExternalProcessError::Exited {
                command,
                status: status.to_string(),
                stderr: stderr.chars().skip(skip).collect(),
            }
            .into());
        }
        Ok(self.read_positions(&output_path, n, dim)?)
    }
}
