//! Stage scheduling: resolve the dependencies of the enabled stages into an
//! execution order, then run the stages one at a time.

use crate::errors::PipelineError;
use crate::registry::{Field, Requirement, StageKind, StageRequest};
use itertools::Itertools;
use log::{error, info, warn};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use sc_types::Dataset;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::time::Instant;
use strum::IntoEnumIterator;

/// A stage that could not use its preferred basis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub stage: StageKind,
    pub preferred: &'static str,
    pub used: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub kind: StageKind,
    /// The basis the stage reads, after fallbacks.
    pub basis: Option<&'static str>,
    /// Enabled stages this one must wait for.
    pub upstream: Vec<StageKind>,
}

/// Validated execution order of the enabled stages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub stages: Vec<PlannedStage>,
    pub fallbacks: Vec<Fallback>,
}

impl Plan {
    pub fn order(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&PlannedStage> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}

/// Order `requests` so that every stage runs after the producers of its inputs.
///
/// `available` lists the fields already present in the dataset. An input
/// that is neither available nor produced by an enabled stage, or a
/// dependency cycle, is a configuration error.
pub fn plan(requests: &[StageRequest<'_>], available: &HashSet<Field>) -> Result<Plan, PipelineError> {
    let mut seen = HashSet::new();
    let mut producers: HashMap<Field, usize> = HashMap::new();
    for (i, request) in requests.iter().enumerate() {
        let name = request.spec.name();
        if !seen.insert(request.spec.kind) {
            return Err(PipelineError::configuration(
                name,
                "stage is enabled more than once",
            ));
        }
        for field in request.spec.outputs {
            if let Some(&other) = producers.get(field) {
                return Err(PipelineError::configuration(
                    name,
                    format!(
                        "{field} is also produced by {}",
                        requests[other].spec.name()
                    ),
                ));
            }
            producers.insert(*field, i);
        }
    }

    let mut edges: Vec<(usize, usize)> = Vec::new();
    let mut bases: Vec<Option<&'static str>> = vec![None; requests.len()];
    let mut fallbacks = Vec::new();

    for (i, request) in requests.iter().enumerate() {
        let name = request.spec.name();
        // Resolve a required field to a producer edge, or accept it as present.
        let require = |field: Field, edges: &mut Vec<(usize, usize)>| match producers.get(&field) {
            Some(&p) if p != i => {
                edges.push((p, i));
                Ok(())
            }
            Some(_) => Ok(()),
            None if available.contains(&field) => Ok(()),
            None => Err(PipelineError::configuration(
                name,
                format!("requires {field}, which is neither present nor produced by an enabled stage"),
            )),
        };

        let mut preferred_basis = None;
        let mut needed_basis = None;
        for input in request.spec.inputs {
            match *input {
                Requirement::Needs(field) => {
                    require(field, &mut edges)?;
                    if let (Field::Basis(b), None) = (field, needed_basis) {
                        needed_basis = Some(b);
                    }
                }
                Requirement::After(field) => {
                    if let Some(&p) = producers.get(&field) {
                        if p != i {
                            edges.push((p, i));
                        }
                    }
                }
                Requirement::PrefersBasis {
                    preferred,
                    fallback,
                } => {
                    let basis = match request.pinned_basis {
                        Some(pinned) => pinned,
                        None => {
                            let want = Field::Basis(preferred);
                            if producers.contains_key(&want) || available.contains(&want) {
                                preferred
                            } else {
                                warn!(
                                    "{name}: basis '{preferred}' is neither present nor computed, \
                                     falling back to '{fallback}'"
                                );
                                fallbacks.push(Fallback {
                                    stage: request.spec.kind,
                                    preferred,
                                    used: fallback,
                                });
                                fallback
                            }
                        }
                    };
                    require(Field::Basis(basis), &mut edges)?;
                    preferred_basis = Some(basis);
                }
            }
        }
        bases[i] = preferred_basis.or(needed_basis);
    }

    let mut graph = DiGraph::<usize, ()>::with_capacity(requests.len(), edges.len());
    let nodes: Vec<NodeIndex> = (0..requests.len()).map(|i| graph.add_node(i)).collect();
    for (from, to) in edges.into_iter().unique() {
        graph.add_edge(nodes[from], nodes[to], ());
    }

    if let Some(cycle) = tarjan_scc(&graph).into_iter().find(|scc| scc.len() > 1) {
        let mut members: Vec<_> = cycle.iter().map(|&n| requests[graph[n]].spec.kind).collect();
        members.sort();
        return Err(PipelineError::configuration(
            members[0].name(),
            format!("dependency cycle among stages {}", members.iter().join(", ")),
        ));
    }

    // Kahn's algorithm; among ready stages the lowest priority value runs first.
    let priority = |n: NodeIndex| (requests[graph[n]].spec.kind.priority(), n.index());
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<(u32, usize)>> = nodes
        .iter()
        .filter(|n| in_degree[n.index()] == 0)
        .map(|&n| Reverse(priority(n)))
        .collect();

    let mut stages = Vec::with_capacity(requests.len());
    while let Some(Reverse((_, idx))) = ready.pop() {
        let node = nodes[idx];
        let i = graph[node];
        let upstream = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|p| requests[graph[p]].spec.kind)
            .sorted()
            .collect();
        stages.push(PlannedStage {
            kind: requests[i].spec.kind,
            basis: bases[i],
            upstream,
        });
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(priority(next)));
            }
        }
    }

    Ok(Plan { stages, fallbacks })
}

/// Runs the body of a planned stage against the dataset.
pub trait StageExecutor: Send {
    fn run(&mut self, stage: &PlannedStage, ds: &mut Dataset) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    /// Not enabled in this run.
    NotEligible,
    Pending,
    Running,
    Done,
    Failed(PipelineError),
    /// Not run because `upstream` failed.
    Skipped { upstream: StageKind },
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub plan: Plan,
    pub states: BTreeMap<StageKind, StageState>,
}

impl RunReport {
    pub fn state(&self, kind: StageKind) -> &StageState {
        &self.states[&kind]
    }

    /// Stages whose body was invoked, in execution order.
    pub fn executed(&self) -> Vec<StageKind> {
        self.plan
            .stages
            .iter()
            .map(|s| s.kind)
            .filter(|k| matches!(self.states[k], StageState::Done | StageState::Failed(_)))
            .collect()
    }

    pub fn failures(&self) -> Vec<&PipelineError> {
        self.states
            .values()
            .filter_map(|s| match s {
                StageState::Failed(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, StageState::Done | StageState::NotEligible))
    }
}

/// Execute the planned stages in order. A failed stage does not stop the
/// run; stages depending on it, directly or transitively, are skipped.
pub fn execute(
    plan: &Plan,
    ds: &mut Dataset,
    executor: &mut dyn StageExecutor,
    pool: Option<&rayon::ThreadPool>,
) -> RunReport {
    let mut states: BTreeMap<StageKind, StageState> = StageKind::iter()
        .map(|k| (k, StageState::NotEligible))
        .collect();
    for stage in &plan.stages {
        states.insert(stage.kind, StageState::Pending);
    }

    for stage in &plan.stages {
        let blocked_by = stage.upstream.iter().find_map(|up| match &states[up] {
            StageState::Failed(_) => Some(*up),
            StageState::Skipped { upstream } => Some(*upstream),
            _ => None,
        });
        if let Some(upstream) = blocked_by {
            warn!("skipping {} because {upstream} failed", stage.kind);
            states.insert(stage.kind, StageState::Skipped { upstream });
            continue;
        }

        states.insert(stage.kind, StageState::Running);
        match stage.basis {
            Some(basis) => info!("running {} on basis '{basis}'", stage.kind),
            None => info!("running {}", stage.kind),
        }
        let start = Instant::now();
        let result = match pool {
            Some(pool) => pool.install(|| executor.run(stage, ds)),
            None => executor.run(stage, ds),
        };
        let state = match result {
            Ok(()) => {
                info!("{} finished in {:.2?}", stage.kind, start.elapsed());
                StageState::Done
            }
            Err(err) => {
                let err = PipelineError::from_stage_failure(stage.kind.name(), &err);
                error!("{err}");
                StageState::Failed(err)
            }
        };
        states.insert(stage.kind, state);
    }

    RunReport {
        plan: plan.clone(),
        states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DataError;
    use crate::registry::{spec, StageSpec};
    use sc_types::{basis, MatrixState};

    fn requests(kinds: &[StageKind]) -> Vec<StageRequest<'static>> {
        kinds.iter().map(|&k| StageRequest::new(spec(k))).collect()
    }

    fn raw() -> HashSet<Field> {
        [Field::Matrix(MatrixState::Raw)].into_iter().collect()
    }

    #[test]
    fn test_order_follows_dependencies_then_priority() {
        use StageKind::*;
        let reqs = requests(&[NetFle, Umap, Leiden, Diffmap, Pca, SelectHvf, Normalize, Filter]);
        let plan = plan(&reqs, &raw()).unwrap();
        assert_eq!(
            plan.order(),
            [Filter, Normalize, SelectHvf, Pca, Diffmap, Leiden, Umap, NetFle]
        );
        assert!(plan.fallbacks.is_empty());
        let net_fle = plan.stage(NetFle).unwrap();
        assert_eq!(net_fle.basis, Some(basis::DIFFMAP));
        assert_eq!(net_fle.upstream, [Pca, Diffmap]);
    }

    #[test]
    fn test_fallback_to_pca_is_reported() {
        use StageKind::*;
        let reqs = requests(&[Filter, Normalize, Pca, Fle]);
        let plan = plan(&reqs, &raw()).unwrap();
        assert_eq!(
            plan.fallbacks,
            [Fallback {
                stage: Fle,
                preferred: basis::DIFFMAP,
                used: basis::PCA
            }]
        );
        assert_eq!(plan.stage(Fle).unwrap().basis, Some(basis::PCA));
    }

    #[test]
    fn test_preexisting_fields_satisfy_inputs() {
        let available = [
            Field::Matrix(MatrixState::Normalized),
            Field::Basis(basis::PCA),
            Field::Basis(basis::DIFFMAP),
        ]
        .into_iter()
        .collect();
        let plan = plan(&requests(&[StageKind::NetFle]), &available).unwrap();
        assert_eq!(plan.stage(StageKind::NetFle).unwrap().basis, Some(basis::DIFFMAP));
        assert!(plan.stage(StageKind::NetFle).unwrap().upstream.is_empty());
    }

    #[test]
    fn test_unresolved_input_is_a_configuration_error() {
        let err = plan(&requests(&[StageKind::NetUmap]), &HashSet::new()).unwrap_err();
        assert_eq!(err.stage(), "net_umap");
        assert!(matches!(err, PipelineError::Configuration { .. }));
    }

    static CYCLIC: &[StageSpec] = &[
        StageSpec {
            kind: StageKind::Tsne,
            inputs: &[Requirement::Needs(Field::Basis("b"))],
            outputs: &[Field::Basis("a")],
            flag: None,
        },
        StageSpec {
            kind: StageKind::Umap,
            inputs: &[Requirement::Needs(Field::Basis("a"))],
            outputs: &[Field::Basis("b")],
            flag: None,
        },
    ];

    #[test]
    fn test_cycle_is_rejected() {
        let reqs: Vec<_> = CYCLIC.iter().map(StageRequest::new).collect();
        match plan(&reqs, &HashSet::new()) {
            Err(PipelineError::Configuration { stage, reason }) => {
                assert_eq!(stage, "tsne");
                assert!(reason.contains("cycle"));
                assert!(reason.contains("umap"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Scripted {
        fail: Option<StageKind>,
        ran: Vec<StageKind>,
    }

    impl StageExecutor for Scripted {
        fn run(&mut self, stage: &PlannedStage, _ds: &mut Dataset) -> anyhow::Result<()> {
            self.ran.push(stage.kind);
            if Some(stage.kind) == self.fail {
                return Err(DataError::new("not enough cells").into());
            }
            Ok(())
        }
    }

    #[test]
    fn test_failure_skips_only_dependents() {
        use StageKind::*;
        let available = [Field::Matrix(MatrixState::Normalized), Field::Basis(basis::PCA)]
            .into_iter()
            .collect();
        let plan = plan(&requests(&[Diffmap, Fle, Leiden, Pseudotime]), &available).unwrap();
        let mut ds = Dataset::from_dense(vec![], vec![], ndarray::Array2::zeros((0, 0)).view()).unwrap();
        let mut exec = Scripted {
            fail: Some(Diffmap),
            ran: vec![],
        };
        let report = execute(&plan, &mut ds, &mut exec, None);
        assert_eq!(exec.ran, [Diffmap, Leiden]);
        assert!(matches!(report.state(Diffmap), StageState::Failed(PipelineError::Data { .. })));
        assert_eq!(report.state(Fle), &StageState::Skipped { upstream: Diffmap });
        assert_eq!(report.state(Pseudotime), &StageState::Skipped { upstream: Diffmap });
        assert_eq!(report.state(Leiden), &StageState::Done);
        assert_eq!(report.state(Umap), &StageState::NotEligible);
        assert!(!report.is_success());
        assert_eq!(report.executed(), [Diffmap, Leiden]);
    }
}
