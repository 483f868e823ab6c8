//! Entry points tying configuration, planning and the built-in stages together.

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::orchestrator::{execute, plan, Plan, RunReport};
use crate::registry::{enabled_stages, Field, Requirement, StageKind, STAGE_REGISTRY};
use crate::stages::filter::CHANNEL;
use crate::stages::{BuiltinStages, HIGHLY_VARIABLE};
use log::info;
use sc_types::Dataset;
use std::collections::HashSet;

fn is_present(ds: &Dataset, field: Field) -> bool {
    match field {
        Field::Matrix(state) => ds.state() == state,
        Field::HighlyVariable => ds.var().contains(HIGHLY_VARIABLE),
        Field::Corrected => ds.corrected().is_some(),
        Field::Basis(b) => ds.has_embedding(b),
        Field::CellAttr(a) => ds.obs().contains(a),
        Field::Uns(k) => ds.uns().contains_key(k),
    }
}

/// Fields named anywhere in the stage registry that the dataset already holds.
pub fn available_fields(ds: &Dataset) -> HashSet<Field> {
    let mut fields = HashSet::new();
    for spec in STAGE_REGISTRY {
        fields.extend(spec.outputs.iter().copied());
        for input in spec.inputs {
            match *input {
                Requirement::Needs(f) | Requirement::After(f) => {
                    fields.insert(f);
                }
                Requirement::PrefersBasis { preferred, fallback } => {
                    fields.insert(Field::Basis(preferred));
                    fields.insert(Field::Basis(fallback));
                }
            }
        }
    }
    fields.into_iter().filter(|&f| is_present(ds, f)).collect()
}

/// Plan the enabled stages against `ds` and check that the cell attributes
/// the options name exist. Nothing runs.
pub fn plan_pipeline(config: &PipelineConfig, ds: &Dataset) -> Result<Plan, PipelineError> {
    let requests = enabled_stages(config);
    let plan = plan(&requests, &available_fields(ds))?;

    let filtering = plan.stage(StageKind::Filter).is_some();
    let obs = ds.obs();
    // the filter stage derives `Channel` when the input lacks it
    let has_attr = |a: &str| obs.contains(a) || (filtering && a == CHANNEL);
    let missing = |stage: StageKind, what: &str, attr: &str| {
        PipelineError::configuration(stage.name(), format!("{what} '{attr}' does not exist in the cell metadata"))
    };

    if let (Some(filter), true) = (&config.filter, filtering) {
        if let Some(attr) = &filter.channel_attr {
            if !obs.contains(attr) {
                return Err(missing(StageKind::Filter, "channel attribute", attr.as_str()));
            }
        }
        if filter.select_singlets && !obs.contains("demux_type") {
            return Err(missing(StageKind::Filter, "attribute", "demux_type"));
        }
    }
    if let (Some(batch), Some(_)) = (&config.batch, plan.stage(StageKind::CorrectBatch)) {
        batch
            .group_by
            .check_attributes(&has_attr)
            .map_err(|e| PipelineError::configuration(StageKind::CorrectBatch.name(), e))?;
        if !has_attr(CHANNEL) {
            return Err(missing(StageKind::CorrectBatch, "attribute", CHANNEL));
        }
    }
    if let (Some(kbet), Some(_)) = (&config.kbet, plan.stage(StageKind::Kbet)) {
        if !has_attr(kbet.batch.as_str()) {
            return Err(missing(StageKind::Kbet, "batch attribute", kbet.batch.as_str()));
        }
    }

    info!(
        "planned {} stages: {}",
        plan.stages.len(),
        plan.order().iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
    );
    Ok(plan)
}

/// Plan, then execute every enabled stage on `ds` with `config.threads`
/// worker threads. Stage failures are reported in the returned report;
/// only configuration problems found before any stage runs are errors.
pub fn run_pipeline(config: &PipelineConfig, ds: &mut Dataset) -> Result<RunReport, PipelineError> {
    let plan = plan_pipeline(config, ds)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .map_err(|e| PipelineError::configuration("threads", e))?;
    let mut executor = BuiltinStages::new(config)?;
    Ok(execute(&plan, ds, &mut executor, Some(&pool)))
}
