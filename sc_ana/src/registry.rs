//! Static table of analysis stages with their declared inputs and outputs.

use crate::config::{PipelineConfig, SpectralBasis};
use sc_types::{basis, MatrixState};
use std::fmt;
use strum::{EnumIter, IntoStaticStr};

/// Every analysis stage. Declaration order is the tie-break priority used
/// when ordering independent stages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    Filter,
    Normalize,
    SelectHvf,
    CorrectBatch,
    Pca,
    Diffmap,
    #[strum(serialize = "diffmap_to_3d")]
    DiffmapTo3d,
    Pseudotime,
    Kbet,
    Louvain,
    Leiden,
    SpectralLouvain,
    SpectralLeiden,
    Tsne,
    Fitsne,
    Umap,
    Fle,
    NetTsne,
    NetUmap,
    NetFle,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn priority(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A piece of dataset state that stages read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// The expression matrix in the given state.
    Matrix(MatrixState),
    /// The `highly_variable_features` gene column.
    HighlyVariable,
    /// The batch-corrected dense layer.
    Corrected,
    /// A basis in the embedding registry.
    Basis(&'static str),
    /// A cell metadata column.
    CellAttr(&'static str),
    /// An unstructured result.
    Uns(&'static str),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Matrix(state) => write!(f, "{state} matrix"),
            Field::HighlyVariable => f.write_str("highly variable features"),
            Field::Corrected => f.write_str("batch-corrected layer"),
            Field::Basis(b) => write!(f, "basis '{b}'"),
            Field::CellAttr(a) => write!(f, "cell attribute '{a}'"),
            Field::Uns(k) => write!(f, "result '{k}'"),
        }
    }
}

/// How a stage depends on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Must be present before the stage runs.
    Needs(Field),
    /// Use the preferred basis if present or produced, else the fallback.
    PrefersBasis {
        preferred: &'static str,
        fallback: &'static str,
    },
    /// Ordering only: if an enabled stage produces the field, run after it.
    After(Field),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub inputs: &'static [Requirement],
    pub outputs: &'static [Field],
    /// Option enabling the stage; `None` for stages that always run on raw input.
    pub flag: Option<&'static str>,
}

impl StageSpec {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

use Requirement::{After, Needs, PrefersBasis};

const PREFER_DIFFMAP: Requirement = PrefersBasis {
    preferred: basis::DIFFMAP,
    fallback: basis::PCA,
};
const NEEDS_PCA: Requirement = Needs(Field::Basis(basis::PCA));
const NEEDS_DIFFMAP: Requirement = Needs(Field::Basis(basis::DIFFMAP));

pub static STAGE_REGISTRY: &[StageSpec] = &[
    StageSpec {
        kind: StageKind::Filter,
        inputs: &[Needs(Field::Matrix(MatrixState::Raw))],
        outputs: &[
            Field::Matrix(MatrixState::Filtered),
            Field::CellAttr("Channel"),
        ],
        flag: None,
    },
    StageSpec {
        kind: StageKind::Normalize,
        inputs: &[Needs(Field::Matrix(MatrixState::Filtered))],
        outputs: &[Field::Matrix(MatrixState::Normalized)],
        flag: None,
    },
    StageSpec {
        kind: StageKind::SelectHvf,
        inputs: &[Needs(Field::Matrix(MatrixState::Normalized))],
        outputs: &[Field::HighlyVariable],
        flag: Some("select_hvf"),
    },
    StageSpec {
        kind: StageKind::CorrectBatch,
        inputs: &[
            Needs(Field::Matrix(MatrixState::Normalized)),
            After(Field::HighlyVariable),
        ],
        outputs: &[Field::Corrected],
        flag: Some("correct_batch_effect"),
    },
    StageSpec {
        kind: StageKind::Pca,
        inputs: &[
            Needs(Field::Matrix(MatrixState::Normalized)),
            After(Field::HighlyVariable),
            After(Field::Corrected),
        ],
        outputs: &[Field::Basis(basis::PCA)],
        flag: None,
    },
    StageSpec {
        kind: StageKind::Diffmap,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis(basis::DIFFMAP), Field::Uns("diffmap_evals")],
        flag: Some("diffmap"),
    },
    StageSpec {
        kind: StageKind::DiffmapTo3d,
        inputs: &[NEEDS_DIFFMAP],
        outputs: &[Field::Basis(basis::DIFFMAP_PCA)],
        flag: Some("diffmap_to_3d"),
    },
    StageSpec {
        kind: StageKind::Pseudotime,
        inputs: &[NEEDS_DIFFMAP],
        outputs: &[Field::CellAttr("pseudotime")],
        flag: Some("calculate_pseudotime"),
    },
    StageSpec {
        kind: StageKind::Kbet,
        inputs: &[NEEDS_PCA],
        outputs: &[
            Field::Uns("kBET_stat"),
            Field::Uns("kBET_pvalue"),
            Field::Uns("kBET_accept_rate"),
        ],
        flag: Some("kBET"),
    },
    StageSpec {
        kind: StageKind::Louvain,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::CellAttr("louvain_labels")],
        flag: Some("louvain"),
    },
    StageSpec {
        kind: StageKind::Leiden,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::CellAttr("leiden_labels")],
        flag: Some("leiden"),
    },
    StageSpec {
        kind: StageKind::SpectralLouvain,
        inputs: &[NEEDS_PCA, PREFER_DIFFMAP],
        outputs: &[Field::CellAttr("spectral_louvain_labels")],
        flag: Some("spectral_louvain"),
    },
    StageSpec {
        kind: StageKind::SpectralLeiden,
        inputs: &[NEEDS_PCA, PREFER_DIFFMAP],
        outputs: &[Field::CellAttr("spectral_leiden_labels")],
        flag: Some("spectral_leiden"),
    },
    StageSpec {
        kind: StageKind::Tsne,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis(basis::TSNE)],
        flag: Some("tsne"),
    },
    StageSpec {
        kind: StageKind::Fitsne,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis(basis::FITSNE)],
        flag: Some("fitsne"),
    },
    StageSpec {
        kind: StageKind::Umap,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis(basis::UMAP)],
        flag: Some("umap"),
    },
    StageSpec {
        kind: StageKind::Fle,
        inputs: &[PREFER_DIFFMAP],
        outputs: &[Field::Basis(basis::FLE)],
        flag: Some("fle"),
    },
    StageSpec {
        kind: StageKind::NetTsne,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis("net_tsne")],
        flag: Some("net_tsne"),
    },
    StageSpec {
        kind: StageKind::NetUmap,
        inputs: &[NEEDS_PCA],
        outputs: &[Field::Basis("net_umap")],
        flag: Some("net_umap"),
    },
    StageSpec {
        kind: StageKind::NetFle,
        inputs: &[NEEDS_PCA, PREFER_DIFFMAP],
        outputs: &[Field::Basis("net_fle")],
        flag: Some("net_fle"),
    },
];

/// Registry entry of a stage.
pub fn spec(kind: StageKind) -> &'static StageSpec {
    // The registry holds every kind, in declaration order.
    &STAGE_REGISTRY[kind as usize]
}

/// A stage selected for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRequest<'a> {
    pub spec: &'a StageSpec,
    /// Use this basis in place of the stage's preferred basis.
    pub pinned_basis: Option<&'static str>,
}

impl<'a> StageRequest<'a> {
    pub fn new(spec: &'a StageSpec) -> Self {
        StageRequest {
            spec,
            pinned_basis: None,
        }
    }
}

/// The stages a configuration enables, in registry order.
pub fn enabled_stages(config: &PipelineConfig) -> Vec<StageRequest<'static>> {
    let pin = |basis: SpectralBasis| match basis {
        SpectralBasis::Pca => Some(basis::PCA),
        SpectralBasis::Diffmap => None,
    };
    let raw = !config.processed;
    STAGE_REGISTRY
        .iter()
        .filter_map(|spec| {
            let (enabled, pinned_basis) = match spec.kind {
                StageKind::Filter => (config.filter.is_some(), None),
                StageKind::Normalize => (config.normalize.is_some(), None),
                StageKind::SelectHvf => (config.hvf.is_some(), None),
                StageKind::CorrectBatch => (config.batch.is_some() && raw, None),
                StageKind::Pca => (config.pca.is_some(), None),
                StageKind::Diffmap => (config.diffmap.is_some() && raw, None),
                StageKind::DiffmapTo3d => (config.diffmap_to_3d, None),
                StageKind::Pseudotime => (config.pseudotime.is_some(), None),
                StageKind::Kbet => (config.kbet.is_some(), None),
                StageKind::Louvain => (config.louvain.is_some(), None),
                StageKind::Leiden => (config.leiden.is_some(), None),
                StageKind::SpectralLouvain => match &config.spectral_louvain {
                    Some(p) => (true, pin(p.basis)),
                    None => (false, None),
                },
                StageKind::SpectralLeiden => match &config.spectral_leiden {
                    Some(p) => (true, pin(p.basis)),
                    None => (false, None),
                },
                StageKind::Tsne => (config.tsne.is_some(), None),
                StageKind::Fitsne => (config.fitsne.is_some(), None),
                StageKind::Umap => (config.umap.is_some(), None),
                StageKind::Fle => (config.fle.is_some(), None),
                StageKind::NetTsne => (config.net_tsne.is_some(), None),
                StageKind::NetUmap => (config.net_umap.is_some(), None),
                StageKind::NetFle => (config.net_fle.is_some(), None),
            };
            enabled.then_some(StageRequest { spec, pinned_basis })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineOptions;
    use strum::IntoEnumIterator;

    #[test]
    fn test_registry_matches_kinds() {
        assert_eq!(STAGE_REGISTRY.len(), StageKind::iter().count());
        for kind in StageKind::iter() {
            assert_eq!(spec(kind).kind, kind);
        }
        assert_eq!(StageKind::DiffmapTo3d.name(), "diffmap_to_3d");
        assert_eq!(StageKind::SelectHvf.name(), "select_hvf");
        assert_eq!(StageKind::NetFle.name(), "net_fle");
    }

    #[test]
    fn test_default_stages() {
        let config = PipelineOptions::default().resolve().unwrap();
        let names: Vec<_> = enabled_stages(&config)
            .iter()
            .map(|r| r.spec.name())
            .collect();
        assert_eq!(names, ["filter", "normalize", "select_hvf", "pca"]);
    }

    #[test]
    fn test_processed_enables_nothing_by_default() {
        let opts = PipelineOptions {
            processed: true,
            ..PipelineOptions::default()
        };
        assert!(enabled_stages(&opts.resolve().unwrap()).is_empty());
    }

    #[test]
    fn test_spectral_pca_basis_is_pinned() {
        let opts = PipelineOptions {
            spectral_leiden: true,
            spectral_leiden_basis: SpectralBasis::Pca,
            ..PipelineOptions::default()
        };
        let config = opts.resolve().unwrap();
        let request = enabled_stages(&config)
            .into_iter()
            .find(|r| r.spec.kind == StageKind::SpectralLeiden)
            .unwrap();
        assert_eq!(request.pinned_basis, Some(basis::PCA));
    }
}
