//! Pipeline options: the flat option mapping, its defaults, and the
//! validated per-stage configuration derived from it.

use crate::errors::PipelineError;
use crate::grouping::GroupingExpr;
use anyhow::{Context, Result};
use log::warn;
use sc_types::basis;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;
use strum::{Display, EnumString};

/// Version of the option schema understood by this build.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum HvfFlavor {
    #[serde(rename = "sccloud")]
    #[strum(serialize = "sccloud")]
    Sccloud,
    #[serde(rename = "Seurat")]
    #[strum(serialize = "Seurat")]
    Seurat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiffmapSolver {
    Eigsh,
    Randomized,
}

/// Basis for the K-means step of spectral clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SpectralBasis {
    Pca,
    Diffmap,
}

/// The flat option mapping, one entry per flag of the `cluster` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    pub config_version: u32,

    /// Width of the thread pool used inside stages.
    pub threads: usize,
    /// Input is already processed: no filtering, normalization, feature selection or PCA.
    pub processed: bool,

    /// Copy this cell attribute into `Channel`.
    pub channel_attr: Option<Cow<'static, str>>,
    /// Comma-separated cell attributes to drop.
    pub black_list: Option<Cow<'static, str>>,
    /// Keep only cells whose `demux_type` is `singlet`.
    pub select_singlets: bool,

    pub min_genes: u64,
    pub max_genes: u64,
    pub min_umis: u64,
    pub max_umis: u64,
    /// Comma-separated mitochondrial gene name prefixes.
    pub mito_prefix: Cow<'static, str>,
    pub percent_mito: f64,
    /// Genes expressed in fewer than this percentage of cells are not robust.
    pub gene_percent_cells: f64,
    pub counts_per_cell_after: f64,

    pub select_hvf: bool,
    pub hvf_flavor: HvfFlavor,
    /// `None` is only meaningful for the Seurat flavor (z-score cutoff).
    pub hvf_ngenes: Option<usize>,

    pub correct_batch_effect: bool,
    pub batch_group_by: Option<Cow<'static, str>>,

    pub random_state: u64,

    #[serde(rename = "nPC")]
    pub n_pc: usize,
    #[serde(rename = "knn_K")]
    pub knn_k: usize,
    /// Build neighbor indices with all threads, giving up reproducibility.
    pub knn_full_speed: bool,

    #[serde(rename = "kBET")]
    pub kbet: bool,
    #[serde(rename = "kBET_batch")]
    pub kbet_batch: Option<Cow<'static, str>>,
    #[serde(rename = "kBET_alpha")]
    pub kbet_alpha: f64,
    #[serde(rename = "kBET_K")]
    pub kbet_k: usize,

    pub diffmap: bool,
    pub diffmap_ndc: usize,
    pub diffmap_solver: DiffmapSolver,
    pub diffmap_maxt: usize,
    pub diffmap_to_3d: bool,
    /// Comma-separated root barcodes.
    pub calculate_pseudotime: Option<Cow<'static, str>>,

    pub louvain: bool,
    pub louvain_resolution: f64,
    pub louvain_class_label: Cow<'static, str>,

    pub leiden: bool,
    pub leiden_resolution: f64,
    /// Negative runs Leiden until the partition stops improving.
    pub leiden_niter: i64,
    pub leiden_class_label: Cow<'static, str>,

    pub spectral_louvain: bool,
    pub spectral_louvain_basis: SpectralBasis,
    pub spectral_louvain_nclusters: usize,
    pub spectral_louvain_ninit: usize,
    pub spectral_louvain_resolution: f64,
    pub spectral_louvain_class_label: Cow<'static, str>,

    pub spectral_leiden: bool,
    pub spectral_leiden_basis: SpectralBasis,
    pub spectral_leiden_nclusters: usize,
    pub spectral_leiden_ninit: usize,
    pub spectral_leiden_resolution: f64,
    pub spectral_leiden_class_label: Cow<'static, str>,

    pub tsne: bool,
    pub fitsne: bool,
    pub tsne_perplexity: f64,

    pub umap: bool,
    #[serde(rename = "umap_K")]
    pub umap_k: usize,
    pub umap_min_dist: f64,
    pub umap_spread: f64,

    pub fle: bool,
    #[serde(rename = "fle_K")]
    pub fle_k: usize,
    pub fle_target_change_per_node: f64,
    pub fle_target_steps: usize,
    /// Memory limit of the layout process, in GB.
    pub fle_memory: usize,
    /// Command of an external layout process; the built-in layout is used when unset.
    pub fle_command: Option<Cow<'static, str>>,
    pub fle_timeout_secs: u64,

    pub net_down_sample_fraction: f64,
    #[serde(rename = "net_down_sample_K")]
    pub net_down_sample_k: usize,
    pub net_down_sample_alpha: f64,
    #[serde(rename = "net_regressor_L2_penalty")]
    pub net_regressor_l2_penalty: f64,
    /// Fail a net stage instead of keeping the raw prediction when polishing fails.
    pub net_require_polish: bool,

    pub net_tsne: bool,
    pub net_tsne_polish_learning_frac: f64,
    pub net_tsne_polish_niter: usize,
    pub net_tsne_out_basis: Cow<'static, str>,

    pub net_umap: bool,
    pub net_umap_polish_learning_rate: f64,
    pub net_umap_polish_nepochs: usize,
    pub net_umap_out_basis: Cow<'static, str>,

    pub net_fle: bool,
    pub net_fle_polish_target_steps: usize,
    pub net_fle_out_basis: Cow<'static, str>,
}

pub const DEFAULT_OPTIONS: PipelineOptions = PipelineOptions {
    config_version: CONFIG_VERSION,
    threads: 1,
    processed: false,
    channel_attr: None,
    black_list: None,
    select_singlets: false,
    min_genes: 500,
    max_genes: 6000,
    min_umis: 100,
    max_umis: 600_000,
    mito_prefix: Cow::Borrowed("MT-"),
    percent_mito: 10.0,
    gene_percent_cells: 0.05,
    counts_per_cell_after: 1e5,
    select_hvf: true,
    hvf_flavor: HvfFlavor::Sccloud,
    hvf_ngenes: Some(2000),
    correct_batch_effect: false,
    batch_group_by: None,
    random_state: 0,
    n_pc: 50,
    knn_k: 100,
    knn_full_speed: false,
    kbet: false,
    kbet_batch: None,
    kbet_alpha: 0.05,
    kbet_k: 25,
    diffmap: false,
    diffmap_ndc: 100,
    diffmap_solver: DiffmapSolver::Eigsh,
    diffmap_maxt: 5000,
    diffmap_to_3d: false,
    calculate_pseudotime: None,
    louvain: false,
    louvain_resolution: 1.3,
    louvain_class_label: Cow::Borrowed("louvain_labels"),
    leiden: false,
    leiden_resolution: 1.3,
    leiden_niter: -1,
    leiden_class_label: Cow::Borrowed("leiden_labels"),
    spectral_louvain: false,
    spectral_louvain_basis: SpectralBasis::Diffmap,
    spectral_louvain_nclusters: 30,
    spectral_louvain_ninit: 20,
    spectral_louvain_resolution: 1.3,
    spectral_louvain_class_label: Cow::Borrowed("spectral_louvain_labels"),
    spectral_leiden: false,
    spectral_leiden_basis: SpectralBasis::Diffmap,
    spectral_leiden_nclusters: 30,
    spectral_leiden_ninit: 20,
    spectral_leiden_resolution: 1.3,
    spectral_leiden_class_label: Cow::Borrowed("spectral_leiden_labels"),
    tsne: false,
    fitsne: false,
    tsne_perplexity: 30.0,
    umap: false,
    umap_k: 15,
    umap_min_dist: 0.5,
    umap_spread: 1.0,
    fle: false,
    fle_k: 50,
    fle_target_change_per_node: 2.0,
    fle_target_steps: 5000,
    fle_memory: 8,
    fle_command: None,
    fle_timeout_secs: 3600,
    net_down_sample_fraction: 0.1,
    net_down_sample_k: 25,
    net_down_sample_alpha: 1.0,
    net_regressor_l2_penalty: 0.1,
    net_require_polish: false,
    net_tsne: false,
    net_tsne_polish_learning_frac: 0.33,
    net_tsne_polish_niter: 150,
    net_tsne_out_basis: Cow::Borrowed("net_tsne"),
    net_umap: false,
    net_umap_polish_learning_rate: 1.0,
    net_umap_polish_nepochs: 40,
    net_umap_out_basis: Cow::Borrowed("net_umap"),
    net_fle: false,
    net_fle_polish_target_steps: 1500,
    net_fle_out_basis: Cow::Borrowed("net_fle"),
};

impl Default for PipelineOptions {
    fn default() -> Self {
        DEFAULT_OPTIONS
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(String::from)
        .collect()
}

impl PipelineOptions {
    /// Build options from a flat name -> value mapping. Unknown names are rejected.
    pub fn from_map(
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PipelineError> {
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| PipelineError::configuration("options", e))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, PipelineError> {
        toml::from_str(s).map_err(|e| PipelineError::configuration("options", e))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        Ok(Self::from_toml_str(&s).with_context(|| path.display().to_string())?)
    }

    /// Names and values of the options that differ from the defaults.
    pub fn non_default(&self) -> Vec<(String, serde_json::Value)> {
        let (Ok(serde_json::Value::Object(ours)), Ok(serde_json::Value::Object(defaults))) = (
            serde_json::to_value(self),
            serde_json::to_value(DEFAULT_OPTIONS),
        ) else {
            return Vec::new();
        };
        ours.into_iter()
            .filter(|(k, v)| defaults.get(k) != Some(v))
            .collect()
    }

    /// Validate once and derive the per-stage configuration.
    pub fn resolve(&self) -> Result<PipelineConfig, PipelineError> {
        for (name, value) in self.non_default() {
            warn!("using non-default {name} = {value}");
        }
        let check = |ok: bool, stage: &str, reason: &str| -> Result<(), PipelineError> {
            if ok {
                Ok(())
            } else {
                Err(PipelineError::configuration(stage, reason))
            }
        };

        check(
            self.config_version == CONFIG_VERSION,
            "options",
            &format!(
                "config_version {} is not supported, expected {CONFIG_VERSION}",
                self.config_version
            ),
        )?;
        check(self.threads >= 1, "options", "threads must be at least 1")?;
        check(self.knn_k >= 1, "neighbors", "knn_K must be at least 1")?;
        if self.processed {
            check(
                !self.correct_batch_effect,
                "correct_batch",
                "correct_batch_effect cannot be applied to processed input",
            )?;
            check(
                !self.diffmap,
                "diffmap",
                "diffmap is not recomputed for processed input",
            )?;
        }

        let filter = if self.processed {
            None
        } else {
            check(
                self.min_genes < self.max_genes,
                "filter",
                "min_genes must be smaller than max_genes",
            )?;
            check(
                self.min_umis < self.max_umis,
                "filter",
                "min_umis must be smaller than max_umis",
            )?;
            check(
                (0.0..=100.0).contains(&self.percent_mito),
                "filter",
                "percent_mito must lie in [0, 100]",
            )?;
            check(
                (0.0..=100.0).contains(&self.gene_percent_cells),
                "filter",
                "gene_percent_cells must lie in [0, 100]",
            )?;
            Some(FilterParams {
                min_genes: self.min_genes,
                max_genes: self.max_genes,
                min_umis: self.min_umis,
                max_umis: self.max_umis,
                mito_prefixes: split_list(&self.mito_prefix),
                percent_mito: self.percent_mito,
                gene_percent_cells: self.gene_percent_cells,
                select_singlets: self.select_singlets,
                black_list: self.black_list.as_deref().map(split_list).unwrap_or_default(),
                channel_attr: self.channel_attr.as_deref().map(String::from),
            })
        };

        let normalize = if self.processed {
            None
        } else {
            check(
                self.counts_per_cell_after > 0.0 && self.counts_per_cell_after.is_finite(),
                "normalize",
                "counts_per_cell_after must be positive",
            )?;
            Some(NormalizeParams {
                counts_per_cell_after: self.counts_per_cell_after,
            })
        };

        let hvf = if self.processed || !self.select_hvf {
            None
        } else {
            check(
                self.hvf_ngenes != Some(0),
                "select_hvf",
                "hvf_ngenes must be at least 1",
            )?;
            check(
                self.hvf_ngenes.is_some() || self.hvf_flavor == HvfFlavor::Seurat,
                "select_hvf",
                "hvf_ngenes = None is only supported by the Seurat flavor",
            )?;
            Some(HvfParams {
                flavor: self.hvf_flavor,
                n_genes: self.hvf_ngenes,
            })
        };

        // The expression is checked syntactically even when batch correction is off.
        let group_by = GroupingExpr::parse(self.batch_group_by.as_deref())
            .map_err(|e| PipelineError::configuration("correct_batch", e))?;
        let batch = self
            .correct_batch_effect
            .then_some(BatchParams { group_by });

        let pca = if self.processed {
            None
        } else {
            check(self.n_pc >= 1, "pca", "nPC must be at least 1")?;
            Some(PcaParams { n_pc: self.n_pc })
        };

        let kbet = if self.kbet {
            check(self.kbet_k >= 1, "kbet", "kBET_K must be at least 1")?;
            check(
                self.kbet_alpha > 0.0 && self.kbet_alpha < 1.0,
                "kbet",
                "kBET_alpha must lie in (0, 1)",
            )?;
            let batch = self
                .kbet_batch
                .as_deref()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| PipelineError::configuration("kbet", "kBET requires kBET_batch"))?;
            Some(KbetParams {
                batch: batch.trim().to_string(),
                alpha: self.kbet_alpha,
                k: self.kbet_k,
            })
        } else {
            None
        };

        let diffmap = if self.diffmap {
            check(self.diffmap_ndc >= 1, "diffmap", "diffmap_ndc must be at least 1")?;
            check(self.diffmap_maxt >= 1, "diffmap", "diffmap_maxt must be at least 1")?;
            Some(DiffmapParams {
                n_components: self.diffmap_ndc,
                solver: self.diffmap_solver,
                max_t: self.diffmap_maxt,
            })
        } else {
            None
        };

        let pseudotime = match self.calculate_pseudotime.as_deref() {
            None => None,
            Some(roots) => {
                let roots = split_list(roots);
                check(
                    !roots.is_empty(),
                    "pseudotime",
                    "calculate_pseudotime needs at least one root barcode",
                )?;
                Some(PseudotimeParams { roots })
            }
        };

        let positive = |x: f64| x > 0.0 && x.is_finite();
        let louvain = if self.louvain {
            check(
                positive(self.louvain_resolution),
                "louvain",
                "louvain_resolution must be positive",
            )?;
            Some(ClusterParams {
                resolution: self.louvain_resolution,
                class_label: self.louvain_class_label.to_string(),
            })
        } else {
            None
        };
        let leiden = if self.leiden {
            check(
                positive(self.leiden_resolution),
                "leiden",
                "leiden_resolution must be positive",
            )?;
            check(self.leiden_niter != 0, "leiden", "leiden_niter must not be 0")?;
            Some(LeidenParams {
                resolution: self.leiden_resolution,
                n_iter: usize::try_from(self.leiden_niter).ok(),
                class_label: self.leiden_class_label.to_string(),
            })
        } else {
            None
        };

        let spectral = |enabled: bool,
                        stage: &str,
                        basis: SpectralBasis,
                        n_clusters: usize,
                        n_init: usize,
                        resolution: f64,
                        label: &str|
         -> Result<Option<SpectralParams>, PipelineError> {
            if !enabled {
                return Ok(None);
            }
            check(n_clusters >= 1, stage, "nclusters must be at least 1")?;
            check(n_init >= 1, stage, "ninit must be at least 1")?;
            check(positive(resolution), stage, "resolution must be positive")?;
            Ok(Some(SpectralParams {
                basis,
                n_clusters,
                n_init,
                resolution,
                class_label: label.to_string(),
            }))
        };
        let spectral_louvain = spectral(
            self.spectral_louvain,
            "spectral_louvain",
            self.spectral_louvain_basis,
            self.spectral_louvain_nclusters,
            self.spectral_louvain_ninit,
            self.spectral_louvain_resolution,
            &self.spectral_louvain_class_label,
        )?;
        let spectral_leiden = spectral(
            self.spectral_leiden,
            "spectral_leiden",
            self.spectral_leiden_basis,
            self.spectral_leiden_nclusters,
            self.spectral_leiden_ninit,
            self.spectral_leiden_resolution,
            &self.spectral_leiden_class_label,
        )?;

        let mut labels = HashSet::new();
        for (stage, label) in [
            ("louvain", louvain.as_ref().map(|p| &p.class_label)),
            ("leiden", leiden.as_ref().map(|p| &p.class_label)),
            (
                "spectral_louvain",
                spectral_louvain.as_ref().map(|p| &p.class_label),
            ),
            (
                "spectral_leiden",
                spectral_leiden.as_ref().map(|p| &p.class_label),
            ),
        ] {
            if let Some(label) = label {
                check(!label.trim().is_empty(), stage, "class label must not be empty")?;
                check(
                    labels.insert(label.clone()),
                    stage,
                    &format!("class label '{label}' is used by more than one clustering"),
                )?;
            }
        }

        let needs_perplexity = self.tsne || self.fitsne || self.net_tsne;
        check(
            !needs_perplexity || positive(self.tsne_perplexity),
            "tsne",
            "tsne_perplexity must be positive",
        )?;
        let tsne = self.tsne.then_some(TsneParams {
            perplexity: self.tsne_perplexity,
        });
        let fitsne = self.fitsne.then_some(TsneParams {
            perplexity: self.tsne_perplexity,
        });

        let umap_params = UmapParams {
            k: self.umap_k,
            min_dist: self.umap_min_dist,
            spread: self.umap_spread,
        };
        if self.umap || self.net_umap {
            check(self.umap_k >= 2, "umap", "umap_K must be at least 2")?;
            check(positive(self.umap_spread), "umap", "umap_spread must be positive")?;
            check(
                self.umap_min_dist >= 0.0 && self.umap_min_dist <= self.umap_spread,
                "umap",
                "umap_min_dist must lie in [0, umap_spread]",
            )?;
        }
        let umap = self.umap.then(|| umap_params.clone());

        let fle_params = FleParams {
            k: self.fle_k,
            target_change_per_node: self.fle_target_change_per_node,
            target_steps: self.fle_target_steps,
        };
        if self.fle || self.net_fle {
            check(self.fle_k >= 1, "fle", "fle_K must be at least 1")?;
            check(
                self.fle_target_steps >= 1,
                "fle",
                "fle_target_steps must be at least 1",
            )?;
            check(
                self.fle_target_change_per_node >= 0.0,
                "fle",
                "fle_target_change_per_node must not be negative",
            )?;
            check(self.fle_memory >= 1, "fle", "fle_memory must be at least 1 GB")?;
            check(
                self.fle_timeout_secs >= 1,
                "fle",
                "fle_timeout_secs must be at least 1",
            )?;
        }
        let fle = self.fle.then(|| fle_params.clone());
        let layout = LayoutServiceParams {
            memory_gb: self.fle_memory,
            command: self.fle_command.as_deref().map(String::from),
            timeout_secs: self.fle_timeout_secs,
        };

        let net = NetParams {
            fraction: self.net_down_sample_fraction,
            k: self.net_down_sample_k,
            alpha: self.net_down_sample_alpha,
            l2_penalty: self.net_regressor_l2_penalty,
            require_polish: self.net_require_polish,
        };
        let any_net = self.net_tsne || self.net_umap || self.net_fle;
        let mut out_bases = HashSet::new();
        for (enabled, stage, out_basis) in [
            (self.net_tsne, "net_tsne", &self.net_tsne_out_basis),
            (self.net_umap, "net_umap", &self.net_umap_out_basis),
            (self.net_fle, "net_fle", &self.net_fle_out_basis),
        ] {
            if enabled {
                check(
                    !out_basis.trim().is_empty(),
                    stage,
                    "output basis must not be empty",
                )?;
                check(
                    !RESERVED_BASES.contains(&&**out_basis),
                    stage,
                    &format!("output basis '{out_basis}' is reserved for another stage"),
                )?;
                check(
                    out_bases.insert(out_basis.to_string()),
                    stage,
                    &format!("output basis '{out_basis}' is used by more than one net stage"),
                )?;
            }
        }
        if any_net {
            check(
                net.fraction > 0.0 && net.fraction <= 1.0,
                "net",
                "net_down_sample_fraction must lie in (0, 1]",
            )?;
            check(net.k >= 1, "net", "net_down_sample_K must be at least 1")?;
            check(
                net.alpha.is_finite(),
                "net",
                "net_down_sample_alpha must be finite",
            )?;
            check(
                net.l2_penalty >= 0.0 && net.l2_penalty.is_finite(),
                "net",
                "net_regressor_L2_penalty must not be negative",
            )?;
        }
        if self.net_tsne {
            check(
                positive(self.net_tsne_polish_learning_frac),
                "net_tsne",
                "net_tsne_polish_learning_frac must be positive",
            )?;
        }
        if self.net_umap {
            check(
                positive(self.net_umap_polish_learning_rate),
                "net_umap",
                "net_umap_polish_learning_rate must be positive",
            )?;
        }

        let net_tsne = self.net_tsne.then(|| NetTsneParams {
            perplexity: self.tsne_perplexity,
            polish_learning_frac: self.net_tsne_polish_learning_frac,
            polish_n_iter: self.net_tsne_polish_niter,
            out_basis: self.net_tsne_out_basis.to_string(),
        });
        let net_umap = self.net_umap.then(|| NetUmapParams {
            umap: umap_params.clone(),
            polish_learning_rate: self.net_umap_polish_learning_rate,
            polish_n_epochs: self.net_umap_polish_nepochs,
            out_basis: self.net_umap_out_basis.to_string(),
        });
        let net_fle = self.net_fle.then(|| NetFleParams {
            fle: fle_params.clone(),
            polish_target_steps: self.net_fle_polish_target_steps,
            out_basis: self.net_fle_out_basis.to_string(),
        });

        Ok(PipelineConfig {
            threads: self.threads,
            seed: self.random_state,
            processed: self.processed,
            knn: KnnParams {
                k: self.knn_k,
                full_speed: self.knn_full_speed,
            },
            filter,
            normalize,
            hvf,
            batch,
            pca,
            kbet,
            diffmap,
            diffmap_to_3d: self.diffmap_to_3d,
            pseudotime,
            louvain,
            leiden,
            spectral_louvain,
            spectral_leiden,
            tsne,
            fitsne,
            umap,
            fle,
            layout,
            net,
            net_tsne,
            net_umap,
            net_fle,
        })
    }
}

/// Bases written by exact stages; net stages may not overwrite them.
pub const RESERVED_BASES: &[&str] = &[
    basis::PCA,
    basis::DIFFMAP,
    basis::DIFFMAP_PCA,
    basis::TSNE,
    basis::FITSNE,
    basis::UMAP,
    basis::FLE,
];

#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    pub min_genes: u64,
    pub max_genes: u64,
    pub min_umis: u64,
    pub max_umis: u64,
    pub mito_prefixes: Vec<String>,
    pub percent_mito: f64,
    pub gene_percent_cells: f64,
    pub select_singlets: bool,
    pub black_list: Vec<String>,
    pub channel_attr: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeParams {
    pub counts_per_cell_after: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HvfParams {
    pub flavor: HvfFlavor,
    pub n_genes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchParams {
    pub group_by: GroupingExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PcaParams {
    pub n_pc: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnnParams {
    pub k: usize,
    pub full_speed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KbetParams {
    pub batch: String,
    pub alpha: f64,
    pub k: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffmapParams {
    pub n_components: usize,
    pub solver: DiffmapSolver,
    pub max_t: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PseudotimeParams {
    pub roots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterParams {
    pub resolution: f64,
    pub class_label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeidenParams {
    pub resolution: f64,
    /// `None` iterates until the partition stops changing.
    pub n_iter: Option<usize>,
    pub class_label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralParams {
    pub basis: SpectralBasis,
    pub n_clusters: usize,
    pub n_init: usize,
    pub resolution: f64,
    pub class_label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TsneParams {
    pub perplexity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UmapParams {
    pub k: usize,
    pub min_dist: f64,
    pub spread: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleParams {
    pub k: usize,
    pub target_change_per_node: f64,
    pub target_steps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutServiceParams {
    pub memory_gb: usize,
    pub command: Option<String>,
    pub timeout_secs: u64,
}

/// Down-sampling and regressor settings shared by the net stages.
#[derive(Debug, Clone, PartialEq)]
pub struct NetParams {
    pub fraction: f64,
    pub k: usize,
    pub alpha: f64,
    pub l2_penalty: f64,
    pub require_polish: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetTsneParams {
    pub perplexity: f64,
    pub polish_learning_frac: f64,
    pub polish_n_iter: usize,
    pub out_basis: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetUmapParams {
    pub umap: UmapParams,
    pub polish_learning_rate: f64,
    pub polish_n_epochs: usize,
    pub out_basis: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetFleParams {
    pub fle: FleParams,
    pub polish_target_steps: usize,
    pub out_basis: String,
}

/// Validated configuration, one entry per stage family. A family is enabled
/// iff its entry is `Some`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub threads: usize,
    pub seed: u64,
    pub processed: bool,
    pub knn: KnnParams,
    pub filter: Option<FilterParams>,
    pub normalize: Option<NormalizeParams>,
    pub hvf: Option<HvfParams>,
    pub batch: Option<BatchParams>,
    pub pca: Option<PcaParams>,
    pub kbet: Option<KbetParams>,
    pub diffmap: Option<DiffmapParams>,
    pub diffmap_to_3d: bool,
    pub pseudotime: Option<PseudotimeParams>,
    pub louvain: Option<ClusterParams>,
    pub leiden: Option<LeidenParams>,
    pub spectral_louvain: Option<SpectralParams>,
    pub spectral_leiden: Option<SpectralParams>,
    pub tsne: Option<TsneParams>,
    pub fitsne: Option<TsneParams>,
    pub umap: Option<UmapParams>,
    pub fle: Option<FleParams>,
    pub layout: LayoutServiceParams,
    pub net: NetParams,
    pub net_tsne: Option<NetTsneParams>,
    pub net_umap: Option<NetUmapParams>,
    pub net_fle: Option<NetFleParams>,
}
