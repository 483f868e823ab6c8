//! I/O CSV helper functions

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use sc_types::{Column, Dataset, UnsValue};
use sprs::TriMat;
use std::collections::{BTreeMap, HashMap};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Load a `cells x genes` count matrix. The header row is `Barcode` followed
/// by the gene names; every other row is a barcode followed by its counts.
pub fn load_counts_csv(path: &Path) -> Result<Dataset> {
    let mut reader = ::csv::Reader::from_path(path).with_context(|| path.display().to_string())?;
    let header = reader.headers()?.clone();
    if header.len() < 2 {
        bail!("{}: expected a barcode column and at least one gene", path.display());
    }
    let features: Vec<String> = header.iter().skip(1).map(str::to_string).collect();

    let mut barcodes = Vec::new();
    let mut triplets = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: row {}", path.display(), row + 2))?;
        let mut fields = record.iter();
        let barcode = fields.next().unwrap_or_default();
        barcodes.push(barcode.to_string());
        for (j, field) in fields.enumerate() {
            let v: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("{}: count '{field}' of cell {barcode}", path.display()))?;
            if v != 0.0 {
                triplets.push((row, j, v));
            }
        }
    }

    let mut tri = TriMat::with_capacity((barcodes.len(), features.len()), triplets.len());
    for (i, j, v) in triplets {
        tri.add_triplet(i, j, v);
    }
    Dataset::new(barcodes, features, tri.to_csr())
}

/// The narrowest column type every value parses as: integer, float, then string.
fn infer_column(values: Vec<String>) -> Column {
    if let Ok(ints) = values.iter().map(|v| v.parse::<i64>()).collect::<Result<Vec<_>, _>>() {
        return Column::Int(ints);
    }
    if let Ok(floats) = values.iter().map(|v| v.parse::<f64>()).collect::<Result<Vec<_>, _>>() {
        return Column::Float(floats);
    }
    Column::Str(values)
}

/// Attach cell attributes from a CSV whose first column holds barcodes. Every
/// cell of `ds` must have a row; extra rows are ignored.
pub fn load_metadata_csv(path: &Path, ds: &mut Dataset) -> Result<()> {
    let mut reader = ::csv::Reader::from_path(path).with_context(|| path.display().to_string())?;
    let header = reader.headers()?.clone();
    let names: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let mut rows: HashMap<String, Vec<String>> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let barcode = fields.next().unwrap_or_default().to_string();
        rows.insert(barcode, fields.map(str::to_string).collect());
    }

    let mut columns = vec![Vec::with_capacity(ds.n_cells()); names.len()];
    for barcode in ds.barcodes() {
        let Some(row) = rows.get(barcode) else {
            bail!("{}: no attributes for cell {barcode}", path.display());
        };
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value.clone());
        }
    }
    for (name, values) in names.into_iter().zip(columns) {
        ds.obs_mut().insert(name, infer_column(values))?;
    }
    Ok(())
}

/// Load a precomputed basis from a CSV with a barcode column followed by one
/// column per component, e.g. a `projection.csv` written by [`save_embedding`].
pub fn load_embedding_csv(path: &Path, key: &str, ds: &mut Dataset) -> Result<()> {
    let mut reader = ::csv::Reader::from_path(path).with_context(|| path.display().to_string())?;
    let num_components = reader.headers()?.len().saturating_sub(1);
    let mut rows: HashMap<String, Vec<f64>> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let barcode = fields.next().unwrap_or_default().to_string();
        let values = fields
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("{}: coordinates of cell {barcode}", path.display()))?;
        rows.insert(barcode, values);
    }
    let mut embedding = Array2::zeros((ds.n_cells(), num_components));
    for (i, barcode) in ds.barcodes().iter().enumerate() {
        let Some(row) = rows.get(barcode) else {
            bail!("{}: no coordinates for cell {barcode}", path.display());
        };
        for (j, &v) in row.iter().enumerate() {
            embedding[[i, j]] = v;
        }
    }
    ds.insert_embedding(key, embedding)
}

pub fn save_clustering(path: &Path, key: &str, barcodes: &[String], labels: &Column) -> Result<()> {
    let clustering_dir = path.join(key);
    create_dir_all(&clustering_dir)?;
    let mut file = BufWriter::new(File::create(clustering_dir.join("clusters.csv"))?);
    writeln!(file, "Barcode,Cluster")?;
    for (i, barcode) in barcodes.iter().enumerate() {
        writeln!(file, "{barcode},{}", labels.value_str(i))?;
    }
    file.flush()?;
    Ok(())
}

pub fn save_embedding(path: &Path, key: &str, barcodes: &[String], embedding: &Array2<f64>) -> Result<()> {
    let (num_bcs, num_components) = embedding.dim();
    let component_dir = path.join(format!("{key}_components"));
    create_dir_all(&component_dir)?;
    let mut file = BufWriter::new(File::create(component_dir.join("projection.csv"))?);
    write!(file, "Barcode")?;
    for i in 1..=num_components {
        write!(file, ",{}-{i}", key.to_uppercase())?;
    }
    writeln!(file)?;
    for i in 0..num_bcs {
        write!(file, "{}", barcodes[i])?;
        for j in 0..num_components {
            write!(file, ",{}", embedding[[i, j]])?;
        }
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

/// Unstructured results as one JSON object.
pub fn save_uns(path: &Path, uns: &BTreeMap<String, UnsValue>) -> Result<()> {
    create_dir_all(path)?;
    let file = BufWriter::new(File::create(path.join("summary.json"))?);
    serde_json::to_writer_pretty(file, uns)?;
    Ok(())
}
