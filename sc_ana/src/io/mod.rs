//! Reading inputs and writing results as CSV

mod csv;

pub use self::csv::{load_counts_csv, load_embedding_csv, load_metadata_csv, save_clustering, save_embedding, save_uns};
