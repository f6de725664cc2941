//! Labeled embedding export for external projection and plotting.
//!
//! An [`EmbeddingTable`] holds one `(label, embedding)` row per pool entry,
//! in pool order, and persists to Parquet.

use std::path::Path;
use std::sync::Arc;

use arrow::array::*;
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::dataset::{Label, Pool};
use crate::inference::embed_indices;
use crate::model::embedding_net::EmbeddingNet;

/// Labels and embeddings of a whole pool.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    labels: Vec<Label>,
    embeddings: Vec<Vec<f32>>,
    dim: usize,
}

impl EmbeddingTable {
    /// Build a table from parallel label and embedding lists.
    ///
    /// # Errors
    /// Fails if the lists differ in length or embeddings differ in dimension.
    pub fn new(labels: Vec<Label>, embeddings: Vec<Vec<f32>>) -> anyhow::Result<Self> {
        if labels.len() != embeddings.len() {
            anyhow::bail!(
                "{} labels but {} embeddings",
                labels.len(),
                embeddings.len()
            );
        }
        let dim = embeddings.first().map(Vec::len).unwrap_or(0);
        if let Some((i, e)) = embeddings.iter().enumerate().find(|(_, e)| e.len() != dim) {
            anyhow::bail!("Embedding {i} has dimension {}, expected {dim}", e.len());
        }
        Ok(Self {
            labels,
            embeddings,
            dim,
        })
    }

    /// Embed every image of `pool` in batches, with a progress bar.
    pub fn compute<B: Backend>(
        model: &EmbeddingNet<B>,
        pool: &Pool,
        batch_size: usize,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        let total = pool.len();
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) Embedding pool")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );

        let indices: Vec<usize> = (0..total).collect();
        let mut embeddings = Vec::with_capacity(total);
        for chunk in indices.chunks(batch_size.max(1)) {
            embeddings.extend(embed_indices(model, pool, chunk, chunk.len(), device));
            pb.inc(chunk.len() as u64);
        }
        pb.finish_with_message("done");

        Self::new(pool.labels(), embeddings)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Embedding dimension (0 for an empty table).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    /// Save to Parquet with schema `label: UInt8`, `embedding: List<Float32>`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let schema = Arc::new(embedding_table_schema());

        let mut values = Vec::with_capacity(self.len() * self.dim);
        let mut offsets = Vec::with_capacity(self.len() + 1);
        offsets.push(0i32);
        for emb in &self.embeddings {
            values.extend_from_slice(emb);
            offsets.push(values.len() as i32);
        }

        let label_array = UInt8Array::from(self.labels.clone());
        let list_array = ListArray::new(
            Arc::new(Field::new("item", DataType::Float32, false)),
            OffsetBuffer::new(offsets.into()),
            Arc::new(Float32Array::from(values)),
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(label_array), Arc::new(list_array)],
        )?;

        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        tracing::info!(
            rows = self.len(),
            dim = self.dim,
            path = %path.display(),
            "Saved embeddings to Parquet"
        );
        Ok(())
    }

    /// Load a table written by [`EmbeddingTable::save`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut labels = Vec::new();
        let mut embeddings = Vec::new();

        for batch_result in reader {
            let batch = batch_result?;

            let label_col = batch
                .column(0)
                .as_any()
                .downcast_ref::<UInt8Array>()
                .ok_or_else(|| anyhow::anyhow!("Column 0 is not UInt8Array"))?;
            let lists = batch
                .column(1)
                .as_any()
                .downcast_ref::<ListArray>()
                .ok_or_else(|| anyhow::anyhow!("Column 1 is not ListArray"))?;

            for i in 0..batch.num_rows() {
                let values = lists.value(i);
                let floats = values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| anyhow::anyhow!("List values are not Float32Array"))?;
                labels.push(label_col.value(i));
                embeddings.push(floats.values().to_vec());
            }
        }

        let table = Self::new(labels, embeddings)
            .map_err(|e| anyhow::anyhow!("Invalid embedding file {}: {e}", path.display()))?;

        tracing::info!(
            rows = table.len(),
            dim = table.dim,
            path = %path.display(),
            "Loaded embeddings from Parquet"
        );
        Ok(table)
    }
}

fn embedding_table_schema() -> Schema {
    Schema::new(vec![
        Field::new("label", DataType::UInt8, false),
        Field::new(
            "embedding",
            DataType::List(Arc::new(Field::new("item", DataType::Float32, false))),
            false,
        ),
    ])
}
