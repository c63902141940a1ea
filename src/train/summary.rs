//! Sinks for training scalars and sample matrices.

use anyhow::{bail, Result};
use safetensors::Dtype;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for per-iteration scalars and rendered matrices.
pub trait SummaryWriter {
    /// Record a scalar value under `tag`.
    fn scalar(&mut self, tag: &str, iteration: usize, value: f32) -> Result<()>;
    /// Record a row-major `[rows, cols]` matrix under `tag`.
    fn matrix(
        &mut self,
        tag: &str,
        iteration: usize,
        rows: usize,
        cols: usize,
        values: &[f32],
    ) -> Result<()>;
}

/// Writes summaries through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSummaryWriter;

impl SummaryWriter for LogSummaryWriter {
    fn scalar(&mut self, tag: &str, iteration: usize, value: f32) -> Result<()> {
        log::info!("[{iteration}] {tag} = {value:.6}");
        Ok(())
    }

    fn matrix(
        &mut self,
        tag: &str,
        iteration: usize,
        rows: usize,
        cols: usize,
        _values: &[f32],
    ) -> Result<()> {
        log::debug!("[{iteration}] {tag}: {rows}x{cols} matrix");
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    iteration: usize,
    value: f32,
}

/// Appends scalars to `scalars.jsonl` and writes matrices as safetensors files
/// under `samples/` in the log directory.
#[derive(Debug)]
pub struct FileSummaryWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl FileSummaryWriter {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("samples"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scalars.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
        })
    }

    /// Path a matrix with this tag and iteration is written to.
    pub fn matrix_path(&self, tag: &str, iteration: usize) -> PathBuf {
        let stem = tag.replace('/', "_");
        self.dir
            .join("samples")
            .join(format!("{stem}_{iteration}.safetensors"))
    }
}

impl SummaryWriter for FileSummaryWriter {
    fn scalar(&mut self, tag: &str, iteration: usize, value: f32) -> Result<()> {
        let line = serde_json::to_string(&ScalarRecord {
            tag,
            iteration,
            value,
        })?;
        writeln!(self.scalars, "{line}")?;
        self.scalars.flush()?;
        Ok(())
    }

    fn matrix(
        &mut self,
        tag: &str,
        iteration: usize,
        rows: usize,
        cols: usize,
        values: &[f32],
    ) -> Result<()> {
        let path = self.matrix_path(tag, iteration);
        write_matrix(&path, "values", rows, cols, values)
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySummaryWriter {
    pub scalars: Vec<(String, usize, f32)>,
    /// Tag, iteration and shape of each matrix.
    pub matrices: Vec<(String, usize, usize, usize)>,
}

impl MemorySummaryWriter {
    /// All values recorded under `tag`, in order.
    pub fn scalar_values(&self, tag: &str) -> Vec<f32> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, _, v)| *v)
            .collect()
    }
}

impl SummaryWriter for MemorySummaryWriter {
    fn scalar(&mut self, tag: &str, iteration: usize, value: f32) -> Result<()> {
        self.scalars.push((tag.to_string(), iteration, value));
        Ok(())
    }

    fn matrix(
        &mut self,
        tag: &str,
        iteration: usize,
        rows: usize,
        cols: usize,
        values: &[f32],
    ) -> Result<()> {
        if values.len() != rows * cols {
            bail!("{tag}: {} values do not fill {rows}x{cols}", values.len());
        }
        self.matrices.push((tag.to_string(), iteration, rows, cols));
        Ok(())
    }
}

/// Save a row-major `[rows, cols]` F32 matrix as a single-tensor safetensors file.
pub fn write_matrix(
    path: &Path,
    name: &str,
    rows: usize,
    cols: usize,
    values: &[f32],
) -> Result<()> {
    if values.len() != rows * cols {
        bail!("{} values do not fill a {rows}x{cols} matrix", values.len());
    }
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let view = safetensors::tensor::TensorView::new(Dtype::F32, vec![rows, cols], &bytes)?;
    let mut tensors = HashMap::new();
    tensors.insert(name.to_string(), view);
    let serialized = safetensors::serialize(&tensors, &None)?;
    fs::write(path, serialized)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_appends_scalars_and_writes_matrices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = FileSummaryWriter::create(dir.path()).expect("writer");
        writer.scalar("training/loss", 3, 0.25).expect("scalar");
        writer
            .matrix("samples/alignment", 3, 2, 2, &[1.0, 0.0, 0.0, 1.0])
            .expect("matrix");

        let scalars = fs::read_to_string(dir.path().join("scalars.jsonl")).expect("scalars");
        assert!(scalars.contains("\"training/loss\""));
        assert!(writer.matrix_path("samples/alignment", 3).exists());
    }

    #[test]
    fn matrix_shape_is_checked() {
        let mut writer = MemorySummaryWriter::default();
        assert!(writer.matrix("m", 0, 2, 3, &[0.0; 5]).is_err());
        writer.scalar("a", 0, 1.0).expect("scalar");
        writer.scalar("a", 1, 2.0).expect("scalar");
        assert_eq!(writer.scalar_values("a"), vec![1.0, 2.0]);
    }
}
