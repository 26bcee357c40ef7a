//! Where generated images are written.
//!
//! Samples go to `<outdir>/<sanitized prompt>/seed_<seed>_<count>.png`, the
//! count continuing from the number of entries already in that directory.
//! `latest.png` always holds the last sample and grids are written to
//! `<outdir>/grid-<count>.png`.
use std::path::{Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct OutputLayout {
    outdir: PathBuf,
    sample_dir: PathBuf,
    base_count: usize,
    grid_count: usize,
}

fn count_entries(dir: &Path) -> anyhow::Result<usize> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("error listing {:?}", dir.to_string_lossy()))?;
    Ok(entries.count())
}

impl OutputLayout {
    /// Creates the output directories and picks up the existing counts.
    pub fn prepare<P: AsRef<Path>>(outdir: P, prompt: &str) -> anyhow::Result<Self> {
        let outdir = outdir.as_ref().to_path_buf();
        let sample_dir = outdir.join(crate::prompt::sanitize_for_path(prompt)?);
        std::fs::create_dir_all(&sample_dir)
            .with_context(|| format!("error creating {:?}", sample_dir.to_string_lossy()))?;
        let base_count = count_entries(&sample_dir)?;
        // The sample directory itself is not a grid.
        let grid_count = count_entries(&outdir)?.saturating_sub(1);
        Ok(Self { outdir, sample_dir, base_count, grid_count })
    }

    pub fn sample_dir(&self) -> &Path {
        &self.sample_dir
    }

    /// The path for the next sample, each call moves to the next count.
    pub fn next_sample_path(&mut self, seed: u64) -> PathBuf {
        let path = self.sample_dir.join(format!("seed_{seed}_{:05}.png", self.base_count));
        self.base_count += 1;
        path
    }

    pub fn latest_path(&self) -> PathBuf {
        self.sample_dir.join("latest.png")
    }

    pub fn grid_path(&self) -> PathBuf {
        self.outdir.join(format!("grid-{:04}.png", self.grid_count))
    }
}
