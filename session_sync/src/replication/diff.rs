use std::fmt;

use sensor_ingest::models::manifest::{ChunkEntry, FinalFile};

use crate::replication::{read::Current, want::Wanted};

/// What needs to happen to make the local mirror == remote session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDiff {
    /// Remote chunks with no local file, in index order.
    pub missing: Vec<ChunkEntry>,
    /// Local files whose size disagrees with the remote manifest.
    pub replace: Vec<ChunkEntry>,
    /// Remote chunks already mirrored.
    pub present: usize,
    /// Set once the remote is finished: the consolidated file to end up with.
    pub finalize: Option<FinalFile>,
    /// The local mirror is already final.
    pub finalized: bool,
}

impl ChunkDiff {
    /// True if there is nothing to download or finalize.
    pub fn is_noop(&self) -> bool {
        self.missing.is_empty() && self.replace.is_empty() && self.finalize.is_none()
    }

    /// Chunks to fetch this pass, in index order.
    pub fn downloads(&self) -> Vec<&ChunkEntry> {
        let mut out: Vec<&ChunkEntry> = self.missing.iter().chain(&self.replace).collect();
        out.sort_by_key(|c| c.index);
        out
    }

    pub fn backlog(&self) -> usize {
        self.missing.len() + self.replace.len()
    }
}

fn section(f: &mut fmt::Formatter<'_>, first: &mut bool, title: &str) -> fmt::Result {
    if !*first {
        writeln!(f)?;
    }
    *first = false;
    writeln!(f, "{title}")?;
    writeln!(f, "{}", "-".repeat(title.len()))
}

impl fmt::Display for ChunkDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        if !self.missing.is_empty() {
            section(f, &mut first, "Chunks to download")?;
            for c in &self.missing {
                writeln!(
                    f,
                    "+ {}  {} B  rows {}..{}",
                    c.name, c.size, c.row_start, c.row_end
                )?;
            }
        }
        if !self.replace.is_empty() {
            section(f, &mut first, "Chunks to replace (size mismatch)")?;
            for c in &self.replace {
                writeln!(f, "~ {}  expected {} B", c.name, c.size)?;
            }
        }
        if let Some(ff) = &self.finalize {
            section(f, &mut first, "Finalize")?;
            let short = ff.sha256.get(..12).unwrap_or(&ff.sha256);
            writeln!(f, "= {}  {} rows  sha256 {short}", ff.name, ff.row_count)?;
        }

        match (first, self.finalized) {
            (true, true) => write!(f, "No changes (mirror finalized)"),
            (true, false) => write!(f, "No changes"),
            _ => Ok(()),
        }
    }
}

pub fn make_diff(w: &Wanted, c: &Current) -> ChunkDiff {
    if c.finalized {
        return ChunkDiff {
            present: w.manifest.chunks.len(),
            finalized: true,
            ..Default::default()
        };
    }

    let mut d = ChunkDiff::default();
    for (index, entry) in &w.chunks {
        match c.chunks.get(index) {
            Some((_, size)) if *size == entry.size => d.present += 1,
            Some(_) => d.replace.push(entry.clone()),
            None => d.missing.push(entry.clone()),
        }
    }
    if w.is_finished() {
        d.finalize = w.final_file.clone();
    }
    d
}
