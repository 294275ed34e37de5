//! Per-thread uniform tables.
//!
//! A running program consumes scalar parameters through uniform-load
//! signals, in exactly the order the assembly issues them. For
//! multi-threaded dispatches every hardware thread gets its own row of
//! parameters; the driver hands the program a two-word header
//! `{address of row 0, row word-count}` and each thread finds its row as
//!
//! ```text
//! row_base + thread_index * row_words * 4
//! ```
//!
//! That addressing rule is ABI between this builder and every assembled
//! program; the demo and hardware tests carry the matching unpack
//! sequence.

use super::memory::{GpuBuffer, MemoryArena};
use super::{ConfigError, DriverError};

/// A built uniform table: one row per thread plus the 2-word header the
/// dispatch points at.
pub struct UniformTable {
    rows: GpuBuffer<u32>,
    header: GpuBuffer<u32>,
    row_words: usize,
    threads: usize,
}

/// Check row-length uniformity before any device work happens.
pub(crate) fn validate_rows(rows: &[Vec<u32>]) -> Result<usize, ConfigError> {
    let first = rows.first().ok_or(ConfigError::EmptyUniformTable)?;
    for (row, words) in rows.iter().enumerate() {
        if words.len() != first.len() {
            return Err(ConfigError::MismatchedUniformRows {
                row,
                words: words.len(),
                expected: first.len(),
            });
        }
    }
    Ok(first.len())
}

impl UniformTable {
    /// Lay the rows out thread-major in GPU memory and build the header.
    pub(crate) fn build(arena: &MemoryArena, rows: &[Vec<u32>]) -> Result<UniformTable, DriverError> {
        let row_words = validate_rows(rows)?;
        let mut row_buf: GpuBuffer<u32> = arena.alloc(rows.len() * row_words)?;
        for (i, row) in rows.iter().enumerate() {
            row_buf.as_mut_slice()[i * row_words..(i + 1) * row_words].copy_from_slice(row);
        }
        let mut header: GpuBuffer<u32> = arena.alloc(2)?;
        header.write(&[row_buf.bus_address(), row_words as u32]);
        Ok(UniformTable {
            rows: row_buf,
            header,
            row_words,
            threads: rows.len(),
        })
    }

    /// Device address to pass as the starting uniform address: the
    /// program's first two uniform loads see `{row base, row words}`.
    pub fn address(&self) -> u32 {
        self.header.bus_address()
    }

    /// Words per thread row.
    pub fn row_words(&self) -> usize {
        self.row_words
    }

    /// Number of thread rows.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// The packed row storage (row-major, one row per thread).
    pub fn rows(&self) -> &GpuBuffer<u32> {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rows_uniform() {
        let rows = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        assert_eq!(validate_rows(&rows).unwrap(), 3);
    }

    #[test]
    fn test_validate_rows_mismatch() {
        let rows = vec![vec![1, 2, 3], vec![4, 5]];
        match validate_rows(&rows).unwrap_err() {
            ConfigError::MismatchedUniformRows {
                row,
                words,
                expected,
            } => {
                assert_eq!((row, words, expected), (1, 2, 3));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_validate_rows_empty() {
        assert!(matches!(
            validate_rows(&[]),
            Err(ConfigError::EmptyUniformTable)
        ));
    }
}
