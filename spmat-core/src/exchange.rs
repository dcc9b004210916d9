//! Discovery of ghost columns and the cross-device exchange layout.
//!
//! A ghost column of device `d` is a column referenced by a row in `d`'s row
//! band but lying outside `d`'s column band. Its value has to be fetched from
//! the device that owns it before the remote part of the matrix can be
//! applied.

use rayon::prelude::*;
use std::collections::BTreeSet;

/// Ghost column sets for every device, in device order.
pub type GhostSets = Vec<BTreeSet<usize>>;

/// Computes `GhostColumnSet(d)` for each device.
///
/// Devices are scanned independently and in parallel. Returns empty sets for
/// a single device: there is nothing to exchange.
pub fn ghost_columns(
    row_part: &[usize],
    col_part: &[usize],
    row_ptr: &[usize],
    col_indices: &[usize],
) -> GhostSets {
    let nd = row_part.len() - 1;
    if nd <= 1 {
        return vec![BTreeSet::new(); nd];
    }

    (0..nd)
        .into_par_iter()
        .map(|d| {
            let (xbeg, xend) = (col_part[d], col_part[d + 1]);
            let beg = row_ptr[row_part[d]];
            let end = row_ptr[row_part[d + 1]];
            col_indices[beg..end]
                .iter()
                .copied()
                .filter(|&c| c < xbeg || c >= xend)
                .collect()
        })
        .collect()
}

/// Host-side description of who sends which values to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeLayout {
    /// Sorted, duplicate-free union of all ghost sets.
    pub cols_to_send: Vec<usize>,
    /// `cols_to_send[cidx[d]..cidx[d + 1]]` is the slice owned by device `d`.
    pub cidx: Vec<usize>,
    /// Per device: positions into `cols_to_send` the device needs, ascending.
    pub cols_to_recv: Vec<Vec<usize>>,
}

impl ExchangeLayout {
    /// Builds the layout, or `None` when nothing has to move between devices.
    pub fn build(col_part: &[usize], ghosts: &GhostSets) -> Option<Self> {
        let nd = col_part.len() - 1;
        if nd <= 1 {
            return None;
        }

        let all: BTreeSet<usize> = ghosts.iter().flatten().copied().collect();
        if all.is_empty() {
            return None;
        }
        let cols_to_send: Vec<usize> = all.into_iter().collect();

        let cols_to_recv = ghosts
            .par_iter()
            .map(|set| {
                cols_to_send
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| set.contains(*c))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        // Both the list and the column partition are sorted, so each device's
        // share is the contiguous run starting at the first column in its band.
        let mut cidx = Vec::with_capacity(nd + 1);
        let mut from = 0;
        for &bound in col_part {
            from += cols_to_send[from..].partition_point(|&c| c < bound);
            cidx.push(from);
        }
        cidx[nd] = cols_to_send.len();

        log::debug!(
            "exchange layout: {} ghost values, send slices {:?}",
            cols_to_send.len(),
            cidx
        );

        Some(Self {
            cols_to_send,
            cidx,
            cols_to_recv,
        })
    }

    /// Number of values device `d` supplies to the others.
    pub fn send_count(&self, d: usize) -> usize {
        self.cidx[d + 1] - self.cidx[d]
    }

    /// Column indices device `d` must gather, rebased into its column band.
    pub fn local_send_columns(&self, d: usize, col_part: &[usize]) -> Vec<usize> {
        self.cols_to_send[self.cidx[d]..self.cidx[d + 1]]
            .iter()
            .map(|&c| c - col_part[d])
            .collect()
    }

    /// Total number of values staged on the host per multiply.
    pub fn len(&self) -> usize {
        self.cols_to_send.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols_to_send.is_empty()
    }
}
