//! Host implementations of the kernels, executed by `CpuDevice` streams.
//!
//! Every multiply kernel splits the row range into `global_size` contiguous
//! chunks of `ceil(n / global_size)` rows; work item `id` walks its chunk in
//! ascending order. The host runs the work items one after another.

use super::ELL_PAD;
use crate::traits::Real;
use std::ops::Range;

pub(crate) fn chunk(n: usize, global_size: usize, id: usize) -> Range<usize> {
    let chunk_size = n.div_ceil(global_size.max(1));
    let start = (id * chunk_size).min(n);
    start..(start + chunk_size).min(n)
}

#[inline]
fn store<T: Real>(y: &mut T, alpha: T, sum: T, append: bool) {
    if append {
        *y = *y + alpha * sum;
    } else {
        *y = alpha * sum;
    }
}

#[inline]
fn csr_row<T: Real>(i: usize, row: &[u32], col: &[u32], val: &[T], x: &[T]) -> T {
    let mut sum = T::zero();
    for j in row[i] as usize..row[i + 1] as usize {
        sum = sum + val[j] * x[col[j] as usize];
    }
    sum
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spmv_csr<T: Real>(
    n: usize,
    global_size: usize,
    row: &[u32],
    col: &[u32],
    val: &[T],
    x: &[T],
    y: &mut [T],
    alpha: T,
    append: bool,
) {
    for id in 0..global_size {
        for i in chunk(n, global_size, id) {
            let sum = csr_row(i, row, col, val, x);
            store(&mut y[i], alpha, sum, append);
        }
    }
}

pub(crate) struct HellSlices<'a, T> {
    pub width: usize,
    pub ell_col: &'a [u32],
    pub ell_val: &'a [T],
    pub row: &'a [u32],
    pub col: &'a [u32],
    pub val: &'a [T],
}

pub(crate) fn spmv_hell<T: Real>(
    n: usize,
    global_size: usize,
    m: &HellSlices<'_, T>,
    x: &[T],
    y: &mut [T],
    alpha: T,
    append: bool,
) {
    for id in 0..global_size {
        for i in chunk(n, global_size, id) {
            let mut sum = T::zero();
            for k in 0..m.width {
                let c = m.ell_col[k * n + i];
                if c != ELL_PAD {
                    sum = sum + m.ell_val[k * n + i] * x[c as usize];
                }
            }
            sum = sum + csr_row(i, m.row, m.col, m.val, x);
            store(&mut y[i], alpha, sum, append);
        }
    }
}

pub(crate) fn gather<T: Real>(vals: &[T], cols: &[u32], out: &mut [T]) {
    for (o, &c) in out.iter_mut().zip(cols) {
        *o = vals[c as usize];
    }
}

pub(crate) fn fill<T: Real>(y: &mut [T], value: T) {
    y.iter_mut().for_each(|v| *v = value);
}
