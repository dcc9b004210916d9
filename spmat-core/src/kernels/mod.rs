//! Kernel variants, their launch arguments and the device-resident matrix
//! layouts they read.

pub(crate) mod host;
pub(crate) mod wgsl;

use crate::device::Device;
use crate::traits::Real;

/// The kernels a device has to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelVariant {
    /// `y = alpha * A * x`, A in CSR.
    CsrSet,
    /// `y += alpha * A * x`, A in CSR.
    CsrAdd,
    /// `y = alpha * A * x`, A in hybrid ELL + CSR.
    HellSet,
    /// `y += alpha * A * x`, A in hybrid ELL + CSR.
    HellAdd,
    /// `out[i] = vals[cols[i]]`.
    Gather,
    /// `y[i] = value`.
    Fill,
}

impl KernelVariant {
    pub fn name(self) -> &'static str {
        match self {
            KernelVariant::CsrSet => "spmv_csr_set",
            KernelVariant::CsrAdd => "spmv_csr_add",
            KernelVariant::HellSet => "spmv_hell_set",
            KernelVariant::HellAdd => "spmv_hell_add",
            KernelVariant::Gather => "gather_vals_to_send",
            KernelVariant::Fill => "fill",
        }
    }

    pub fn csr(append: bool) -> Self {
        if append {
            KernelVariant::CsrAdd
        } else {
            KernelVariant::CsrSet
        }
    }

    pub fn hell(append: bool) -> Self {
        if append {
            KernelVariant::HellAdd
        } else {
            KernelVariant::HellSet
        }
    }

    /// Whether the multiply accumulates into `y`.
    pub fn appends(self) -> bool {
        matches!(self, KernelVariant::CsrAdd | KernelVariant::HellAdd)
    }
}

/// A CSR triple resident on a device.
#[derive(Debug)]
pub struct CsrBuffers<T: Real, D: Device> {
    pub nnz: usize,
    pub row: D::Buffer<u32>,
    pub col: D::Buffer<u32>,
    pub val: D::Buffer<T>,
}

/// Hybrid layout resident on a device: an ELL slab of uniform width stored
/// column-major (`ell[k * rows + i]`) plus a CSR triple for the overflow.
#[derive(Debug)]
pub struct HellBuffers<T: Real, D: Device> {
    pub width: usize,
    pub ell_col: D::Buffer<u32>,
    pub ell_val: D::Buffer<T>,
    pub csr: CsrBuffers<T, D>,
}

/// Arguments of one kernel launch. The variant of the cached kernel must
/// agree with the argument kind.
pub enum KernelArgs<'a, T: Real, D: Device> {
    Csr {
        rows: usize,
        matrix: &'a CsrBuffers<T, D>,
        x: &'a D::Buffer<T>,
        y: &'a D::Buffer<T>,
        alpha: T,
    },
    Hell {
        rows: usize,
        matrix: &'a HellBuffers<T, D>,
        x: &'a D::Buffer<T>,
        y: &'a D::Buffer<T>,
        alpha: T,
    },
    Gather {
        len: usize,
        vals: &'a D::Buffer<T>,
        cols: &'a D::Buffer<u32>,
        out: &'a D::Buffer<T>,
    },
    Fill {
        len: usize,
        y: &'a D::Buffer<T>,
        value: T,
    },
}

impl<T: Real, D: Device> KernelArgs<'_, T, D> {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelArgs::Csr { .. } => "csr",
            KernelArgs::Hell { .. } => "hell",
            KernelArgs::Gather { .. } => "gather",
            KernelArgs::Fill { .. } => "fill",
        }
    }

    /// Checks the launched kernel against the argument kind.
    pub fn accepts(&self, variant: KernelVariant) -> bool {
        matches!(
            (self, variant),
            (KernelArgs::Csr { .. }, KernelVariant::CsrSet | KernelVariant::CsrAdd)
                | (KernelArgs::Hell { .. }, KernelVariant::HellSet | KernelVariant::HellAdd)
                | (KernelArgs::Gather { .. }, KernelVariant::Gather)
                | (KernelArgs::Fill { .. }, KernelVariant::Fill)
        )
    }
}

/// Padding marker in the ELL slab.
pub const ELL_PAD: u32 = u32::MAX;
