//! # Sparse Matrix Core Library
//!
//! Distributes a sparse matrix over several compute devices by row bands and
//! multiplies it by distributed vectors, exchanging the values of columns that
//! cross band boundaries through the host.

pub mod config;
pub(crate) mod context;
pub mod device;
pub mod error;
pub mod exchange;
pub mod kernel_cache;
pub mod kernels;
pub mod partition;
pub mod perf;
pub mod sparse_matrix;
pub mod spmat;
pub mod store;
pub mod traits;
pub mod vector;

pub use config::{Config, CpuDeviceConfig, GpuDeviceConfig, PartitionConfig, SpMatConfig};
pub use device::{CpuDevice, Device, DeviceClass, DeviceSet, GpuDevice};
pub use error::{Result, SpmvError};
pub use sparse_matrix::{CsrMatrix, Triplet};
pub use spmat::SpMat;
pub use store::StorageFormat;
pub use vector::DistVector;

pub use traits::{Matrix, Real, Vector};
