use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpmvError {
    #[error("At least one compute device is required")]
    NoDevices,

    #[error("WGPU initialization failed: {0}")]
    WgpuInitError(String),

    #[error("WGPU error: {0}")]
    WgpuError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("Shader compilation error: {0}")]
    ShaderError(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("Invalid device weights: {0}")]
    InvalidWeights(String),

    #[error("Kernel {kernel} cannot be launched with {args} arguments")]
    KernelMismatch {
        kernel: &'static str,
        args: &'static str,
    },

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SpmvError>;
