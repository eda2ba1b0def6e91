//! Error types for device operations

use ash::vk;

/// Errors produced at the graphics API boundary
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// A fence or queue wait did not complete within the configured timeout
    #[error("Device wait timed out after {timeout_ns} ns")]
    Timeout {
        /// The timeout that expired, in nanoseconds
        timeout_ns: u64,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Device or pool initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl GpuError {
    /// Map a raw Vulkan result, folding the out-of-memory codes into [`GpuError::OutOfMemory`]
    pub fn from_vk(result: vk::Result, requested: u64) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory { requested }
            }
            other => Self::Api(other),
        }
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for device operations
pub type GpuResult<T> = Result<T, GpuError>;
