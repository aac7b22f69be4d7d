use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("unknown {kind} handle: {raw:#x}")]
    UnknownHandle { kind: &'static str, raw: u64 },

    #[error("command buffer {handle:#x} is {found}, expected {expected}")]
    InvalidState {
        handle: u64,
        expected: &'static str,
        found: &'static str,
    },

    #[error("driver call failed: {0}")]
    Driver(#[from] vk::Result),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LayerError {
    /// The `vk::Result` the intercepting shim should hand back to the
    /// application for this error.
    pub fn vk_result(&self) -> vk::Result {
        match self {
            LayerError::Driver(res) => *res,
            LayerError::UnknownHandle { .. } | LayerError::InvalidState { .. } => {
                vk::Result::ERROR_UNKNOWN
            }
            LayerError::Config(_) | LayerError::Io(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}

/// Report a contract violation: a call the graphics API forbids in the
/// current state. Fatal in debug builds, logged and turned into an
/// `InvalidState` error in release.
#[macro_export]
macro_rules! contract_violation {
    ($handle:expr, $expected:expr, $found:expr) => {{
        ::tracing::error!(
            handle = $handle,
            expected = $expected,
            found = $found,
            "contract violation"
        );
        if cfg!(debug_assertions) {
            panic!(
                "contract violation on {:#x}: expected {}, found {}",
                $handle, $expected, $found
            );
        }
        $crate::error::LayerError::InvalidState {
            handle: $handle,
            expected: $expected,
            found: $found,
        }
    }};
}
