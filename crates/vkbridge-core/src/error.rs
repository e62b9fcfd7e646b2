use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("real driver library not found (tried: {0})")]
    DriverNotFound(String),

    #[error("real driver is missing entry point: {0}")]
    MissingEntryPoint(&'static str),

    #[error("wrapper allocation failed")]
    WrapperAlloc,

    #[error("handle was never wrapped: {0:#x}")]
    UnknownHandle(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("driver call failed: {0:?}")]
    Driver(vk::Result),
}

impl BridgeError {
    /// The status reported across the C boundary for this error.
    pub fn to_vk(&self) -> vk::Result {
        match self {
            BridgeError::DriverNotFound(_) | BridgeError::MissingEntryPoint(_) => {
                vk::Result::ERROR_INITIALIZATION_FAILED
            }
            BridgeError::WrapperAlloc => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            BridgeError::UnknownHandle(_) => vk::Result::ERROR_UNKNOWN,
            BridgeError::Config(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            BridgeError::Driver(r) => *r,
        }
    }
}

/// True for the fatal status class that indicates the driver considers
/// itself unrecoverable.
pub fn is_device_loss(result: vk::Result) -> bool {
    result == vk::Result::ERROR_DEVICE_LOST
}

/// Downgrade a device-loss status from an allocation, mapping, or resource
/// creation call to a recoverable out-of-memory status.
///
/// Under the translation layers a device-loss report from these call sites
/// is a resource-pressure artifact, not a genuinely dead device; returning
/// it verbatim aborts clients that would otherwise retry with a smaller
/// request. `diagnose` is a best-effort device-fault query, invoked once
/// per fatal event; its own failures are swallowed.
pub fn soften_device_loss(result: vk::Result, diagnose: impl FnOnce()) -> vk::Result {
    if is_device_loss(result) {
        diagnose();
        tracing::warn!("downgrading DEVICE_LOST to OUT_OF_DEVICE_MEMORY");
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soften_only_device_loss() {
        let mut diagnosed = false;
        let r = soften_device_loss(vk::Result::ERROR_DEVICE_LOST, || diagnosed = true);
        assert_eq!(r, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(diagnosed);

        let mut diagnosed = false;
        let r = soften_device_loss(vk::Result::ERROR_OUT_OF_HOST_MEMORY, || diagnosed = true);
        assert_eq!(r, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(!diagnosed);

        let r = soften_device_loss(vk::Result::SUCCESS, || {});
        assert_eq!(r, vk::Result::SUCCESS);
    }
}
