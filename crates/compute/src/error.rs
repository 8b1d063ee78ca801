use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no adapter satisfies the requested configuration: {0}")]
    DeviceSelection(String),
    #[error("limit `{limit}` unsupported: requested {requested}, device allows {supported}")]
    UnsupportedLimits {
        limit: &'static str,
        requested: u64,
        supported: u64,
    },
    #[error("invalid or freed index: {0}")]
    InvalidIndex(String),
    #[error("kernel compilation failed:\n{0}")]
    Compilation(String),
    #[error("binding layout mismatch: {0}")]
    BindingMismatch(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
}

impl ComputeError {
    /// Stable negative status code reported by the flat `compute` surface.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -1,
            Self::DeviceSelection(_) => -2,
            Self::UnsupportedLimits { .. } => -3,
            Self::InvalidIndex(_) => -4,
            Self::Compilation(_) => -5,
            Self::BindingMismatch(_) => -6,
            Self::DeviceLost(_) => -7,
        }
    }

    /// Only device loss invalidates state; everything else can be retried
    /// after fixing the request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::DeviceLost(_))
    }
}

/// Collapses a dispatch result into `0` or a negative error code.
#[must_use]
pub fn status(result: &Result<(), ComputeError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            ComputeError::InvalidArgument(String::new()),
            ComputeError::DeviceSelection(String::new()),
            ComputeError::UnsupportedLimits { limit: "max_bind_groups", requested: 8, supported: 4 },
            ComputeError::InvalidIndex(String::new()),
            ComputeError::Compilation(String::new()),
            ComputeError::BindingMismatch(String::new()),
            ComputeError::DeviceLost(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(ComputeError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn status_maps_ok_to_zero() {
        assert_eq!(status(&Ok(())), 0);
        assert_eq!(status(&Err(ComputeError::DeviceLost("gone".into()))), -7);
    }

    #[test]
    fn only_device_loss_is_terminal() {
        assert!(!ComputeError::DeviceLost(String::new()).is_retryable());
        assert!(ComputeError::InvalidIndex(String::new()).is_retryable());
    }

    #[test]
    fn limit_message_names_the_limit() {
        let err = ComputeError::UnsupportedLimits {
            limit: "max_buffer_size",
            requested: 10,
            supported: 5,
        };
        assert!(err.to_string().contains("max_buffer_size"));
    }
}
