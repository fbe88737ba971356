use thiserror::Error;

/// Domain error kinds for the sensor/forecast core.
///
/// Per-frame decode rejections never reach this type; they are logged and
/// counted at the point of rejection (see `decoder::reject`).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("BLE adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("time-series store unreachable after retries: {0}")]
    StoreUnreachable(String),

    #[error("time-series store rejected the request: {0}")]
    StoreRejected(String),

    #[error("frame decode rejected: {0}")]
    DecodeRejected(String),

    #[error("forecast provider unavailable: {0}")]
    UpstreamDown(String),

    #[error("buffer overflow, oldest samples discarded: {0}")]
    BufferOverflow(String),

    #[error("not connected to store")]
    NotConnected,

    #[error("scanner already running")]
    ScannerBusy,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Errors that should terminate the process rather than degrade.
    /// Checked by `main` after a task handle resolves, and by
    /// `SensorPipeline::run` to decide whether to propagate instead of
    /// backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::ConfigInvalid(_) | AppError::StoreRejected(_))
    }

    /// Ends the sensor pipeline task specifically (the adapter itself is
    /// gone or unusable) without being fatal to the whole process — the
    /// orchestrator's forecast side keeps running.
    pub fn ends_pipeline(&self) -> bool {
        matches!(self, AppError::AdapterUnavailable(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnreachable(_) | AppError::UpstreamDown(_) | AppError::Http(_)
        )
    }
}
