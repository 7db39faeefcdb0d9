use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// A tensor disagrees with the shape a stage or the head declared.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("optimizer has no network bound")]
    UnboundNetwork,
    /// The bound network is borrowed elsewhere.
    #[error("bound network is already borrowed")]
    NetworkBusy,
    #[error("{context}: forward must run before gradients")]
    MissingForward { context: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("stage {index}: {source}")]
    Stage {
        index: usize,
        #[source]
        source: Box<NetError>,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NetError {
    pub fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        NetError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub fn in_stage(self, index: usize) -> Self {
        NetError::Stage {
            index,
            source: Box::new(self),
        }
    }
}
