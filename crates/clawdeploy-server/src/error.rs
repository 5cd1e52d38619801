use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    /// Rendered exactly like `InstanceNotFound` so a foreign id discloses nothing.
    #[error("instance {0} not found")]
    Ownership(String),
    #[error("instance {0} has no container")]
    MissingContainer(String),
    #[error("instance {0} has no gateway token")]
    MissingGatewayToken(String),
    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),
    #[error("no free host port after {attempts} attempts")]
    PortExhaustion { attempts: u32 },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
    #[error("rebuild: {0:#}")]
    Rebuild(anyhow::Error),
    #[error("instance {0} is busy with another operation")]
    InstanceBusy(String),
}

impl LifecycleError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LifecycleError::InstanceNotFound(_)
                | LifecycleError::Ownership(_)
                | LifecycleError::Runtime(RuntimeError::NotFound(_))
        )
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
