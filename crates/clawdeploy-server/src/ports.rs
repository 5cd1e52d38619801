use std::ops::Range;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::runtime::{ContainerRuntime, ContainerSpec, CreatedContainer, RuntimeError};

pub const DEFAULT_PORT_RANGE: Range<u16> = 10_000..20_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Optimistic host-port picker. There is no reservation table: a random port
/// is tried and a conflict reported by the engine triggers another draw.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            range: DEFAULT_PORT_RANGE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PortAllocator {
    pub fn new(range: Range<u16>, max_attempts: u32) -> anyhow::Result<Self> {
        if range.is_empty() {
            anyhow::bail!("port range {}..{} is empty", range.start, range.end);
        }
        if max_attempts == 0 {
            anyhow::bail!("port allocation needs at least one attempt");
        }
        Ok(Self {
            range,
            max_attempts,
        })
    }

    fn pick(&self) -> u16 {
        rand::thread_rng().gen_range(self.range.clone())
    }

    /// Creates and starts a container on a freshly drawn host port.
    ///
    /// Only [`RuntimeError::PortConflict`] is retried; any other runtime
    /// failure is returned immediately.
    pub async fn create_container(
        &self,
        runtime: &dyn ContainerRuntime,
        spec: &ContainerSpec,
    ) -> LifecycleResult<CreatedContainer> {
        for attempt in 1..=self.max_attempts {
            let port = self.pick();
            match runtime.create(spec, port).await {
                Ok(container_ref) => {
                    debug!(
                        instance_id = %spec.instance_id,
                        port,
                        attempt,
                        "allocated host port"
                    );
                    return Ok(CreatedContainer {
                        container_ref,
                        port,
                    });
                }
                Err(RuntimeError::PortConflict { port }) => {
                    warn!(
                        instance_id = %spec.instance_id,
                        port,
                        attempt,
                        "host port already allocated, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LifecycleError::PortExhaustion {
            attempts: self.max_attempts,
        })
    }
}
