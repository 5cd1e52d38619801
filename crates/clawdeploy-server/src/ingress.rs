use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::models::instance::{Instance, InstanceStatus};
use crate::rebuild::run_command;
use crate::store::InstanceStore;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Regenerates the reverse proxy's instance-to-port routing.
#[async_trait]
pub trait IngressSync: Send + Sync {
    async fn sync(&self) -> anyhow::Result<()>;
}

pub struct NginxIngress {
    store: Arc<dyn InstanceStore>,
    map_path: PathBuf,
    reload: bool,
}

impl NginxIngress {
    pub fn new(store: Arc<dyn InstanceStore>, map_path: impl Into<PathBuf>, reload: bool) -> Self {
        Self {
            store,
            map_path: map_path.into(),
            reload,
        }
    }
}

/// One `<id> <port>;` line per running instance with a port, sorted by id.
pub fn render_port_map(instances: &[Instance]) -> String {
    let mut entries: Vec<(&str, u16)> = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .filter_map(|i| i.host_port().map(|port| (i.id.as_str(), port)))
        .collect();
    entries.sort();

    let mut out = String::new();
    for (id, port) in entries {
        out.push_str(&format!("{id} {port};\n"));
    }
    out
}

async fn write_atomically(path: &Path, contents: &str) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[async_trait]
impl IngressSync for NginxIngress {
    async fn sync(&self) -> anyhow::Result<()> {
        let running = self
            .store
            .list_with_status(&[InstanceStatus::Running])
            .await
            .context("list running instances")?;
        let map = render_port_map(&running);
        write_atomically(&self.map_path, &map).await?;
        debug!(path = %self.map_path.display(), entries = running.len(), "wrote ingress port map");

        if self.reload {
            run_command("nginx", &["-s", "reload"], Path::new("/"), RELOAD_TIMEOUT)
                .await
                .context("reload nginx")?;
            info!("reloaded nginx");
        }
        Ok(())
    }
}
