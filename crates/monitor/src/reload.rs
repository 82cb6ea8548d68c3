//! Recarga a quente do config.toml.
//!
//! O arquivo é verificado periodicamente pela data de modificação. Uma
//! edição inválida é rejeitada e a configuração anterior continua valendo.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ups_core::AppConfig;

pub struct ConfigReloader {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// Nova configuração, se o arquivo mudou desde a última verificação
    /// e é válido.
    pub fn poll(&mut self) -> Option<AppConfig> {
        let current = modified(&self.path)?;
        if self.last_modified == Some(current) {
            return None;
        }
        self.last_modified = Some(current);

        match AppConfig::try_load(&self.path) {
            Ok(config) => {
                for issue in config.rule_issues() {
                    warn!("Regra incompleta: {issue}");
                }
                Some(config)
            }
            Err(e) => {
                warn!("Recarga rejeitada, mantendo configuração anterior: {e}");
                None
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Verifica o arquivo a cada `every` e publica configurações novas em `sender`.
pub fn spawn_reloader(
    path: PathBuf,
    sender: watch::Sender<Arc<AppConfig>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut reloader = ConfigReloader::new(path);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(config) = reloader.poll() {
                        info!("Configuração recarregada de {}", reloader.path.display());
                        sender.send_replace(Arc::new(config));
                    }
                }
            }
        }
    })
}
