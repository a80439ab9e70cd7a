//! Settings hot reload
//!
//! The file is polled on an interval. A changed file that parses and
//! validates becomes a new `Arc<Settings>` snapshot on a `watch` channel;
//! anything else is logged and the previous snapshot stays current.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Result, Settings, SettingsOverrides};

pub struct SettingsWatcher {
    rx: watch::Receiver<Arc<Settings>>,
    handle: JoinHandle<()>,
}

impl SettingsWatcher {
    /// Watch `path`, starting from `initial` and polling every
    /// `initial.reload_interval()`.
    pub fn spawn(path: PathBuf, initial: Settings, overrides: SettingsOverrides) -> Self {
        let interval = initial.reload_interval();
        Self::spawn_with_interval(path, initial, overrides, interval)
    }

    pub fn spawn_with_interval(
        path: PathBuf,
        initial: Settings,
        overrides: SettingsOverrides,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(Arc::new(initial));
        let handle = tokio::spawn(poll_settings(path, overrides, interval, tx));
        Self { rx, handle }
    }

    /// The snapshot in effect right now
    pub fn current(&self) -> Arc<Settings> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.rx.clone()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for SettingsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_settings(
    path: PathBuf,
    overrides: SettingsOverrides,
    interval: Duration,
    tx: watch::Sender<Arc<Settings>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_content: Option<String> = None;

    loop {
        ticker.tick().await;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("Settings file {:?} not readable: {}", path, e);
                continue;
            }
        };
        if last_content.as_deref() == Some(content.as_str()) {
            continue;
        }

        let reloaded = reload(&content, &path, &overrides);
        last_content = Some(content);

        match reloaded {
            Ok(settings) => {
                if **tx.borrow() == settings {
                    continue;
                }
                info!("Settings reloaded from {:?}", path);
                if tx.send(Arc::new(settings)).is_err() {
                    debug!("No settings subscribers left, stopping watcher");
                    return;
                }
            }
            Err(e) => warn!("Ignoring invalid settings in {:?}: {}", path, e),
        }
    }
}

fn reload(content: &str, path: &std::path::Path, overrides: &SettingsOverrides) -> Result<Settings> {
    let mut settings = Settings::from_json(content)?;
    settings.set_config_path(path.to_path_buf());
    settings.apply_overrides(overrides);
    settings.validate()?;
    Ok(settings)
}
