//! Hot-reloaded bands configuration.
//!
//! The bands file is re-read on a polling interval and republished whenever
//! its content hash changes. A malformed or invalid edit never blanks the
//! bands: the previous valid snapshot stays live and the failure is logged
//! once per distinct bad content.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::infra::logging::targets;
use crate::keeper::bands::Bands;

/// Optional template expansion applied to the raw artifact before JSON
/// parsing. The actual engine (jsonnet or similar) is an external
/// collaborator; [`IdentityTemplate`] passes the content through untouched.
pub trait TemplateEngine: Send + Sync {
    fn expand(&self, raw: &str) -> Result<String, ConfigError>;
}

/// No-op template engine for plain JSON artifacts.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTemplate;

impl TemplateEngine for IdentityTemplate {
    fn expand(&self, raw: &str) -> Result<String, ConfigError> {
        Ok(raw.to_string())
    }
}

type ContentHash = [u8; 32];

/// Content-hash-polling reader of the bands file.
pub struct ReloadableConfig {
    path: PathBuf,
    template: Box<dyn TemplateEngine>,
    last_emitted: Option<ContentHash>,
    last_rejected: Option<ContentHash>,
    current: Option<Arc<Bands>>,
}

impl ReloadableConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_template(path, Box::new(IdentityTemplate))
    }

    pub fn with_template(path: impl Into<PathBuf>, template: Box<dyn TemplateEngine>) -> Self {
        Self {
            path: path.into(),
            template,
            last_emitted: None,
            last_rejected: None,
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last valid snapshot, if any content ever parsed.
    pub fn current(&self) -> Option<Arc<Bands>> {
        self.current.clone()
    }

    /// Re-read the artifact. Returns `Some` with a fresh snapshot when the
    /// content changed and validated, `None` when unchanged. Errors are
    /// returned for the caller to decide on, but the previous snapshot is
    /// never discarded; idempotent re-reads have no side effects.
    pub fn poll(&mut self) -> Result<Option<Arc<Bands>>, ConfigError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let expanded = self.template.expand(&raw)?;
        let hash: ContentHash = Sha256::digest(expanded.as_bytes()).into();

        if self.last_emitted == Some(hash) {
            return Ok(None);
        }
        if self.last_rejected == Some(hash) {
            // Already reported this exact bad content; stay quiet.
            return Ok(None);
        }

        match Bands::parse_json(&expanded) {
            Ok(bands) => {
                let snapshot = Arc::new(bands);
                let reloaded = self.last_emitted.is_some();
                self.last_emitted = Some(hash);
                self.last_rejected = None;
                self.current = Some(snapshot.clone());
                if reloaded {
                    info!(
                        target: targets::CONFIG,
                        path = %self.path.display(),
                        buy_bands = snapshot.buy_bands.len(),
                        sell_bands = snapshot.sell_bands.len(),
                        "reloaded bands configuration"
                    );
                } else {
                    info!(
                        target: targets::CONFIG,
                        path = %self.path.display(),
                        buy_bands = snapshot.buy_bands.len(),
                        sell_bands = snapshot.sell_bands.len(),
                        "loaded bands configuration"
                    );
                }
                Ok(Some(snapshot))
            }
            Err(err) => {
                self.last_rejected = Some(hash);
                warn!(
                    target: targets::CONFIG,
                    path = %self.path.display(),
                    error = %err,
                    "rejected bands configuration edit, keeping previous snapshot"
                );
                Err(err)
            }
        }
    }
}

/// Handle to the snapshot stream published by [`spawn_watcher`].
pub type BandsReceiver = watch::Receiver<Arc<Bands>>;

/// Run the config watcher as its own task, publishing snapshots through a
/// watch channel. Consumers clone the `Arc` at the top of each cycle, so a
/// cycle observes either the old or the new band set in full.
///
/// `config` must already hold a valid snapshot (the keeper loads it during
/// startup and aborts if the initial content is bad).
pub fn spawn_watcher(
    mut config: ReloadableConfig,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (BandsReceiver, tokio::task::JoinHandle<()>) {
    let initial = config
        .current()
        .expect("watcher spawned without an initial snapshot");
    let (tx, rx) = watch::channel(initial);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target: targets::CONFIG, "config watcher stopping");
                        return;
                    }
                }
            }
            match config.poll() {
                Ok(Some(snapshot)) => {
                    // Receivers only ever see whole snapshots.
                    let _ = tx.send(snapshot);
                }
                Ok(None) => {}
                Err(_) => {
                    // Already logged by poll(); previous snapshot stays live.
                }
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"{
        "buyBands": [{"minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.02,
                      "minAmount": 20, "avgAmount": 30, "maxAmount": 40, "dustCutoff": 0}],
        "sellBands": []
    }"#;

    const OVERLAPPING: &str = r#"{
        "buyBands": [],
        "sellBands": [
            {"minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.02,
             "minAmount": 1, "avgAmount": 2, "maxAmount": 3, "dustCutoff": 0},
            {"minMargin": 0.01, "avgMargin": 0.02, "maxMargin": 0.03,
             "minAmount": 1, "avgAmount": 2, "maxAmount": 3, "dustCutoff": 0}
        ]
    }"#;

    fn write_config(file: &mut tempfile::NamedTempFile, content: &str) {
        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().rewind().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_first_poll_emits_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        let snapshot = config.poll().unwrap().unwrap();
        assert_eq!(snapshot.buy_bands.len(), 1);
    }

    #[test]
    fn test_unchanged_content_emits_nothing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        config.poll().unwrap().unwrap();
        assert!(config.poll().unwrap().is_none());
        assert!(config.poll().unwrap().is_none());
    }

    #[test]
    fn test_bad_edit_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        config.poll().unwrap().unwrap();

        write_config(&mut file, OVERLAPPING);
        assert!(config.poll().is_err());
        assert_eq!(config.current().unwrap().buy_bands.len(), 1);

        // Same bad content again: no repeated error, no emission.
        assert!(config.poll().unwrap().is_none());
    }

    #[test]
    fn test_malformed_json_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        config.poll().unwrap().unwrap();

        write_config(&mut file, "{ not json");
        assert!(config.poll().is_err());
        assert!(config.current().is_some());
    }

    #[test]
    fn test_next_valid_edit_is_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        config.poll().unwrap().unwrap();

        write_config(&mut file, OVERLAPPING);
        assert!(config.poll().is_err());

        let fixed = VALID.replace("\"maxAmount\": 40", "\"maxAmount\": 50");
        write_config(&mut file, &fixed);
        let snapshot = config.poll().unwrap().unwrap();
        assert!((snapshot.buy_bands[0].max_amount - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_template_engine_runs_before_parsing() {
        struct Substitute;
        impl TemplateEngine for Substitute {
            fn expand(&self, raw: &str) -> Result<String, ConfigError> {
                Ok(raw.replace("$MAX", "40"))
            }
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, &VALID.replace("\"maxAmount\": 40", "\"maxAmount\": $MAX"));

        let mut config = ReloadableConfig::with_template(file.path(), Box::new(Substitute));
        let snapshot = config.poll().unwrap().unwrap();
        assert!((snapshot.buy_bands[0].max_amount - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_watcher_publishes_atomic_snapshots() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, VALID);

        let mut config = ReloadableConfig::new(file.path());
        config.poll().unwrap().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut rx, handle) =
            spawn_watcher(config, Duration::from_millis(20), shutdown_rx);
        assert_eq!(rx.borrow().buy_bands.len(), 1);

        let two_bands = VALID.replace(
            "\"buyBands\": [",
            "\"buyBands\": [{\"minMargin\": 0.03, \"avgMargin\": 0.04, \"maxMargin\": 0.05, \
             \"minAmount\": 1, \"avgAmount\": 2, \"maxAmount\": 3, \"dustCutoff\": 0}, ",
        );
        write_config(&mut file, &two_bands);

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("watcher did not publish in time")
            .unwrap();
        assert_eq!(rx.borrow().buy_bands.len(), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
