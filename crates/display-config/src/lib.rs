//! Configuration loading for the display engine: worker pool sizing,
//! frame-boundary policy, and per-layer defaults, loaded from a
//! `display.toml` discovered the same way the rest of the ambient stack
//! discovers its config file.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

/// `[workers]` -- how many worker threads service the op FIFO. `None`
/// means "auto": `detected_cpu_count * GUAC_DISPLAY_CPU_THREAD_FACTOR`,
/// falling back to one thread (with a warning) if the CPU count cannot be
/// determined.
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    #[serde(default)]
    pub count: Option<usize>,
}

/// `[frame]` -- whether frame boundaries must be requested explicitly by
/// the caller (`notify_frame`) rather than inferred heuristically by the
/// render thread from drawing activity alone.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    #[serde(default)]
    pub explicit_boundaries: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { explicit_boundaries: false }
    }
}

/// `[layer_defaults]` -- the initial per-layer flags new layers are
/// allocated with, before any caller override.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LayerDefaultsConfig {
    #[serde(default)]
    pub lossless: bool,
    #[serde(default = "LayerDefaultsConfig::default_opaque")]
    pub opaque: bool,
    #[serde(default = "LayerDefaultsConfig::default_search_for_copies")]
    pub search_for_copies: bool,
}

impl Default for LayerDefaultsConfig {
    fn default() -> Self {
        Self {
            lossless: false,
            opaque: Self::default_opaque(),
            search_for_copies: Self::default_search_for_copies(),
        }
    }
}

impl LayerDefaultsConfig {
    const fn default_opaque() -> bool {
        true
    }
    const fn default_search_for_copies() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub layer_defaults: LayerDefaultsConfig,
}

/// The resolved, effective configuration for a single display instance.
///
/// Mirrors the raw parsed `ConfigFile`, but exposes the values the rest of
/// the engine actually reads under names that match where they're used
/// (`worker_count`, `explicit_frame_boundaries`, ...) rather than the TOML
/// table layout.
#[derive(Debug, Clone, Default)]
pub struct DisplayConfig {
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// The source path an on-disk config should be loaded from, preferring a
/// working-directory override over the platform config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("display.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("display-engine").join("display.toml");
    }
    PathBuf::from("display.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<DisplayConfig> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => Ok(DisplayConfig { raw: Some(content), file }),
            Err(error) => {
                warn!(target: "config", path = %path.display(), %error, "config_parse_failed_using_defaults");
                Ok(DisplayConfig::default())
            }
        }
    } else {
        Ok(DisplayConfig::default())
    }
}

impl DisplayConfig {
    pub fn worker_count(&self) -> Option<usize> {
        self.file.workers.count
    }

    pub fn explicit_frame_boundaries(&self) -> bool {
        self.file.frame.explicit_boundaries
    }

    pub fn default_lossless(&self) -> bool {
        self.file.layer_defaults.lossless
    }

    pub fn default_opaque(&self) -> bool {
        self.file.layer_defaults.opaque
    }

    pub fn default_search_for_copies(&self) -> bool {
        self.file.layer_defaults.search_for_copies
    }

    /// Resolves the actual number of worker threads to spawn: the explicit
    /// override if one was configured, else `detected_cpus` (falling back
    /// to a single worker, with a warning, if the CPU count could not be
    /// determined).
    pub fn resolve_worker_count(&self, detected_cpus: usize) -> usize {
        if let Some(count) = self.worker_count() {
            return count.max(1);
        }
        if detected_cpus == 0 {
            warn!(target: "config", "cpu_count_undetectable_defaulting_to_one_worker");
            return 1;
        }
        info!(target: "config", detected_cpus, "worker_count_resolved_from_cpu_count");
        detected_cpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, MutexGuard};
    use tracing::Level;
    use tracing::subscriber::with_default;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferWriter {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl BufferWriter {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
            let buf = Arc::new(Mutex::new(Vec::new()));
            (Self { inner: buf.clone() }, buf)
        }
    }

    struct LockedWriter<'a> {
        guard: MutexGuard<'a, Vec<u8>>,
    }

    impl<'a> Write for LockedWriter<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = LockedWriter<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            LockedWriter { guard: self.inner.lock().expect("log buffer poisoned") }
        }
    }

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_hopefully__.toml"))).unwrap();
        assert_eq!(cfg.worker_count(), None);
        assert!(!cfg.explicit_frame_boundaries());
        assert!(cfg.default_opaque());
        assert!(cfg.default_search_for_copies());
        assert!(!cfg.default_lossless());
    }

    #[test]
    fn parses_worker_count_override() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[workers]\ncount = 6\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.worker_count(), Some(6));
        assert_eq!(cfg.resolve_worker_count(16), 6);
    }

    #[test]
    fn auto_worker_count_follows_detected_cpus() {
        let cfg = DisplayConfig::default();
        assert_eq!(cfg.resolve_worker_count(8), 8);
    }

    #[test]
    fn undetectable_cpu_count_falls_back_to_one_with_a_warning() {
        let cfg = DisplayConfig::default();
        let (writer, buffer) = BufferWriter::new();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::WARN)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_writer(writer)
            .finish();

        let resolved = with_default(subscriber, || cfg.resolve_worker_count(0));

        assert_eq!(resolved, 1);
        let log_output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(log_output.contains("cpu_count_undetectable_defaulting_to_one_worker"));
    }

    #[test]
    fn parses_frame_and_layer_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[frame]\nexplicit_boundaries = true\n[layer_defaults]\nlossless = true\nopaque = false\nsearch_for_copies = false\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert!(cfg.explicit_frame_boundaries());
        assert!(cfg.default_lossless());
        assert!(!cfg.default_opaque());
        assert!(!cfg.default_search_for_copies());
    }

    #[test]
    fn malformed_config_falls_back_to_defaults_and_warns() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "this is not valid toml [[[").unwrap();
        let (writer, buffer) = BufferWriter::new();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::WARN)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .with_writer(writer)
            .finish();

        let cfg = with_default(subscriber, || load_from(Some(tmp.path().to_path_buf())).unwrap());

        assert_eq!(cfg.worker_count(), None);
        let log_output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(log_output.contains("config_parse_failed_using_defaults"));
    }
}
