//! Configuration file wrangling
// (c) 2024 Ross Younger

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use serde::Serialize;
use tracing::trace;

use super::Configuration;

/// Name of the per-user configuration file, looked for in the platform
/// configuration directory (e.g. `~/.config/qpx/qpx.toml`)
const USER_CONFIG_FILE: &str = "qpx.toml";

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("qpx").join(USER_CONFIG_FILE))
}

/// Processes and merges all possible configuration sources.
///
/// Sources, lowest priority first: hard-wired defaults, the user
/// configuration file (if present), any file passed to
/// [`Manager::apply_file`], then individual overrides from the command line.
#[derive(Debug)]
pub struct Manager {
    /// Configuration data
    data: Figment,
}

impl Default for Manager {
    /// Initialises with only the hard-wired defaults (used in testing)
    fn default() -> Self {
        Self {
            data: Figment::from(Serialized::defaults(Configuration::default())),
        }
    }
}

impl Manager {
    /// Initialises from the defaults and the user configuration file
    #[must_use]
    pub fn new() -> Self {
        let mut manager = Self::default();
        match user_config_path() {
            Some(path) if path.exists() => {
                manager.data = std::mem::take(&mut manager.data).merge(Toml::file(path));
            }
            Some(path) => trace!("user configuration file {path:?} not present"),
            None => trace!("could not determine user configuration file path"),
        }
        manager
    }

    /// Merges in a configuration file. The file must exist.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        anyhow::ensure!(
            path.exists(),
            "configuration file {} not found",
            path.display()
        );
        self.data = std::mem::take(&mut self.data).merge(Toml::file(path));
        Ok(())
    }

    /// Merges in a single override (typically from the command line)
    pub fn set_override<T: Serialize>(&mut self, key: &str, value: T) {
        self.data = std::mem::take(&mut self.data).merge(Serialized::default(key, value));
    }

    /// Extracts the merged configuration
    pub fn get(&self) -> Result<Configuration> {
        self.data
            .extract()
            .context("configuration is not valid")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_extract() {
        let config = Manager::default().get().unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn file_then_override_precedence() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "server = \"file.example:36712\"\nup_mbps = 20\ndown_mbps = 100"
        )?;

        let mut manager = Manager::default();
        manager.apply_file(file.path())?;
        manager.set_override("server", "cli.example:36712");

        let config = manager.get()?;
        assert_eq!(config.server, "cli.example:36712"); // CLI wins
        assert_eq!(config.up_mbps, 20); // file survives where not overridden
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut manager = Manager::default();
        assert!(manager.apply_file(Path::new("/nonexistent/qpx.toml")).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "serverr = \"typo.example:1\"")?;
        let mut manager = Manager::default();
        manager.apply_file(file.path())?;
        assert!(manager.get().is_err());
        Ok(())
    }
}
