//! Config/state directory discipline.
//!
//! Grounded on `wizardsardine-liana`'s `lianad/src/datadir.rs`
//! (`DataDirectory`, `lianad_rpc_socket_path`), adapted to this crate's
//! naming. Creating `<configDir>` itself (mode `0700`) and handing out the
//! well-known file paths inside it is in scope; parsing what's inside those
//! files beyond the §6 key tables is an external collaborator's job.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigDir(PathBuf);

impl ConfigDir {
    pub fn new(path: PathBuf) -> Self {
        ConfigDir(path)
    }

    /// Resolve the default config directory: `$MOLEPORT_CONFIG_DIR`, else
    /// `$XDG_CONFIG_HOME/moleport`, else `~/.config/moleport`.
    ///
    /// Tilde/home-directory expansion proper is the CLI's job; here we only
    /// consult already-expanded environment variables and `HOME`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        if let Some(p) = explicit {
            return ConfigDir(p);
        }
        if let Ok(p) = std::env::var("MOLEPORT_CONFIG_DIR") {
            return ConfigDir(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("XDG_CONFIG_HOME") {
            return ConfigDir(PathBuf::from(p).join("moleport"));
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        ConfigDir(PathBuf::from(home).join(".config").join("moleport"))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Create the directory (and parents) with mode `0700` if it doesn't
    /// exist yet.
    pub fn ensure_exists(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::fs::DirBuilder;
            use std::os::unix::fs::DirBuilderExt;
            if self.0.exists() {
                return Ok(());
            }
            DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(&self.0)
        }
        #[cfg(not(unix))]
        {
            std::fs::create_dir_all(&self.0)
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.0.join("moleport.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.0.join("moleport.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.0.join("daemon.log")
    }

    pub fn config_path(&self) -> PathBuf {
        self.0.join("config.yaml")
    }

    pub fn state_path(&self) -> PathBuf {
        self.0.join("state.yaml")
    }
}
