use crate::config::ConfigErrors;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Host description stored with every run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub arch: String,
    pub platform: String,
    pub cpus: usize,
}

impl HostInfo {
    pub fn collect() -> Self {
        let hostname = match nix::unistd::gethostname() {
            Ok(hostname) => hostname.to_string_lossy().into_owned(),
            Err(error) => {
                warn!(error = ?error, "Failed to retrieve hostname: {error}");
                String::new()
            }
        };

        let platform = match nix::sys::utsname::uname() {
            Ok(uname) => format!(
                "{} {}",
                uname.sysname().to_string_lossy(),
                uname.release().to_string_lossy()
            ),
            Err(error) => {
                warn!(error = ?error, "Failed to retrieve system name: {error}");
                std::env::consts::OS.to_owned()
            }
        };

        let cpus = std::thread::available_parallelism().map_or(1, |cpus| cpus.get());

        Self {
            hostname,
            arch: std::env::consts::ARCH.to_owned(),
            platform,
            cpus,
        }
    }

    /// run parameters describing this host
    pub fn parameters(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("hostname".to_owned(), self.hostname.clone()),
            ("arch".to_owned(), self.arch.clone()),
            ("platform".to_owned(), self.platform.clone()),
            ("cpus".to_owned(), self.cpus.to_string()),
        ])
    }
}

/// pin the current thread, and every process spawned from it, to `cores`
pub fn pin(cores: &[usize]) -> Result<(), ConfigErrors> {
    if cores.is_empty() {
        return Ok(());
    }

    affinity::set_thread_affinity(cores.to_vec()).map_err(|error| ConfigErrors::Affinity {
        cores: cores.to_vec(),
        reason: error.to_string(),
    })?;

    info!(cores = ?cores, "Pinned runner to cores");

    Ok(())
}
