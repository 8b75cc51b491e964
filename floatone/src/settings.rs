use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use floatone_store::STORE_FILE_NAME;

use crate::ipc::DEFAULT_SOCKET_PATH;

pub const STORE_ENV: &str = "FLOATONE_STORE";
pub const SOCKET_ENV: &str = "FLOATONE_SOCKET";

/// Where this process finds the store file and the bus hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub store_path: PathBuf,
    pub socket_path: PathBuf,
}

impl Settings {
    /// Flags win over the environment, which wins over defaults
    pub fn load(store: Option<PathBuf>, socket: Option<PathBuf>) -> Result<Self> {
        Self::resolve(store, socket, |name| std::env::var_os(name), dirs::config_dir())
    }

    pub fn resolve(
        store: Option<PathBuf>,
        socket: Option<PathBuf>,
        env: impl Fn(&str) -> Option<OsString>,
        config_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let from_env = |name: &str| env(name).filter(|v| !v.is_empty()).map(PathBuf::from);

        let store_path = store
            .or_else(|| from_env(STORE_ENV))
            .or_else(|| config_dir.map(|dir| dir.join("floatone").join(STORE_FILE_NAME)))
            .with_context(|| {
                format!(
                    "Cannot locate the config directory; pass --store or set {}",
                    STORE_ENV
                )
            })?;

        let socket_path = socket
            .or_else(|| from_env(SOCKET_ENV))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        Ok(Self {
            store_path,
            socket_path,
        })
    }
}
