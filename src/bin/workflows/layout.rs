use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildwright::config::ConfigOverrides;
use buildwright::manifest::{self, Manifest};
use buildwright::Engine;
use tracing::debug;

/// A loaded manifest and the engine built from it.
pub(crate) struct Session {
    pub(crate) manifest_path: PathBuf,
    pub(crate) engine: Engine,
}

impl Session {
    /// Load `explicit` or the nearest manifest above the working directory,
    /// layering environment variables under `cli` overrides.
    pub(crate) fn open(explicit: Option<&Path>, cli: ConfigOverrides) -> Result<Self> {
        let manifest_path = locate_manifest(explicit)?;
        debug!(manifest = %manifest_path.display(), "loading manifest");

        let loaded = Manifest::load(&manifest_path)?;
        let overrides = ConfigOverrides::from_env()
            .context("reading BUILDWRIGHT_* environment")?
            .merge(cli);
        let engine = Engine::from_manifest(loaded, overrides)
            .with_context(|| format!("loading '{}'", manifest_path.display()))?;

        Ok(Self {
            manifest_path,
            engine,
        })
    }
}

fn locate_manifest(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return std::fs::canonicalize(path)
            .with_context(|| format!("manifest '{}' not found", path.display()));
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(manifest::find(&cwd)?)
}
