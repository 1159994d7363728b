//! Release archive extraction.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveKind {
    TarZst,
    Tar,
    TarGz,
    Zip,
    /// The download is the executable itself.
    Raw,
}

impl ArchiveKind {
    pub(crate) fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".tar.zst") || path.ends_with(".tzst") {
            ArchiveKind::TarZst
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if path.ends_with(".tar") {
            ArchiveKind::Tar
        } else if path.ends_with(".zip") {
            ArchiveKind::Zip
        } else {
            ArchiveKind::Raw
        }
    }

    /// Host programs needed to unpack this kind.
    pub(crate) fn host_requirements(self) -> &'static [&'static str] {
        match self {
            ArchiveKind::TarGz => &["tar"],
            ArchiveKind::Zip => &["unzip"],
            _ => &[],
        }
    }
}

/// Unpack `archive` into `dest`. `Raw` is a no-op.
pub(crate) fn extract(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    match kind {
        ArchiveKind::TarZst => {
            let f = File::open(archive)?;
            let decoder = zstd::stream::Decoder::new(f)?;
            tar::Archive::new(decoder)
                .unpack(dest)
                .with_context(|| format!("Failed to unpack {}", archive.display()))?;
        }
        ArchiveKind::Tar => {
            let f = File::open(archive)?;
            tar::Archive::new(f)
                .unpack(dest)
                .with_context(|| format!("Failed to unpack {}", archive.display()))?;
        }
        ArchiveKind::TarGz => {
            Cmd::new("tar")
                .arg("-xzf")
                .arg(archive.to_string_lossy())
                .arg("-C")
                .arg(dest.to_string_lossy())
                .error_msg(format!("Failed to unpack {}", archive.display()))
                .run()?;
        }
        ArchiveKind::Zip => {
            Cmd::new("unzip")
                .args(["-q", "-o"])
                .arg(archive.to_string_lossy())
                .arg("-d")
                .arg(dest.to_string_lossy())
                .error_msg(format!("Failed to unpack {}", archive.display()))
                .run()?;
        }
        ArchiveKind::Raw => {}
    }
    Ok(())
}

/// Find a regular file called `name` anywhere under `dir`, shallowest first.
pub(crate) fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut hits: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == name)
        .map(|e| e.into_path())
        .collect();
    hits.sort_by_key(|p| (p.components().count(), p.clone()));
    hits.into_iter().next()
}
