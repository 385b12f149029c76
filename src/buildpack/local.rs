//! Content-addressed store for local buildpack directories and archives
//!
//! Every local buildpack is copied (or extracted) into `<root>/<sha256>` before use
//! so a build never reads from a directory the user may still be editing, and so
//! the same content is stored once no matter how many times it is referenced.

use super::descriptor::BuildpackDescriptor;
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A local buildpack after it was placed in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBuildpack {
    pub dir: PathBuf,
    pub digest: String,
    pub descriptor: BuildpackDescriptor,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores a directory or `.tgz`/`.tar.gz`/`.tar` archive, returning the stored copy
    pub fn import(&self, source: &Path) -> Result<LocalBuildpack> {
        let metadata = fs::metadata(source)
            .with_context(|| format!("Buildpack path {} does not exist", source.display()))?;

        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create store {}", self.root.display()))?;

        let hex = if metadata.is_dir() {
            let hex = digest_tree(source)?;
            self.materialize(&hex, |staging| copy_tree(source, staging))?;
            hex
        } else {
            let hex = digest_file(source)?;
            self.materialize(&hex, |staging| extract_archive(source, staging))?;
            hex
        };

        let dir = self.root.join(&hex);
        let descriptor = BuildpackDescriptor::read_from(&dir)?;
        debug!(
            source = %source.display(),
            stored = %dir.display(),
            id = %descriptor.id,
            "Stored local buildpack"
        );

        Ok(LocalBuildpack {
            dir,
            digest: format!("sha256:{}", hex),
            descriptor,
        })
    }

    /// Fills `<root>/<hex>` via a staging directory unless it already exists
    fn materialize(&self, hex: &str, fill: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        let target = self.root.join(hex);
        if target.is_dir() {
            debug!(digest = %hex, "Local buildpack already stored");
            return Ok(());
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .context("Failed to create staging directory")?;
        fill(staging.path())?;

        let staged = staging.into_path();
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            if !target.is_dir() {
                return Err(anyhow!(
                    "Failed to move buildpack into {}: {}",
                    target.display(),
                    e
                ));
            }
        }
        Ok(())
    }
}

/// sha256 over relative paths plus file contents or link targets, in sorted order
fn digest_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.context("Failed to walk buildpack directory")?;
        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            hasher.update([1]);
            hasher.update(link.to_string_lossy().as_bytes());
        } else {
            hasher.update([0]);
            let mut file = File::open(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            io::copy(&mut file, &mut hasher)?;
        }
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.context("Failed to walk buildpack directory")?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        } else if entry.file_type().is_symlink() {
            copy_link(entry.path(), &target)
                .with_context(|| format!("Failed to copy link {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Recreates the link as is, so relative targets keep pointing inside the buildpack
#[cfg(unix)]
fn copy_link(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(source)?, target)
}

#[cfg(not(unix))]
fn copy_link(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader: Box<dyn Read> = if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".tar") || name.ends_with(".cnb") {
        Box::new(file)
    } else {
        return Err(anyhow!(
            "Unsupported buildpack archive {}: expected .tgz, .tar.gz or .tar",
            archive.display()
        ));
    };

    tar::Archive::new(reader)
        .unpack(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r#"
api = "0.9"
[buildpack]
id = "local/ruby"
version = "0.3.0"
"#;

    fn write_buildpack(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("buildpack.toml"), DESCRIPTOR).unwrap();
        fs::write(dir.join("bin/detect"), "#!/bin/sh\nexit 0\n").unwrap();
        fs::write(dir.join("bin/build"), "#!/bin/sh\nexit 0\n").unwrap();
    }

    #[test]
    fn test_import_directory() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        write_buildpack(src.path());

        let store = LocalStore::new(store_dir.path());
        let stored = store.import(src.path()).unwrap();

        assert_eq!(stored.descriptor.id, "local/ruby");
        assert!(stored.digest.starts_with("sha256:"));
        assert!(stored.dir.starts_with(store_dir.path()));
        assert!(stored.dir.join("bin/detect").is_file());
    }

    #[test]
    fn test_same_content_stored_once() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        write_buildpack(a.path());
        write_buildpack(b.path());

        let store = LocalStore::new(store_dir.path());
        let first = store.import(a.path()).unwrap();
        let second = store.import(b.path()).unwrap();

        assert_eq!(first.dir, second.dir);
        let entries = fs::read_dir(store_dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_content_change_changes_digest() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        write_buildpack(src.path());
        let store = LocalStore::new(store_dir.path());

        let before = store.import(src.path()).unwrap();
        fs::write(src.path().join("bin/build"), "#!/bin/sh\nexit 1\n").unwrap();
        let after = store.import(src.path()).unwrap();

        assert_ne!(before.digest, after.digest);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_binaries_preserved() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("buildpack.toml"), DESCRIPTOR).unwrap();
        fs::write(src.path().join("bin/main"), "#!/bin/sh\nexit 0\n").unwrap();
        std::os::unix::fs::symlink("main", src.path().join("bin/detect")).unwrap();
        std::os::unix::fs::symlink("main", src.path().join("bin/build")).unwrap();

        let store = LocalStore::new(store_dir.path());
        let stored = store.import(src.path()).unwrap();

        let detect = stored.dir.join("bin/detect");
        assert!(detect.is_file());
        assert_eq!(fs::read_link(&detect).unwrap(), PathBuf::from("main"));
        assert_eq!(
            fs::read_to_string(&detect).unwrap(),
            "#!/bin/sh\nexit 0\n"
        );

        fs::remove_file(src.path().join("bin/build")).unwrap();
        std::os::unix::fs::symlink("detect", src.path().join("bin/build")).unwrap();
        let relinked = store.import(src.path()).unwrap();
        assert_ne!(stored.digest, relinked.digest);
    }

    #[test]
    fn test_import_tgz() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        write_buildpack(src.path());

        let archive_path = src.path().join("ruby.tgz");
        {
            let file = File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder
                .append_path_with_name(src.path().join("buildpack.toml"), "buildpack.toml")
                .unwrap();
            builder
                .append_path_with_name(src.path().join("bin/detect"), "bin/detect")
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let stored = LocalStore::new(store_dir.path())
            .import(&archive_path)
            .unwrap();
        assert_eq!(stored.descriptor.version, "0.3.0");
        assert!(stored.dir.join("bin/detect").is_file());
    }

    #[test]
    fn test_missing_descriptor_rejected() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        fs::write(src.path().join("README"), "not a buildpack").unwrap();

        assert!(LocalStore::new(store_dir.path()).import(src.path()).is_err());
    }

    #[test]
    fn test_unknown_archive_type_rejected() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let zip = src.path().join("bp.zip");
        fs::write(&zip, "PK").unwrap();

        assert!(LocalStore::new(store_dir.path()).import(&zip).is_err());
    }
}
