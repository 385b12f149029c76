//! Classifies a raw buildpack identifier

use crate::engine::ImageReference;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const FILE_PREFIX: &str = "file://";
pub const DOCKER_PREFIX: &str = "docker://";
pub const BUILDER_PREFIX: &str = "urn:cnb:builder:";
pub const REGISTRY_PREFIX: &str = "urn:cnb:registry:";

fn shorthand_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*(?:/[A-Za-z0-9][A-Za-z0-9._-]*)*)(?:@([A-Za-z0-9][A-Za-z0-9._+-]*))?$")
            .expect("valid regex")
    })
}

/// What kind of source a raw identifier names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Directory or `.tgz`/`.tar` archive on the local filesystem
    LocalPath(PathBuf),
    /// Packaged buildpack image
    Image(ImageReference),
    /// Explicitly a buildpack bundled in the builder
    Builder { id: String, version: Option<String> },
    /// Explicitly a registry entry
    Registry { id: String, version: Option<String> },
    /// Bare `id[@version]`: builder first, then the registry
    Shorthand { id: String, version: Option<String> },
}

impl Locator {
    /// Classifies `raw`, checking in fixed order: local path, packaged image,
    /// explicit builder or registry URN, then `id[@version]` shorthand.
    /// Relative paths are resolved against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Option<Locator> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(path) = raw.strip_prefix(FILE_PREFIX) {
            return Some(Locator::LocalPath(absolutize(path, base_dir)));
        }
        if looks_like_path(raw) || base_dir.join(raw).exists() {
            return Some(Locator::LocalPath(absolutize(raw, base_dir)));
        }

        if raw.starts_with(DOCKER_PREFIX) {
            return ImageReference::parse(raw).ok().map(Locator::Image);
        }

        if let Some(rest) = raw.strip_prefix(BUILDER_PREFIX) {
            let (id, version) = split_shorthand(rest)?;
            return Some(Locator::Builder { id, version });
        }
        if let Some(rest) = raw.strip_prefix(REGISTRY_PREFIX) {
            let (id, version) = split_shorthand(rest)?;
            return Some(Locator::Registry { id, version });
        }

        if let Ok(reference) = ImageReference::parse(raw) {
            if reference.tag.is_some()
                || reference.digest.is_some()
                || reference.has_registry_host()
            {
                return Some(Locator::Image(reference));
            }
        }

        split_shorthand(raw).map(|(id, version)| Locator::Shorthand { id, version })
    }
}

fn looks_like_path(raw: &str) -> bool {
    raw.starts_with('/')
        || raw.starts_with("./")
        || raw.starts_with("../")
        || raw.starts_with('~')
        || raw == "."
}

fn absolutize(raw: &str, base_dir: &Path) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn split_shorthand(raw: &str) -> Option<(String, Option<String>)> {
    let caps = shorthand_regex().captures(raw)?;
    let id = caps.get(1)?.as_str().to_string();
    let version = caps.get(2).map(|m| m.as_str().to_string());
    Some((id, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(raw: &str) -> Option<Locator> {
        Locator::parse(raw, Path::new("/nonexistent-base"))
    }

    #[test]
    fn test_explicit_paths() {
        assert_eq!(
            parse("file:///opt/bp"),
            Some(Locator::LocalPath(PathBuf::from("/opt/bp")))
        );
        assert_eq!(
            parse("./bp"),
            Some(Locator::LocalPath(PathBuf::from("/nonexistent-base/./bp")))
        );
        assert_eq!(
            parse("/abs/bp.tgz"),
            Some(Locator::LocalPath(PathBuf::from("/abs/bp.tgz")))
        );
    }

    #[test]
    fn test_existing_relative_path_wins_over_shorthand() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("my-bp")).unwrap();

        let locator = Locator::parse("my-bp", dir.path()).unwrap();
        assert_eq!(locator, Locator::LocalPath(dir.path().join("my-bp")));
    }

    #[test]
    fn test_images() {
        match parse("docker://example/bp") {
            Some(Locator::Image(r)) => assert_eq!(r.repository, "example/bp"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            parse("gcr.io/paketo-buildpacks/node"),
            Some(Locator::Image(_))
        ));
        assert!(matches!(parse("example/node:1.2"), Some(Locator::Image(_))));
    }

    #[test]
    fn test_urns() {
        assert_eq!(
            parse("urn:cnb:builder:bp1@0.0.1"),
            Some(Locator::Builder {
                id: "bp1".to_string(),
                version: Some("0.0.1".to_string())
            })
        );
        assert_eq!(
            parse("urn:cnb:registry:example/node"),
            Some(Locator::Registry {
                id: "example/node".to_string(),
                version: None
            })
        );
    }

    #[test]
    fn test_shorthand() {
        assert_eq!(
            parse("heroku/nodejs@1.0.0"),
            Some(Locator::Shorthand {
                id: "heroku/nodejs".to_string(),
                version: Some("1.0.0".to_string())
            })
        );
        assert_eq!(
            parse("bp1"),
            Some(Locator::Shorthand {
                id: "bp1".to_string(),
                version: None
            })
        );
    }

    #[test]
    fn test_unclassifiable() {
        assert!(parse("").is_none());
        assert!(parse("not a buildpack!").is_none());
        assert!(parse("urn:cnb:builder:").is_none());
    }
}
