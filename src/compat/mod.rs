//! Version-compatibility negotiation between client, builder and lifecycle
//!
//! Three independently versioned components must agree on one Platform API before
//! any container starts. The negotiated version is the highest one that lies within
//! the client's supported range, the builder's declared range and the lifecycle
//! binary's supported range at the same time. Buildpack APIs are checked against
//! the lifecycle's supported Buildpack API range in the same stage.

mod version;

pub use version::{ApiRange, ApiVersion, VersionParseError};

use crate::buildpack::BuildpackRef;
use thiserror::Error;
use tracing::debug;

/// Platform API versions this client can drive
pub const CLIENT_PLATFORM_API: ApiRange = ApiRange {
    min: ApiVersion::new(0, 3),
    max: ApiVersion::new(0, 13),
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error(
        "Incompatible Platform API: client supports {client}, builder declares {builder}, \
         lifecycle supports {lifecycle}"
    )]
    IncompatiblePlatformApi {
        client: ApiRange,
        builder: ApiRange,
        lifecycle: ApiRange,
    },

    #[error("Incompatible Buildpack API: {buildpack} declares {api}, lifecycle supports {supported}")]
    IncompatibleBuildpackApi {
        buildpack: String,
        api: ApiVersion,
        supported: ApiRange,
    },
}

/// Picks the single Platform API for a build
pub fn negotiate_platform_api(
    client: ApiRange,
    builder: ApiRange,
    lifecycle: ApiRange,
) -> Result<ApiVersion, NegotiationError> {
    let chosen = client
        .intersect(&builder)
        .and_then(|range| range.intersect(&lifecycle))
        .map(|range| range.max);

    match chosen {
        Some(version) => {
            debug!(
                client = %client,
                builder = %builder,
                lifecycle = %lifecycle,
                "Negotiated Platform API {}",
                version
            );
            Ok(version)
        }
        None => Err(NegotiationError::IncompatiblePlatformApi {
            client,
            builder,
            lifecycle,
        }),
    }
}

/// Rejects any buildpack whose declared API the lifecycle cannot run
pub fn check_buildpack_apis<'a>(
    buildpacks: impl IntoIterator<Item = &'a BuildpackRef>,
    supported: Option<ApiRange>,
) -> Result<(), NegotiationError> {
    let Some(supported) = supported else {
        return Ok(());
    };

    for buildpack in buildpacks {
        if let Some(api) = buildpack.api {
            if !supported.contains(api) {
                return Err(NegotiationError::IncompatibleBuildpackApi {
                    buildpack: buildpack.display_name(),
                    api,
                    supported,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildpack::SourceKind;

    fn range(raw: &str) -> ApiRange {
        raw.parse().unwrap()
    }

    #[test]
    fn test_highest_common_version() {
        let version =
            negotiate_platform_api(range("0.2-0.9"), range("0.7"), range("0.5-0.8")).unwrap();
        assert_eq!(version, ApiVersion::new(0, 7));
    }

    #[test]
    fn test_highest_when_builder_declares_range() {
        let version =
            negotiate_platform_api(range("0.3-0.13"), range("0.4-0.12"), range("0.6-0.10"))
                .unwrap();
        assert_eq!(version, ApiVersion::new(0, 10));
    }

    #[test]
    fn test_disjoint_ranges_fail_with_all_three_values() {
        let err = negotiate_platform_api(range("0.1-0.3"), range("0.9"), range("0.1-0.12"))
            .unwrap_err();
        match &err {
            NegotiationError::IncompatiblePlatformApi {
                client,
                builder,
                lifecycle,
            } => {
                assert_eq!(*client, range("0.1-0.3"));
                assert_eq!(*builder, range("0.9"));
                assert_eq!(*lifecycle, range("0.1-0.12"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("[0.1, 0.3]"));
        assert!(message.contains("0.9"));
    }

    #[test]
    fn test_lifecycle_excludes_builder() {
        assert!(
            negotiate_platform_api(range("0.3-0.13"), range("0.6"), range("0.7-0.12")).is_err()
        );
    }

    #[test]
    fn test_buildpack_api_check() {
        let mut ok = BuildpackRef::new("bp/ok", "1.0.0", SourceKind::Builder);
        ok.api = Some(ApiVersion::new(0, 8));
        let mut old = BuildpackRef::new("bp/old", "0.1.0", SourceKind::Builder);
        old.api = Some(ApiVersion::new(0, 1));
        let unknown = BuildpackRef::new("bp/unknown", "2.0.0", SourceKind::Builder);

        let supported = Some(range("0.2-0.10"));
        assert!(check_buildpack_apis([&ok, &unknown], supported).is_ok());

        let err = check_buildpack_apis([&ok, &old], supported).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::IncompatibleBuildpackApi { ref buildpack, .. } if buildpack == "bp/old@0.1.0"
        ));

        assert!(check_buildpack_apis([&old], None).is_ok());
    }
}
