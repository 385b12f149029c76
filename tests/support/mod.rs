use cnbpack::buildpack::resolver::{BUILDPACKAGE_METADATA_LABEL, BUILDPACK_LAYERS_LABEL};
use cnbpack::builder::{BUILDER_METADATA_LABEL, BUILDER_ORDER_LABEL, LIFECYCLE_APIS_LABEL};
use cnbpack::engine::ImageInfo;
use cnbpack::{BuildCoordinator, CnbpackConfig, MockEngine, ProgressHandler};
use std::sync::Arc;

pub const BUILDER: &str = "registry.example.com/builder:test";
pub const IMAGE: &str = "registry.example.com/app:latest";

/// A builder bundling `example/node@1.0.0` and `example/python@2.0.0`, with the
/// default order `[[node], [python]]`
pub struct BuilderFixture {
    pub platform_apis: Vec<&'static str>,
    pub node_network: bool,
}

impl Default for BuilderFixture {
    fn default() -> Self {
        Self {
            platform_apis: vec!["0.10", "0.12"],
            node_network: false,
        }
    }
}

impl BuilderFixture {
    pub fn image(&self) -> ImageInfo {
        let apis = self
            .platform_apis
            .iter()
            .map(|api| format!("\"{}\"", api))
            .collect::<Vec<_>>()
            .join(", ");
        ImageInfo::new("sha256:5f1e2d3c4b5a69788796a5b4c3d2e1f0")
            .with_label(
                BUILDER_METADATA_LABEL,
                format!(
                    r#"{{
                        "description": "Fixture builder",
                        "buildpacks": [
                            {{"id": "example/node", "version": "1.0.0"}},
                            {{"id": "example/python", "version": "2.0.0"}}
                        ],
                        "stack": {{"runImage": {{"image": "registry.example.com/run:base"}}}},
                        "lifecycle": {{
                            "version": "0.20.0",
                            "apis": {{
                                "buildpack": {{"deprecated": [], "supported": ["0.7", "0.11"]}},
                                "platform": {{"deprecated": [], "supported": [{}]}}
                            }}
                        }}
                    }}"#,
                    apis
                ),
            )
            .with_label(
                BUILDER_ORDER_LABEL,
                r#"[
                    {"group": [{"id": "example/node", "version": "1.0.0"}]},
                    {"group": [{"id": "example/python", "version": "2.0.0"}]}
                ]"#,
            )
            .with_label(
                BUILDPACK_LAYERS_LABEL,
                format!(
                    r#"{{
                        "example/node": {{"1.0.0": {{"api": "0.10", "network": {}}}}},
                        "example/python": {{"2.0.0": {{"api": "0.10"}}}}
                    }}"#,
                    self.node_network
                ),
            )
    }
}

/// A builder whose default order is the single group `[[bp1, bp2]]`, declaring
/// Platform API 0.6 over a lifecycle that supports 0.4 through 0.7
#[allow(dead_code)]
pub fn paired_builder_image() -> ImageInfo {
    ImageInfo::new("sha256:0a1b2c3d4e5f60718293a4b5c6d7e8f9")
        .with_label(
            BUILDER_METADATA_LABEL,
            r#"{
                "description": "Two-buildpack builder",
                "buildpacks": [
                    {"id": "bp1", "version": "0.0.1"},
                    {"id": "bp2", "version": "0.0.2"}
                ],
                "stack": {"runImage": {"image": "registry.example.com/run:base"}},
                "lifecycle": {
                    "version": "0.17.0",
                    "apis": {
                        "buildpack": {"deprecated": [], "supported": ["0.2", "0.9"]},
                        "platform": {"deprecated": [], "supported": ["0.6"]}
                    }
                }
            }"#,
        )
        .with_label(
            LIFECYCLE_APIS_LABEL,
            r#"{"buildpack": {"supported": ["0.2", "0.9"]}, "platform": {"deprecated": ["0.4"], "supported": ["0.5", "0.7"]}}"#,
        )
        .with_label(
            BUILDER_ORDER_LABEL,
            r#"[{"group": [{"id": "bp1", "version": "0.0.1"}, {"id": "bp2", "version": "0.0.2"}]}]"#,
        )
        .with_label(
            BUILDPACK_LAYERS_LABEL,
            r#"{"bp1": {"0.0.1": {"api": "0.8"}}, "bp2": {"0.0.2": {"api": "0.8"}}}"#,
        )
}

/// A packaged buildpack image
#[allow(dead_code)]
pub fn buildpack_image(id: &str, version: &str) -> ImageInfo {
    ImageInfo::new(format!("sha256:{}-{}", id.replace('/', "-"), version))
        .with_label(
            BUILDPACKAGE_METADATA_LABEL,
            format!(r#"{{"id":"{}","version":"{}"}}"#, id, version),
        )
        .with_label(
            BUILDPACK_LAYERS_LABEL,
            format!(r#"{{"{}":{{"{}":{{"api":"0.10"}}}}}}"#, id, version),
        )
}

/// Mock engine with the default builder available locally
pub fn engine_with_builder(fixture: &BuilderFixture) -> Arc<MockEngine> {
    let engine = Arc::new(MockEngine::new());
    engine.add_local_image(BUILDER, fixture.image());
    engine
}

pub fn coordinator(engine: Arc<MockEngine>, progress: Arc<dyn ProgressHandler>) -> BuildCoordinator {
    coordinator_with(engine, progress, |_| {})
}

#[allow(dead_code)]
pub fn coordinator_with(
    engine: Arc<MockEngine>,
    progress: Arc<dyn ProgressHandler>,
    customize: impl FnOnce(&mut CnbpackConfig),
) -> BuildCoordinator {
    let mut config = CnbpackConfig::default();
    config.log_level = "info".to_string();
    config.build_timeout_secs = None;
    config.registry = None;
    customize(&mut config);
    BuildCoordinator::new(engine, config).with_progress(progress)
}

/// Containers created for lifecycle phases, ignoring buildpack provisioning helpers
#[allow(dead_code)]
pub fn phase_binaries(engine: &MockEngine) -> Vec<String> {
    const PHASES: [&str; 6] = [
        "detector", "analyzer", "restorer", "builder", "exporter", "creator",
    ];
    engine
        .created_binaries()
        .into_iter()
        .filter(|binary| PHASES.contains(&binary.as_str()))
        .collect()
}
