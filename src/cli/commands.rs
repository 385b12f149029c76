use crate::cache::CacheBackend;
use crate::engine::PullPolicy;
use crate::order::{GroupSpec, OrderOverride, OrderSpec};
use crate::build::{BuildRequest, CachePreference};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Build container images from source with Cloud Native Buildpacks
#[derive(Parser, Debug)]
#[command(
    name = "cnbpack",
    about = "Build container images from source with Cloud Native Buildpacks",
    version,
    author,
    long_about = "cnbpack runs the buildpacks lifecycle (detect, analyze, restore, build, \
                  export) in containers to turn application source into an OCI image. \
                  Buildpacks come from the builder, local directories, buildpack images \
                  or a buildpack registry."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Build an image from application source",
        long_about = "Runs the lifecycle phases against the application source and \
                      produces an image.\n\n\
                      Examples:\n  \
                      cnbpack build myapp --builder paketobuildpacks/builder-jammy-base\n  \
                      cnbpack build myapp -B my-builder -b ./my-buildpack -b urn:cnb:builder:paketo-buildpacks/nodejs\n  \
                      cnbpack build registry.example.com/myapp -B my-builder --publish --cache-image registry.example.com/myapp-cache"
    )]
    Build(BuildArgs),

    #[command(
        about = "Download a buildpack",
        long_about = "Resolves a buildpack from a registry, an image or a local path \
                      and stores it locally.\n\n\
                      Examples:\n  \
                      cnbpack pull paketo-buildpacks/nodejs@1.2.3\n  \
                      cnbpack pull docker://gcr.io/paketo-buildpacks/nodejs:1.2.3"
    )]
    Pull(PullArgs),

    #[command(
        about = "Show builder metadata",
        long_about = "Prints the lifecycle version, supported APIs, bundled buildpacks \
                      and default detection order of a builder image.\n\n\
                      Examples:\n  \
                      cnbpack inspect-builder paketobuildpacks/builder-jammy-base\n  \
                      cnbpack inspect-builder my-builder --format json"
    )]
    InspectBuilder(InspectBuilderArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    #[arg(value_name = "IMAGE", help = "Name of the image to build")]
    pub image: String,

    #[arg(short = 'B', long, value_name = "IMAGE", help = "Builder image")]
    pub builder: String,

    #[arg(
        short = 'p',
        long,
        value_name = "PATH",
        help = "Application directory (defaults to current directory)"
    )]
    pub path: Option<PathBuf>,

    #[arg(
        short = 'b',
        long = "buildpack",
        value_name = "BUILDPACK",
        help = "Buildpack to try first, as a group together with the others given (repeatable; suffix with ? for optional)"
    )]
    pub buildpacks: Vec<String>,

    #[arg(
        long = "order-group",
        value_name = "BP1,BP2?",
        help = "Replace the builder order; each occurrence adds one group (repeatable)"
    )]
    pub order_groups: Vec<String>,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_env,
        help = "Build-time environment variable (repeatable)"
    )]
    pub env: Vec<(String, String)>,

    #[arg(long, help = "Publish to a registry instead of the local daemon")]
    pub publish: bool,

    #[arg(long, value_name = "IMAGE", requires = "publish", help = "Keep the layer cache in this image")]
    pub cache_image: Option<String>,

    #[arg(long, help = "Clear the image's cache before building")]
    pub clear_cache: bool,

    #[arg(long, help = "Keep a cache for image extensions")]
    pub kaniko_cache: bool,

    #[arg(long, value_name = "IMAGE", help = "Run image to base the output on")]
    pub run_image: Option<String>,

    #[arg(
        long,
        value_name = "IMAGE",
        help = "Run analyze, restore and export from this lifecycle image"
    )]
    pub lifecycle_image: Option<String>,

    #[arg(long, value_name = "NETWORK", help = "Network for phases with network access")]
    pub network: Option<String>,

    #[arg(long, help = "Run the whole build in one trusted creator container")]
    pub trust_builder: bool,

    #[arg(long, value_name = "SECONDS", help = "Cancel the build after this many seconds")]
    pub timeout: Option<u64>,

    #[arg(long, value_enum, help = "Image pull policy")]
    pub pull_policy: Option<PullPolicyArg>,

    #[arg(
        short = 'r',
        long,
        value_name = "NAME",
        help = "Buildpack registry used for <id>@<version> lookups"
    )]
    pub buildpack_registry: Option<String>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Format of the final report"
    )]
    pub format: OutputFormatArg,
}

impl BuildArgs {
    pub fn to_request(&self) -> Result<BuildRequest> {
        let app_dir = match &self.path {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };

        let mut request = BuildRequest::new(app_dir, &self.builder, &self.image);

        if !self.order_groups.is_empty() {
            let groups = self
                .order_groups
                .iter()
                .map(|raw| GroupSpec::parse(raw))
                .collect::<Result<Vec<_>, _>>()
                .context("Invalid --order-group")?;
            request.buildpacks.push(OrderOverride::Replace(OrderSpec::new(groups)));
        }
        if !self.buildpacks.is_empty() {
            let group = GroupSpec::parse(&self.buildpacks.join(",")).context("Invalid --buildpack")?;
            request.buildpacks.push(OrderOverride::Prepend(group));
        }

        request.registry = self.buildpack_registry.clone();
        request.cache = CachePreference {
            backend: match &self.cache_image {
                Some(image) => CacheBackend::Image(image.clone()),
                None => CacheBackend::Volume,
            },
            clear: self.clear_cache,
            kaniko: self.kaniko_cache,
            in_detect: false,
        };
        request.publish = self.publish;
        request.env = self.env.clone();
        request.run_image = self.run_image.clone();
        request.lifecycle_image = self.lifecycle_image.clone();
        request.network = self.network.clone();
        request.trust_builder = self.trust_builder;
        request.pull_policy = self.pull_policy.map(Into::into);
        Ok(request)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct PullArgs {
    #[arg(value_name = "URI", help = "Buildpack to pull")]
    pub uri: String,

    #[arg(
        short = 'r',
        long,
        value_name = "NAME",
        help = "Buildpack registry to look the buildpack up in"
    )]
    pub buildpack_registry: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct InspectBuilderArgs {
    #[arg(value_name = "IMAGE", help = "Builder image")]
    pub image: String,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,

    #[arg(long, value_enum, help = "Image pull policy")]
    pub pull_policy: Option<PullPolicyArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicyArg {
    Always,
    IfNotPresent,
    Never,
}

impl From<PullPolicyArg> for PullPolicy {
    fn from(arg: PullPolicyArg) -> Self {
        match arg {
            PullPolicyArg::Always => PullPolicy::Always,
            PullPolicyArg::IfNotPresent => PullPolicy::IfNotPresent,
            PullPolicyArg::Never => PullPolicy::Never,
        }
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => match std::env::var(s) {
            Ok(value) if !s.is_empty() => Ok((s.to_string(), value)),
            _ => Err(format!(
                "Invalid environment variable '{}': expected KEY=VALUE or the name of a set variable",
                s
            )),
        },
    }
}
