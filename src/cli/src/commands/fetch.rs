//! `scantask fetch` command.
//!
//! Resolves credentials, pulls one artifact and writes it as a Docker
//! archive, the same way the worker does for a job but without a queue.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use scantask_core::{RegistryParams, ScanParams, WorkerConfig};
use scantask_runtime::{ArchiveBundle, ScanPipeline};

#[derive(Args)]
pub struct FetchArgs {
    /// Artifact reference (e.g., "ghcr.io/org/image:tag")
    pub artifact: String,

    /// Registry provider: ghcr, ecr or acr
    #[arg(long, default_value = "ghcr")]
    pub registry_type: String,

    /// Output archive path
    #[arg(short, long, default_value = "image.tar")]
    pub output: PathBuf,

    /// Run the scanner over the archive and print its report
    #[arg(long)]
    pub scan: bool,

    /// Scanner executable used with --scan
    #[arg(long)]
    pub scanner: Option<PathBuf>,

    /// Write the resolved credentials as a Docker config.json
    #[arg(long)]
    pub credentials_out: Option<PathBuf>,

    /// GitHub username (ghcr)
    #[arg(long)]
    pub gh_username: Option<String>,

    /// GitHub token (ghcr)
    #[arg(long)]
    pub gh_token: Option<String>,

    /// AWS account id (ecr)
    #[arg(long)]
    pub aws_account_id: Option<String>,

    /// AWS region (ecr)
    #[arg(long)]
    pub region: Option<String>,

    /// ACR login server, e.g. "myregistry.azurecr.io" (acr)
    #[arg(long)]
    pub acr_login_server: Option<String>,

    /// Azure tenant id (acr)
    #[arg(long)]
    pub acr_tenant_id: Option<String>,
}

impl FetchArgs {
    fn scan_params(&self) -> ScanParams {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        ScanParams {
            artifact_url: self.artifact.clone(),
            registry_type: self.registry_type.clone(),
            credentials: RegistryParams {
                github_username: field(&self.gh_username),
                github_token: field(&self.gh_token),
                ecr_account_id: field(&self.aws_account_id),
                ecr_region: field(&self.region),
                acr_login_server: field(&self.acr_login_server),
                acr_tenant_id: field(&self.acr_tenant_id),
            },
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        if let Some(scanner) = &self.scanner {
            config.scanner.binary = scanner.clone();
        }
        config
    }
}

pub async fn execute(args: FetchArgs) -> anyhow::Result<()> {
    let pipeline = ScanPipeline::from_config(&args.worker_config())?;
    let bundle = fetch(&pipeline, &args).await?;
    eprintln!(
        "Saved {} to {} ({} layers)",
        args.artifact,
        bundle.path.display(),
        bundle.entry.layers.len()
    );

    if args.scan {
        let result = pipeline.scanner().scan(&bundle.path).await?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&result.output)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Resolve credentials once, optionally write them out, then pull with them.
async fn fetch(pipeline: &ScanPipeline, args: &FetchArgs) -> anyhow::Result<ArchiveBundle> {
    let params = args.scan_params();
    let credentials = pipeline
        .resolvers()
        .resolve(&params.registry_type, &params.credentials)
        .await?;

    if let Some(path) = &args.credentials_out {
        credentials
            .write_docker_config(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        eprintln!("Wrote credentials to {}", path.display());
    }

    pipeline
        .fetch_with_credentials(&params.artifact_url, &credentials, &args.output)
        .await
        .with_context(|| format!("failed to fetch {}", args.artifact))
}
