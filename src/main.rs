//! Tether webhook server - Pod placement and sidecar injection

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether::crd::Sidecar;
use tether::retry::RetryConfig;
use tether::template::{DirTemplates, EmbeddedTemplates, TemplateSource};
use tether::webhook::{webhook_router, WebhookState};

/// Tether - mutating admission webhook for Pod placement and sidecar injection
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Generate the Sidecar CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "TETHER_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the admission webhooks over HTTPS (default mode)
    Serve(ServeArgs),
}

/// Server arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "WEBHOOK_ADDR", default_value = tether::DEFAULT_WEBHOOK_ADDR)]
    addr: SocketAddr,

    /// PEM certificate presented to the API server
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/etc/webhook/certs/tls.crt")]
    tls_cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/etc/webhook/certs/tls.key")]
    tls_key: PathBuf,

    /// Directory overriding the built-in injection templates
    #[arg(long, env = "WEBHOOK_TEMPLATE_DIR")]
    template_dir: Option<PathBuf>,

    /// Attempts for a Sidecar update that keeps conflicting
    #[arg(long, env = "WEBHOOK_CONFLICT_RETRIES", default_value_t = tether::DEFAULT_CONFLICT_RETRIES)]
    conflict_retries: u32,

    /// Install or update the Sidecar CRD before serving
    #[arg(long, env = "WEBHOOK_INSTALL_CRD")]
    install_crd: bool,
}

impl Default for ServeArgs {
    fn default() -> Self {
        // Parsing an empty command line applies every default and env override
        ServeWrapper::parse_from(["serve"]).args
    }
}

#[derive(Parser, Debug)]
struct ServeWrapper {
    #[command(flatten)]
    args: ServeArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if cli.crd {
        let crd = serde_yaml::to_string(&Sidecar::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the aws-lc-rs crypto provider");
    }

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args).await,
        None => run_server(ServeArgs::default()).await,
    }
}

/// Serve both webhooks until the server fails
async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let templates: Arc<dyn TemplateSource> = match &args.template_dir {
        Some(dir) => {
            tracing::info!(dir = ?dir, "Serving injection templates from directory");
            Arc::new(DirTemplates::new(dir))
        }
        None => Arc::new(EmbeddedTemplates),
    };

    let retry = RetryConfig::with_max_attempts(args.conflict_retries);
    let state = WebhookState::with_client(client, templates, retry)
        .map_err(|e| anyhow::anyhow!("Failed to build template engine: {}", e))?;
    let router = webhook_router(Arc::new(state));

    let tls_config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(&args.tls_cert, &args.tls_key)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to load TLS certificate {:?} / key {:?}: {}",
                    args.tls_cert,
                    args.tls_key,
                    e
                )
            })?;

    tracing::info!(addr = %args.addr, "Starting HTTPS webhook server");
    axum_server::bind_rustls(args.addr, tls_config)
        .serve(router.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))
}

/// Install the Sidecar CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("tether-webhook").force();

    tracing::info!("Installing Sidecar CRD...");
    crds.patch(
        "sidecars.tether.dev",
        &params,
        &Patch::Apply(&Sidecar::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Sidecar CRD: {}", e))?;

    Ok(())
}
