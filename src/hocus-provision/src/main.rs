//! Provisioning entry point.
//!
//! Runs the state machine exactly once before the tunnel daemon starts.
//! Fatal errors exit non-zero with a diagnostic naming the failed stage.

use clap::Parser;
use hocus_provision::{
    AddressResolver, HttpKeyMaterialStore, ProvisionConfig, Provisioner, ProvisionerOptions,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Hocuspocus VPN identity provisioner
#[derive(Parser, Debug)]
#[command(name = "hocus-provision", version, about)]
struct Args {
    /// Path to the provisioning config (JSON)
    #[arg(long, default_value = "/etc/hocus/provision.json")]
    config: PathBuf,

    /// Override the key-material store base URL
    #[arg(long)]
    store_url: Option<String>,

    /// Override the public address (skips metadata/echo lookups)
    #[arg(long)]
    public_addr: Option<IpAddr>,

    /// Override the local material directory
    #[arg(long)]
    material_dir: Option<PathBuf>,

    /// Override the tunnel config output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(code) = run(args).await {
        std::process::exit(code);
    }
}

async fn run(args: Args) -> Result<(), i32> {
    let mut config = ProvisionConfig::load(&args.config).map_err(|e| {
        error!(config = %args.config.display(), error = %e, "failed to load configuration");
        2
    })?;

    if let Some(url) = args.store_url {
        config.store.base_url = url;
    }
    if let Some(addr) = args.public_addr {
        config.address.override_addr = Some(addr);
    }
    if let Some(dir) = args.material_dir {
        config.material_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let registry = config.network.registry().map_err(|e| {
        error!(stage = "resolve", error = %e, "device registry invalid");
        2
    })?;

    let store = Arc::new(HttpKeyMaterialStore::new(
        config.store.base_url.clone(),
        config.store.timeout(),
        config.store.max_retries,
    ));
    let resolver = AddressResolver::new(config.address.resolver_config());

    let provisioner = Provisioner::new(
        ProvisionerOptions {
            registry,
            ca: config.pki.clone(),
            material_dir: config.material_dir.clone(),
            output_dir: config.output_dir.clone(),
            p12_passphrase: config.p12_passphrase.clone(),
            shared_client_identity: config.shared_client_identity,
            skip_failed_devices: config.skip_failed_devices,
        },
        store,
        resolver,
    );

    match provisioner.run().await {
        Ok(report) => {
            info!(
                address = %report.address,
                source = ?report.source,
                issued = report.issued.len(),
                server_rotated = report.server_rotated,
                "tunnel configuration ready"
            );
            Ok(())
        }
        Err(e) => {
            error!(stage = e.stage(), error = %e, "provisioning failed");
            Err(1)
        }
    }
}
