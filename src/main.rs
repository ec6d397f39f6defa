use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use harc::config::Args;
use harc::core::observability::{self, HealthState};
use harc::logging;
use harc::proxy::SigningProxy;
use harc::signer::Signer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let key = match args.load_signing_key() {
        Ok(key) => key,
        Err(e) => {
            error!("Cannot load signing key: {}", e);
            std::process::exit(1);
        }
    };

    let record = args.dns_record(&key);
    info!("Upstream: {}", args.upstream);
    info!("Publish this TXT record at _arc.<your domain>:");
    info!("  {}", record.to_txt());

    let signer = Signer::new(key).with_digest(args.emit_digest);
    let proxy = Arc::new(SigningProxy::new(&args.upstream, signer)?);
    let listener = SigningProxy::bind(args.listen_addr()).await?;
    observability::set_health(HealthState::Ok);

    tokio::select! {
        result = proxy.accept_connections(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = observability::snapshot();
            info!(
                signed = stats.signed_responses,
                passthrough = stats.passthrough_responses,
                sign_failures = stats.sign_failures,
                upstream_failures = stats.upstream_failures,
                "Shutting down"
            );
        }
    }

    Ok(())
}
