//! certkeeper demo - start a key service and use it
//!
//! ```text
//! certkeeper-demo keys
//! certkeeper-demo verify <TOKEN> --audience my-project
//! CERTKEEPER_CERTIFICATES_URL=https://idp.example.com/certs certkeeper-demo -v watch
//! ```
//!
//! Logs go to stderr (`RUST_LOG` overrides `-v`); results go to stdout.

use std::time::Duration;

use anyhow::{Context, bail};
use certkeeper::{DEFAULT_CERTIFICATES_URL, KeyService, UnknownKeyPolicy, VerifierConfig};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

/// certkeeper-demo - provider signing keys and ID token verification
#[derive(Parser, Debug)]
#[command(name = "certkeeper-demo", version, about, author)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Endpoint publishing the provider's signing certificates
    #[arg(
        long,
        env = "CERTKEEPER_CERTIFICATES_URL",
        default_value = DEFAULT_CERTIFICATES_URL,
        global = true
    )]
    certificates_url: String,

    /// How long to wait for the first key refresh, in seconds
    #[arg(long, default_value_t = 10, global = true)]
    startup_timeout: u64,

    /// Enable verbose logging (-v, -vv, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a token and print its claims as JSON
    Verify {
        /// Compact-serialized token
        token: String,

        /// Reject the token unless `aud` contains this value
        #[arg(long)]
        audience: Option<String>,
    },
    /// List the currently published key ids
    Keys,
    /// Keep the cache refreshed until interrupted
    Watch,
}

impl Cli {
    fn init_tracing(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    fn config(&self) -> VerifierConfig {
        let policy = match self.command {
            // A one-shot verification cannot wait for the next scheduled refresh
            Command::Verify { .. } => UnknownKeyPolicy::RequestRefresh,
            Command::Keys | Command::Watch => UnknownKeyPolicy::Ignore,
        };
        VerifierConfig::with_certificates_url(&self.certificates_url).unknown_key_policy(policy)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.init_tracing();
    certkeeper::init_key_metrics();

    let service = KeyService::start(cli.config()).context("invalid configuration")?;
    if !service
        .wait_until_ready(Duration::from_secs(cli.startup_timeout))
        .await
    {
        let reason = service
            .stats()
            .last_error
            .unwrap_or_else(|| "no response yet".to_string());
        service.shutdown().await;
        bail!("no signing keys from {}: {reason}", cli.certificates_url);
    }

    let result = match &cli.command {
        Command::Verify { token, audience } => verify(&service, token, audience.as_deref()),
        Command::Keys => {
            list_keys(&service);
            Ok(())
        }
        Command::Watch => watch(&service).await,
    };

    service.shutdown().await;
    result
}

fn verify(service: &KeyService, token: &str, audience: Option<&str>) -> anyhow::Result<()> {
    let claims = service
        .verifier()
        .verify(token)
        .context("token rejected")?;

    if let Some(audience) = audience
        && !claims.audiences().contains(&audience)
    {
        bail!("token is not intended for {audience:?}");
    }

    println!("{}", serde_json::to_string_pretty(claims.as_map())?);
    Ok(())
}

fn list_keys(service: &KeyService) {
    for (kid, key) in service.cache().snapshot().iter() {
        match key.as_ref() {
            certkeeper::VerificationKey::Rsa(rsa) => println!("{kid}\tRSA-{}", rsa.bits()),
            _ => println!("{kid}"),
        }
    }
}

async fn watch(service: &KeyService) -> anyhow::Result<()> {
    let mut updates = service.cache().subscribe();
    info!("Watching for key rotation, press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let table = service.cache().snapshot();
                let ids: Vec<&str> = table.key_ids().collect();
                println!("generation {}: {}", *updates.borrow_and_update(), ids.join(", "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "certkeeper-demo",
            "--certificates-url",
            "https://idp.example.com/certs",
            "verify",
            "a.b.c",
            "--audience",
            "my-project",
        ])
        .unwrap();

        assert_eq!(cli.certificates_url, "https://idp.example.com/certs");
        assert!(matches!(
            cli.command,
            Command::Verify { ref token, audience: Some(ref aud) } if token == "a.b.c" && aud == "my-project"
        ));
        assert_eq!(
            cli.config().unknown_key_policy,
            UnknownKeyPolicy::RequestRefresh
        );
    }

    #[test]
    fn test_cli_verbosity_and_defaults() {
        let cli = Cli::try_parse_from(["certkeeper-demo", "-vv", "keys"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.startup_timeout, 10);
        assert_eq!(cli.config().unknown_key_policy, UnknownKeyPolicy::Ignore);
    }
}
