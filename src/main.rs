//! OpenBotAuth - cryptographic identity for non-human HTTP clients.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clap::Parser;
use rand::{Rng, RngExt};
use tracing::{error, info, warn};

use openbotauth::cli::{CaCommand, Cli, Command};
use openbotauth::config::Config;
use openbotauth::registry::auth::{AuthState, SessionManager};
use openbotauth::registry::ca::{CertificateAuthority, generate_ca};
use openbotauth::registry::oauth::GithubOauth;
use openbotauth::registry::router as registry_router;
use openbotauth::registry::tokens::TokenOpsLimiter;
use openbotauth::registry::{InMemoryStore, RegistrySettings, RegistryState, StatsStore};
use openbotauth::verifier::router::{VerifierLimits, VerifierState, serve as serve_verifier};
use openbotauth::verifier::{
    HttpDirectoryFetcher, JwksCache, NonceCache, VerifierEngine,
};
use openbotauth::{Error, Result, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Verifier { port, host } => run_verifier(config, port, host).await,
        Command::Registry { port, host } => run_registry(config, port, host).await,
        Command::Ca { command } => run_ca(command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_verifier(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    if let Some(port) = port {
        config.verifier.port = port;
    }
    if let Some(host) = host {
        config.verifier.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.verifier.port,
        trusted_directories = config.verifier.trusted_directories.len(),
        "Starting OpenBotAuth verifier"
    );
    if config.verifier.trusted_directories.is_empty() {
        warn!("TRUSTED_DIRECTORIES is empty - every verification will be denied");
    }

    let fetcher = Arc::new(HttpDirectoryFetcher::new(config.verifier.fetch_timeout()));
    let jwks = Arc::new(JwksCache::new(fetcher, config.verifier.jwks_cache()));
    let nonces = Arc::new(NonceCache::new());
    let engine = Arc::new(VerifierEngine::new(
        config.verifier.policy(),
        jwks,
        nonces,
    ));

    let limits = VerifierLimits {
        requests_per_second: config.verifier.rate_limit_rps,
        burst: config.verifier.rate_limit_burst,
    };
    let state = Arc::new(VerifierState::new(
        engine,
        config.verifier.admin_token.clone(),
        &limits,
    ));

    let addr = bind_addr(&config.verifier.host, config.verifier.port)?;
    serve_verifier(state, addr).await
}

async fn run_registry(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    if let Some(port) = port {
        config.registry.port = port;
    }
    if let Some(host) = host {
        config.registry.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.registry.port,
        "Starting OpenBotAuth registry"
    );

    let store: Arc<dyn openbotauth::registry::RegistryStore> = Arc::new(InMemoryStore::new());
    let stats = Arc::new(StatsStore::new());

    let secret = config.session.secret.clone().unwrap_or_else(|| {
        warn!("SESSION_SECRET not set - sessions will not survive a restart");
        let bytes: [u8; 32] = rand::rng().random();
        URL_SAFE_NO_PAD.encode(bytes)
    });
    let sessions = SessionManager::new(
        &secret,
        &config.session.cookie_name,
        config.session.ttl_days,
        config.session.secure,
    );
    let auth = Arc::new(AuthState::new(
        Arc::clone(&store),
        sessions,
        config.registry.failed_auth_per_minute,
    ));

    let oauth = match (
        config.registry.github_client_id.clone(),
        config.registry.github_client_secret.clone(),
    ) {
        (Some(id), Some(secret)) => Some(GithubOauth::new(id, secret)),
        _ => {
            warn!("GitHub OAuth not configured - login routes disabled");
            None
        }
    };

    let ca = match (config.ca.cert_path.clone(), config.ca.key_path.clone()) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let authority =
                CertificateAuthority::load(&cert_pem, &key_pem, config.ca.settings())
                    .map_err(|e| Error::Config(format!("CA load failed: {e}")))?;
            Some(authority)
        }
        _ => {
            warn!("CA not configured - certificate routes will return 501");
            None
        }
    };

    let state = Arc::new(RegistryState {
        store,
        stats,
        auth,
        token_ops: TokenOpsLimiter::new(config.registry.token_ops_per_minute),
        oauth,
        ca,
        settings: RegistrySettings {
            public_base_url: config.registry.public_base_url.clone(),
            max_tokens_per_user: config.registry.max_tokens_per_user,
            post_login_redirect: config.registry.post_login_redirect.clone(),
        },
    });

    let addr = bind_addr(&config.registry.host, config.registry.port)?;
    registry_router::serve(state, addr).await
}

fn run_ca(command: CaCommand) -> Result<()> {
    match command {
        CaCommand::Init {
            cn,
            out_dir,
            validity_days,
        } => {
            let generated = generate_ca(&cn, validity_days)
                .map_err(|e| Error::Crypto(e.to_string()))?;
            std::fs::create_dir_all(&out_dir)?;
            let cert_path = out_dir.join("ca.pem");
            let key_path = out_dir.join("ca-key.pem");
            std::fs::write(&cert_path, generated.cert_pem)?;
            std::fs::write(&key_path, generated.key_pem)?;
            info!(
                cert = %cert_path.display(),
                key = %key_path.display(),
                "CA initialized"
            );
            println!("CA certificate: {}", cert_path.display());
            println!("CA private key: {} (keep this offline)", key_path.display());
            Ok(())
        }
    }
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip = host
        .parse()
        .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
    Ok(SocketAddr::new(ip, port))
}
