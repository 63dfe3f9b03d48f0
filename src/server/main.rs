use clap::Parser;
use log::{error, info, warn};
use peerlink::server::connection::Server;
use peerlink::server::notifications::{LogNotifier, MembershipNotifier, RedisNotifier};
use peerlink::server::suggestions::{DisabledSuggester, HttpSuggester, MemberSuggester};
use peerlink::server::{auth, config::ServerConfig, database::Database};
use peerlink::utils::performance;
use std::sync::Arc;
use std::time::Duration;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about = "PeerLink study group server")]
struct Args {
    /// Address to bind, overrides SERVER_HOST
    #[arg(long)]
    host: Option<String>,
    /// Port to bind, overrides SERVER_PORT
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    if config.enable_encryption {
        info!("TLS is enabled; set TLS_CERT_PATH and TLS_KEY_PATH to the cert and key PEM files.");
    } else {
        info!("TLS is disabled; connections will be plain TCP.");
    }

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;

    let notifier: Arc<dyn MembershipNotifier> = match config.redis_url.as_deref() {
        Some(url) => match RedisNotifier::connect(url).await {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!("[NOTIFY] Redis unavailable ({}); membership events will only be logged", e);
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    };

    let suggester: Arc<dyn MemberSuggester> = match config.ai_service_url.as_deref() {
        Some(url) => Arc::new(HttpSuggester::new(
            url,
            config.ai_api_key.clone(),
            Duration::from_secs(config.ai_request_timeout_secs),
        )?),
        None => {
            info!("[AI] AI_SERVICE_URL not set; AI group creation is disabled");
            Arc::new(DisabledSuggester)
        }
    };

    let perf_db = database.clone();
    let perf_log_path = config.performance_log_path.clone();
    let perf_interval = Duration::from_secs(config.performance_log_interval_secs.max(1));
    tokio::spawn(async move {
        info!(
            "[PERF] Logging every {} seconds to {}",
            perf_interval.as_secs(),
            perf_log_path
        );
        performance::start_performance_logger(perf_db, &perf_log_path, perf_interval).await;
    });

    let cleanup_db = database.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = auth::cleanup_expired_sessions(&cleanup_db).await {
                warn!("[AUTH] Session cleanup failed: {}", e);
            }
        }
    });

    let addr = format!("{}:{}", config.host, config.port);
    let server = Arc::new(Server::new(database, config, notifier, suggester));
    server.run(&addr).await
}
