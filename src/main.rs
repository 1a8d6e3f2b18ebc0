use clap::Parser;
use rusty_sheet_server::cache::{CacheStore, MemoryCache, SledCache};
use rusty_sheet_server::config::{CacheBackend, ServiceConfig};
use rusty_sheet_server::http::{build_router, AppState};
use rusty_sheet_server::store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Spreadsheet upload and paginated query server
#[derive(Parser)]
#[command(name = "rusty-sheet-server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// Directory holding the database
    #[arg(long, default_value = "data_dir")]
    data: PathBuf,

    /// Where the latest-table pointer and query cache live
    #[arg(long, value_enum, default_value_t = CacheBackend::Memory)]
    cache: CacheBackend,

    /// Expiry of the latest-table pointer and cached pages, in seconds
    #[arg(long, default_value = "60")]
    cache_ttl_secs: u64,

    /// Maximum upload size in megabytes
    #[arg(long, default_value = "50")]
    upload_limit_mb: usize,

    /// Serve the newest upload table once the pointer has expired
    #[arg(long)]
    fallback_to_newest: bool,
}

impl Cli {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            upload_limit_bytes: self.upload_limit_mb.saturating_mul(1024 * 1024),
            fallback_to_newest: self.fallback_to_newest,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.service_config();

    let store = Store::open(&cli.data)?;
    let cache: Arc<dyn CacheStore> = match cli.cache {
        CacheBackend::Memory => {
            let memory = Arc::new(MemoryCache::new());
            tokio::spawn(sweep_expired(memory.clone(), config.cache_ttl));
            memory
        }
        CacheBackend::Sled => Arc::new(SledCache::new(store.clone())),
    };
    let app = build_router(AppState::new(store, cache, &config), &config);

    let listener = TcpListener::bind(cli.listen).await?;
    let local_addr = listener.local_addr()?;
    info!(
        data = %cli.data.display(),
        cache = ?cli.cache,
        ttl_secs = cli.cache_ttl_secs,
        "rusty-sheet-server listening on {}",
        local_addr
    );
    eprintln!("rusty-sheet-server listening on {local_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Expired entries are otherwise only dropped when read again.
async fn sweep_expired(cache: Arc<MemoryCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        let removed = cache.purge_expired();
        if removed > 0 {
            debug!(removed, "purged expired cache entries");
        }
    }
}
