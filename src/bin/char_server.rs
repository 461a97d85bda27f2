use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use charhub::config::ServerConfig;
use charhub::servers::char::db::MySqlStore;
use charhub::servers::char::{login, CharState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .init();

    let mut conf_file = "conf/char.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: char_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    return Err(anyhow::anyhow!("--conf requires a FILE argument"));
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)?;

    let pool = MySqlPoolOptions::new()
        .max_connections(config.sql_max_connections)
        .connect(&config.database_url())
        .await
        .with_context(|| format!(
            "Cannot connect to MySQL (host={}:{} db={} user={})",
            config.sql_ip, config.sql_port, config.sql_db, config.sql_id
        ))?;

    if config.auto_migrate {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Cannot apply migrations")?;
        tracing::info!("[char] migrations applied");
    }

    let bind_addr = format!("{}:{}", config.char_ip, config.char_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Cannot bind {}", bind_addr))?;

    let store = MySqlStore::new(pool, config.tables.clone());
    let state = Arc::new(CharState::new(Arc::new(store), config));
    CharState::start(&state).await;

    tracing::info!("[char] [started] Char Server Started.");

    {
        let s = Arc::clone(&state);
        tokio::spawn(async move {
            login::run(s).await;
        });
    }

    {
        let s = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("[char] [shutdown] interrupt received");
                s.shutdown().await;
                std::process::exit(0);
            }
        });
    }

    CharState::run(state, listener).await
}
