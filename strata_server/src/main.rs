use clap::Parser;
use std::net::SocketAddr;
use strata_core::config::PlatformConfig;
use strata_server::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
    });

    match cmd {
        Commands::Serve { host, port } => {
            let cfg = PlatformConfig::from_env()?;
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let state = strata_server::server::build_state(&cfg).await?;
            strata_server::server::serve(addr, state).await?;
        }
        Commands::Migrate => {
            let cfg = PlatformConfig::from_env()?;
            let db = strata_core::store::PostgresPlatformDb::connect(&cfg.database).await?;
            db.migrate().await?;
            tracing::info!("platform migrations applied");
        }
        Commands::Check => {
            let cfg = PlatformConfig::from_env()?;
            match sqlx::PgPool::connect(&cfg.database.url()).await {
                Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => println!("postgres: ok"),
                    Err(e) => println!("postgres: error ({e})"),
                },
                Err(e) => println!("postgres: error ({e})"),
            }
            match strata_core::objects::S3ObjectStore::new(&cfg.object_store).await {
                Ok(store) => {
                    use strata_core::objects::ObjectStore;
                    match store.list(strata_core::objects::BACKUP_BUCKET, "", 1).await {
                        Ok(_) => println!("object store: ok"),
                        Err(e) => println!("object store: error ({e})"),
                    }
                }
                Err(e) => println!("object store: error ({e})"),
            }
        }
        Commands::Config => {
            fn redact(s: &str) -> String {
                let chars: Vec<char> = s.chars().collect();
                if chars.len() <= 8 {
                    return "***".to_string();
                }
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{head}***{tail}")
            }

            let summary = serde_json::json!({
                "STRATA_DB_HOST": std::env::var("STRATA_DB_HOST").ok(),
                "STRATA_DB_NAME": std::env::var("STRATA_DB_NAME").ok(),
                "STRATA_DB_PASSWORD": std::env::var("STRATA_DB_PASSWORD").ok().map(|v| redact(&v)),
                "STRATA_S3_ENDPOINT": std::env::var("STRATA_S3_ENDPOINT").ok(),
                "STRATA_S3_ACCESS_KEY": std::env::var("STRATA_S3_ACCESS_KEY").ok().map(|v| redact(&v)),
                "STRATA_S3_SECRET_KEY": std::env::var("STRATA_S3_SECRET_KEY").ok().map(|v| redact(&v)),
                "STRATA_MASTER_KEY": std::env::var("STRATA_MASTER_KEY").ok().map(|v| redact(&v)),
                "STRATA_SCHEDULER_POLL_INTERVAL_MS": std::env::var("STRATA_SCHEDULER_POLL_INTERVAL_MS").ok(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
