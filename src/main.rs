use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use txconn::config::{self, Config};
use txconn::{
    ConnectionProvider, TxconnError, Result, SqliteConnectionFactory, TransactionInterceptor,
    TransactionalConnectionProvider,
};

const USAGE: &str = "Usage: txconn [--config PATH | --database PATH] [--rollback] SCRIPT.sql";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    database: Option<String>,
    rollback: bool,
    script: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = iter.next().map(PathBuf::from),
            "--database" => args.database = iter.next(),
            "--rollback" => args.rollback = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                return Err(TxconnError::Config(format!("unknown option {}\n{}", other, USAGE)));
            }
            _ => args.script = Some(PathBuf::from(arg)),
        }
    }
    Ok(args)
}

fn load_config(args: &Args) -> Result<Option<Config>> {
    if let Some(path) = &args.config {
        return config::load_config(path).map(Some);
    }
    match config::default_config_path() {
        Some(path) if path.exists() => config::load_config(path).map(Some),
        _ => Ok(None),
    }
}

fn init_logging(config: Option<&Config>) {
    let level = config.and_then(Config::log_level).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args, config: Option<Config>) -> Result<()> {
    let script_path = args
        .script
        .ok_or_else(|| TxconnError::Config(format!("missing script\n{}", USAGE)))?;
    let script = std::fs::read_to_string(&script_path)?;

    let factory = match (args.database, &config) {
        (Some(path), _) => SqliteConnectionFactory::new(path),
        (None, Some(config)) => config.connection_factory(),
        (None, None) => {
            return Err(TxconnError::Config(
                "no database given; use --database or a config file".to_string(),
            ))
        }
    };
    info!("Running {:?} against {:?}", script_path, factory.path());

    let provider = Arc::new(TransactionalConnectionProvider::from_factory(factory));

    if args.rollback {
        provider.start_new_transaction()?;
        let outcome = provider.provide(|conn| Ok(conn.execute_batch(&script)?));
        provider.rollback_active_transaction()?;
        provider.remove_active_transaction_connection();
        outcome?;
        info!("Script executed and rolled back");
        return Ok(());
    }

    let interceptor = TransactionInterceptor::new(Arc::clone(&provider));
    interceptor.run(|| provider.provide(|conn| Ok(conn.execute_batch(&script)?)))?;
    info!("Script committed");
    Ok(())
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };
    init_logging(config.as_ref());

    if let Err(e) = run(args, config) {
        error!("{}", e);
        eprintln!("txconn: {}", e);
        std::process::exit(1);
    }
}
