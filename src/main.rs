use clap::{Parser, Subcommand};
use memshard::{config::Config, Client, Item};
use std::io::Write;
use tracing::{error, info};
use tracing_appender::non_blocking;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "memshard")]
#[command(about = "Sharded memcached client")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Server address (repeatable); replaces the configured list
    #[arg(short, long = "server")]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Cmd {
    /// Print the value stored under a key
    Get { key: String },
    /// Fetch several keys in one round per server
    GetMulti {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    Set(StoreArgs),
    Add(StoreArgs),
    Replace(StoreArgs),
    Delete { key: String },
    Touch { key: String, seconds: i32 },
    Incr { key: String, delta: u64 },
    Decr { key: String, delta: u64 },
    /// Flush every server
    FlushAll,
    /// Flush the server that owns the empty key
    DeleteAll,
}

#[derive(clap::Args, Debug, PartialEq)]
struct StoreArgs {
    key: String,
    value: String,
    #[arg(long, default_value_t = 0)]
    flags: u32,
    #[arg(long, default_value_t = 0)]
    exptime: i32,
}

impl StoreArgs {
    fn to_item(&self) -> Item {
        Item::new(self.key.as_str(), self.value.as_bytes())
            .with_flags(self.flags)
            .with_expiration(self.exptime)
    }
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // RUST_LOG is a bare level name here, not a filter directive
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

/// Config file (if any) with `--server` entries taking precedence.
async fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_yaml_file(path).await?,
        None => Config::default(),
    };
    if !args.servers.is_empty() {
        config.servers = args.servers.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_command(
    client: &Client,
    command: &Cmd,
    out: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Cmd::Get { key } => {
            let item = client.get(key).await?;
            writeln!(out, "{}", String::from_utf8_lossy(&item.value))?;
        }
        Cmd::GetMulti { keys } => {
            let fetched = client.get_multi(keys.as_slice()).await?;
            let mut items: Vec<_> = fetched.items.values().collect();
            items.sort_by(|a, b| a.key.cmp(&b.key));
            for item in items {
                writeln!(out, "{} {}", item.key, String::from_utf8_lossy(&item.value))?;
            }
            if let Some(e) = fetched.error {
                return Err(e.into());
            }
        }
        Cmd::Set(store) => client.set(&store.to_item()).await?,
        Cmd::Add(store) => client.add(&store.to_item()).await?,
        Cmd::Replace(store) => client.replace(&store.to_item()).await?,
        Cmd::Delete { key } => client.delete(key).await?,
        Cmd::Touch { key, seconds } => client.touch(key, *seconds).await?,
        Cmd::Incr { key, delta } => writeln!(out, "{}", client.increment(key, *delta).await?)?,
        Cmd::Decr { key, delta } => writeln!(out, "{}", client.decrement(key, *delta).await?)?,
        Cmd::FlushAll => client.flush_all().await?,
        Cmd::DeleteAll => client.delete_all().await?,
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args).await?;
    info!("Using servers: {}", config.servers.join(", "));
    let client = Client::from_config(&config).await?;
    let mut stdout = std::io::stdout();
    run_command(&client, &args.command, &mut stdout).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}
