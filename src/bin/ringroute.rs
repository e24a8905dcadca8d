//! Admin CLI: run routing scenarios and inspect configuration

use clap::{Parser, Subcommand, ValueEnum};
use ringroute::common::parse_duration;
use ringroute::ops::{LoadReport, RingReport};
use ringroute::{
    Config, ConnectionRouter, CoordinationStore, DistributedRouter, LocalRouter, MemoryStore,
    RouterMode, TimeoutStore,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringroute")]
#[command(about = "Consistent-hashing connection router")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./ringroute.toml plus RINGROUTE_* env vars)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Local,
    Distributed,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a batch of connections, then apply topology changes
    Simulate {
        /// Initial servers (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "node1,node2")]
        servers: Vec<String>,

        /// Number of users to connect (user:0..N)
        #[arg(long, default_value = "1000")]
        users: usize,

        /// Number of services to connect (service:0..N)
        #[arg(long, default_value = "0")]
        services: usize,

        /// Servers to add after the initial routing
        #[arg(long, value_delimiter = ',')]
        add: Vec<String>,

        /// Servers to remove afterwards
        #[arg(long, value_delimiter = ',')]
        remove: Vec<String>,

        /// Router implementation (overrides config)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Virtual nodes per server (overrides config)
        #[arg(long)]
        virtual_nodes: Option<usize>,

        /// Store call timeout in distributed mode, e.g. `500ms` or `2s` (overrides config)
        #[arg(long)]
        store_timeout: Option<String>,

        /// Print router metrics at the end
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Simulate {
            servers,
            users,
            services,
            add,
            remove,
            mode,
            virtual_nodes,
            store_timeout,
            metrics,
        } => {
            let mut router_config = config.router.clone();
            if let Some(mode) = mode {
                router_config.mode = match mode {
                    ModeArg::Local => RouterMode::Local,
                    ModeArg::Distributed => RouterMode::Distributed,
                };
            }
            if let Some(vnodes) = virtual_nodes {
                router_config.virtual_nodes = vnodes;
            }
            if let Some(timeout) = store_timeout {
                router_config.store_timeout_ms = u64::try_from(parse_duration(&timeout)?.as_millis())
                    .map_err(|_| anyhow::anyhow!("store timeout out of range: {}", timeout))?;
            }

            match router_config.mode {
                RouterMode::Local => {
                    let router = LocalRouter::from_config(&router_config)?;
                    simulate(&router, &servers, users, services, &add, &remove).await?;
                    if metrics {
                        print!("{}", router.metrics().render_prometheus("ringroute"));
                    }
                }
                RouterMode::Distributed => {
                    let store: Arc<dyn CoordinationStore> = Arc::new(TimeoutStore::new(
                        MemoryStore::new(),
                        router_config.store_timeout(),
                    ));
                    let router = DistributedRouter::start(store, &router_config).await?;
                    let outcome =
                        simulate(&router, &servers, users, services, &add, &remove).await;
                    if metrics {
                        print!("{}", router.metrics().render_prometheus("ringroute"));
                    }
                    router.shutdown().await;
                    outcome?;
                }
            }
        }
    }

    Ok(())
}

async fn simulate(
    router: &dyn ConnectionRouter,
    servers: &[String],
    users: usize,
    services: usize,
    add: &[String],
    remove: &[String],
) -> anyhow::Result<()> {
    for server in servers {
        router.add_server(server).await?;
    }

    let mut unrouted = 0usize;
    for i in 0..users {
        if router.add_user(&i.to_string()).await?.is_none() {
            unrouted += 1;
        }
    }
    for i in 0..services {
        if router.add_service(&i.to_string()).await?.is_none() {
            unrouted += 1;
        }
    }
    if unrouted > 0 {
        println!("{} connections found no server", unrouted);
    }

    println!("{}", RingReport::collect(router).await);
    println!("{}", LoadReport::collect(router).await);

    for server in add {
        let migrated = router.add_server(server).await?;
        println!(
            "Added {}: {} of {} connections migrate",
            server,
            migrated.len(),
            users + services
        );
    }
    for server in remove {
        let migrated = router.remove_server(server).await?;
        println!("Removed {}: {} connections migrate", server, migrated.len());
    }

    if !add.is_empty() || !remove.is_empty() {
        println!();
        println!("{}", RingReport::collect(router).await);
        println!("{}", LoadReport::collect(router).await);
    }

    Ok(())
}
