use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use relaytree_core::{logging, Config, LoopbackDriver, TreeId, TreeService, ViewerId};

const SOURCE_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=source\r\nt=0 0\r\n";
const VIEWER_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=viewer\r\nt=0 0\r\n";

#[derive(Parser, Debug)]
#[command(name = "relaytree")]
#[command(about = "Broadcast tree placement for media clusters", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, short, env = "RELAYTREE_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a join/leave workload against a cluster driven by the loopback driver
    Simulate {
        /// Number of trees
        #[arg(long, default_value = "1")]
        trees: usize,

        /// Viewers joining each tree
        #[arg(long, default_value = "20")]
        viewers: usize,

        /// Viewers leaving each tree once every join is done
        #[arg(long, default_value = "0")]
        leave: usize,

        /// Release every tree at the end
        #[arg(long)]
        release: bool,

        #[arg(long, value_enum, default_value = "summary")]
        format: OutputFormat,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Summary,
    Json,
    Dot,
}

/// Explicit path, then `config.yaml` in the working directory, then defaults
fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path.map(str::to_string).or_else(|| {
        let cwd = "config.yaml";
        Path::new(cwd).exists().then(|| cwd.to_string())
    });
    if let Some(path) = &path {
        if !Path::new(path).exists() {
            anyhow::bail!("config file {path} does not exist");
        }
        eprintln!("Loading config from {path}");
    }
    Ok(Config::load(path.as_deref())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Simulate {
            trees,
            viewers,
            leave,
            release,
            format,
        } => {
            simulate(&config, trees, viewers, leave, release, format).await?;
        }
    }

    Ok(())
}

async fn simulate(
    config: &Config,
    trees: usize,
    viewers: usize,
    leave: usize,
    release: bool,
    format: OutputFormat,
) -> Result<()> {
    let driver = Arc::new(LoopbackDriver::new());
    let service = Arc::new(TreeService::from_config(config, driver.clone())?);
    let maintenance = (config.cluster.idle_reap_interval_secs > 0).then(|| {
        service.spawn_maintenance(Duration::from_secs(config.cluster.idle_reap_interval_secs))
    });

    let ids: Vec<TreeId> = (0..trees).map(|_| service.create_tree()).collect();
    for id in &ids {
        service.set_tree_source(id, SOURCE_OFFER).await?;
    }

    // Trees fill in parallel, viewers of one tree in order
    let joins = ids.iter().cloned().map(|id| {
        let service = Arc::clone(&service);
        async move {
            let mut joined = Vec::new();
            for i in 0..viewers {
                let viewer = ViewerId::from(format!("viewer-{i}"));
                match service.add_tree_sink(&id, viewer.clone(), VIEWER_OFFER).await {
                    Ok(_) => joined.push(viewer),
                    Err(e) if e.is_retryable() => {
                        warn!(tree_id = %id, viewer_id = %viewer, error = %e, "Viewer rejected");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok((id, joined))
        }
    });
    let mut rejected = 0;
    let mut joined_per_tree = Vec::new();
    for result in join_all(joins).await {
        let (id, joined) = result?;
        rejected += viewers - joined.len();
        joined_per_tree.push((id, joined));
    }

    for (id, joined) in &joined_per_tree {
        for viewer in joined.iter().take(leave) {
            service.remove_tree_sink(id, viewer).await?;
        }
    }

    if release {
        for id in &ids {
            service.release_tree(id).await?;
        }
        let released = service.membership().release_idle_nodes().await;
        info!(released_nodes = released.len(), "Released all trees");
    }

    if let Some(task) = maintenance {
        task.abort();
    }

    info!(
        trees,
        viewers_per_tree = viewers,
        rejected,
        nodes = service.membership().node_count(),
        remote_elements = driver.live_elements(),
        "Simulation finished"
    );

    let snapshot = service.topology();
    match format {
        OutputFormat::Json => println!("{}", snapshot.to_json()?),
        OutputFormat::Dot => print!("{}", snapshot.to_dot()),
        OutputFormat::Summary => {
            println!("nodes:");
            for node in &snapshot.nodes {
                println!(
                    "  {:<12} load={:.2} endpoints={} stubs={} pipelines={}{}",
                    node.id.as_str(),
                    node.load,
                    node.population.endpoints,
                    node.population.tunnel_stubs,
                    node.population.pipelines,
                    if node.admits_more { "" } else { " full" }
                );
            }
            println!("trees:");
            for id in &ids {
                let tree = service.describe_tree(id).await?;
                println!(
                    "  {:<12} state={} viewers={} nodes={} tunnels={}",
                    tree.id.as_str(),
                    tree.state,
                    tree.viewers,
                    tree.nodes.len(),
                    tree.tunnels
                );
            }
            println!("rejected viewers: {rejected}");
        }
    }

    Ok(())
}
