use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use mangodb::{
    cli::{Cli, ClientArgs, Command, DemoArgs, Request},
    client::Client,
    cluster::{ClusterOptions, LocalCluster},
    node::Node,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let node = Node::bind(args.node_config()?).await?;
            info!(
                leader = node.replica().is_leader(),
                "replica listening on {}",
                node.local_addr()?
            );
            let replica = node.run_until_ctrl_c().await?;
            info!(
                applied = replica.next_index(),
                keys = replica.store().len(),
                "replica exited"
            );
        }
        Command::Client(args) => run_client(args).await?,
        Command::Demo(args) => run_demo(args).await?,
    }

    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut client = Client::connect(args.client_config()).await?;
    match args.request {
        Request::Write { keys, values, to } => {
            let host = client.write(keys, values, to).await?;
            println!("ok (acknowledged by {host})");
        }
        Request::Read { keys, to } => {
            let reply = client.read(keys, to).await?;
            for ((key, value), order_index) in reply
                .keys
                .iter()
                .zip(&reply.values)
                .zip(&reply.order_indices)
            {
                match (value, order_index) {
                    (Some(value), Some(order_index)) => {
                        println!("{key} = {value} (order index {order_index}, from {})", reply.host)
                    }
                    _ => println!("{key} is not set (from {})", reply.host),
                }
            }
        }
        Request::Exit { to: Some(host) } => client.exit_single(host).await?,
        Request::Exit { to: None } => client.exit().await?,
    }
    Ok(())
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let cluster = LocalCluster::spawn(ClusterOptions {
        followers: args.followers,
        order_on_write: args.order_on_write,
        ..ClusterOptions::default()
    })
    .await?;
    info!(leader = %cluster.leader(), followers = ?cluster.followers(), "demo cluster up");

    let result = demo_writes(&cluster).await;
    if let Err(err) = &result {
        warn!("demo failed: {err:?}");
    }
    cluster.shutdown().await?;
    result
}

async fn demo_writes(cluster: &LocalCluster) -> Result<()> {
    let mut client = cluster.client().await?;
    for round in 1..=5 {
        let host = client
            .write("World!", format!("Hello{round}?"), None)
            .await
            .with_context(|| format!("write {round} failed"))?;
        info!(round, %host, "demo write acknowledged");
    }

    let reply = client.read("World!", None).await?;
    let value = reply.value().context("demo key is missing")?;
    let order_index = reply.order_index().context("demo key has no order index")?;
    println!(
        "World! = {value} (order index {order_index}, from {})",
        reply.host
    );
    Ok(())
}
