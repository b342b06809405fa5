//! CLI entry point for pontoon-ctl: inspect a node and submit commands.

use clap::{Parser, Subcommand};
use pontoon::cluster::rpc::{CommandRequest, CommandResponse};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pontoon-ctl", about = "Pontoon cluster inspection tool")]
struct Cli {
    /// Node to talk to (host:port).
    #[arg(long, default_value = "127.0.0.1:8700")]
    node: String,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the node's term, role and vote
    Status,
    /// Show the node's view of cluster membership
    Cluster,
    /// Dump the node's command log
    Log,
    /// Submit a command, retrying once at the leader the node names
    Submit {
        #[arg(long, default_value_t = 0)]
        id: i64,
        #[arg(long, default_value = "")]
        name: String,
        /// Command payload.
        body: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(cli.timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error building HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let rc = match cli.command {
        Commands::Status => run_get(&client, &cli.node, "/node").await,
        Commands::Cluster => run_get(&client, &cli.node, "/cluster").await,
        Commands::Log => run_get(&client, &cli.node, "/print").await,
        Commands::Submit { id, name, body } => {
            let request = CommandRequest { id, name, body };
            run_submit(&client, &cli.node, request).await
        }
    };
    std::process::exit(rc);
}

async fn run_get(client: &reqwest::Client, node: &str, path: &str) -> i32 {
    let result = async {
        let resp = client
            .get(format!("http://{node}{path}"))
            .send()
            .await?
            .error_for_status()?;
        resp.json::<serde_json::Value>().await
    }
    .await;

    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => {
                println!("{}", text);
                0
            }
            Err(e) => {
                eprintln!("Error formatting response: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("Error querying {}: {}", node, e);
            1
        }
    }
}

async fn run_submit(client: &reqwest::Client, node: &str, request: CommandRequest) -> i32 {
    let first = match post_command(client, node, &request).await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error submitting to {}: {}", node, e);
            return 1;
        }
    };

    let response = match retry_target(node, &first) {
        Some(leader) => {
            eprintln!("{} is not the leader, retrying at {}", node, leader);
            match post_command(client, &leader, &request).await {
                Ok(resp) => resp,
                Err(e) => {
                    eprintln!("Error submitting to {}: {}", leader, e);
                    return 1;
                }
            }
        }
        None => first,
    };

    report(&response)
}

async fn post_command(
    client: &reqwest::Client,
    node: &str,
    request: &CommandRequest,
) -> Result<CommandResponse, reqwest::Error> {
    // Rejections come back as 503 with a CommandResponse body.
    client
        .post(format!("http://{node}/command"))
        .json(request)
        .send()
        .await?
        .json::<CommandResponse>()
        .await
}

/// Leader worth retrying at, if the node rejected and named someone else.
fn retry_target(node: &str, response: &CommandResponse) -> Option<String> {
    if response.success {
        return None;
    }
    response.leader.clone().filter(|leader| leader != node)
}

fn report(response: &CommandResponse) -> i32 {
    if response.success {
        match response.index {
            Some(index) => println!("admitted at index {}", index),
            None => println!("admitted"),
        }
        0
    } else {
        let mut msg = format!("rejected: {}", response.message);
        if let Some(leader) = &response.leader {
            msg.push_str(&format!(" (leader: {})", leader));
        }
        eprintln!("{}", msg);
        1
    }
}
