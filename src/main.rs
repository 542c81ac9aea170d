//! CLI for fanbus
//!
//! Subcommands:
//! - `node`: join the bus on a RabbitMQ broker and broadcast lines from stdin
//! - `demo`: run two nodes against an in-process broker and exchange a ping

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fanbus::broker::{AmqpConnector, Connector, MemoryBroker, MemoryConnector};
use fanbus::config::{Settings, load_config};
use fanbus::message::{ClusterMemberInfo, ClusterMessage, JsonMessageFormatter, MessageFormatter};
use fanbus::utils::logging;
use fanbus::{BrokerEndpoint, FanoutChannel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const TEXT_MESSAGE: &str = "TextMessage";

#[derive(Parser)]
#[command(name = "fanbus")]
enum Command {
    /// Join the bus and broadcast every line typed on stdin ('exit' quits)
    Node {
        /// Broker URL, overrides configuration
        #[arg(long)]
        url: Option<String>,
        /// Fanout exchange name, overrides configuration
        #[arg(long)]
        exchange: Option<String>,
    },
    /// Run two nodes on an in-process broker and send a ping between them
    Demo {
        #[arg(long, default_value = "ping-42")]
        payload: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&settings.logging.level);

    let cmd = Command::parse();

    let result = match cmd {
        Command::Node { url, exchange } => run_node(settings, url, exchange).await,
        Command::Demo { payload } => run_demo(&payload).await,
    };
    if let Err(e) = result {
        error!("fanbus failed: {e}");
    }
}

/// Builds a channel whose handler prints text messages from other nodes.
fn printing_node(
    endpoint: BrokerEndpoint,
    connector: Arc<dyn Connector>,
    member: ClusterMemberInfo,
    received: Option<mpsc::UnboundedSender<ClusterMessage>>,
) -> FanoutChannel {
    FanoutChannel::new(endpoint, connector, move |body: Vec<u8>| {
        let message = match JsonMessageFormatter.deserialize(&body) {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping unreadable message: {e}");
                return;
            }
        };
        // every node gets its own broadcasts back
        if message.is_from(&member) {
            return;
        }
        println!(
            "Received: from {}: '{}'",
            message.sender.instance_id, message.body
        );
        if let Some(tx) = &received {
            let _ = tx.send(message);
        }
    })
}

async fn run_node(
    settings: Settings,
    url: Option<String>,
    exchange: Option<String>,
) -> fanbus::Result<()> {
    let mut rabbitmq = settings.rabbitmq.clone();
    if let Some(url) = url {
        rabbitmq.service_url = url;
    }
    if let Some(exchange) = exchange {
        rabbitmq.message_exchange = exchange;
    }

    let endpoint = BrokerEndpoint::from_settings(&rabbitmq)?;
    let member = ClusterMemberInfo::from(&settings.cluster);
    let connector = Arc::new(AmqpConnector::new().with_connection_name(format!(
        "fanbus-{}",
        member.instance_id
    )));

    let channel = printing_node(endpoint, connector, member.clone(), None);
    let cancel = CancellationToken::new();
    channel.start(&cancel).await?;

    println!();
    println!("fanbus node");
    println!("-----------");
    println!("Start two or more nodes and type a message under the prompt.");
    println!("Every other node should print it. Type 'exit' to quit.");
    println!();
    println!("InstanceId: {}", member.instance_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line == "exit" {
            break;
        }
        let message = ClusterMessage::new(member.clone(), TEXT_MESSAGE, line);
        if let Some(sent) = channel.send_message(&JsonMessageFormatter, &message, &cancel)? {
            let _ = sent.await;
        }
        println!("ok");
    }

    channel.stop().await;
    Ok(())
}

async fn run_demo(payload: &str) -> fanbus::Result<()> {
    let broker = MemoryBroker::new();
    let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(broker.clone()));
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let node_a = ClusterMemberInfo::new();
    let node_b = ClusterMemberInfo::new();
    let a = printing_node(BrokerEndpoint::default(), connector.clone(), node_a.clone(), None);
    let b = printing_node(BrokerEndpoint::default(), connector, node_b, Some(tx));

    a.start(&cancel).await?;
    b.start(&cancel).await?;

    let message = ClusterMessage::new(node_a, TEXT_MESSAGE, payload);
    if let Some(sent) = a.send_message(&JsonMessageFormatter, &message, &cancel)? {
        let _ = sent.await;
    }

    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(received)) => info!(body = %received.body, "node b received the broadcast"),
        _ => error!("node b did not receive the broadcast"),
    }

    a.stop().await;
    b.stop().await;
    Ok(())
}
