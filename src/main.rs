/*
    A replicated bank. Every server holds a full copy of the ledger; a client may send any
    operation to any server. The receiving server stamps the request with its Lamport clock and
    multicasts it to every other server. Requests are executed in (timestamp, server id) order
    once every server's acknowledgment shows nothing earlier can still arrive, so all copies of
    the ledger apply the same operations in the same order.

    A halt request, executed like any other operation, stops the cluster and makes every server
    report its total balance and remaining queue length.
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use lamport_bank::audit::{AuditSink, FileAuditLog, NullAuditLog};
use lamport_bank::client::{run_load, simulate, BankClient, Endpoint, LoadConfig};
use lamport_bank::common::ServerId;
use lamport_bank::config::{ClusterConfig, ReplicaSettings};
use lamport_bank::consensus::Replica;
use lamport_bank::ledger::{AccountId, Balance};
use lamport_bank::logging::{init_logging_with_config, LogConfig, LogLevel};
use lamport_bank::network::{Node, TcpDirectory};

#[derive(Parser, Debug)]
#[command(name = "lamport-bank", version, about)]
struct Args {
    /// trace, debug, info, warn or error
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one replica until a halt request is executed
    Serve {
        #[arg(long)]
        id: ServerId,
        /// Server table, one `host serverId port` per line
        #[arg(long)]
        servers: PathBuf,
        /// Replica settings in TOML
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
    /// Send a single operation to one server
    Client {
        #[arg(long)]
        servers: PathBuf,
        #[arg(long)]
        server: ServerId,
        #[command(subcommand)]
        action: Action,
    },
    /// Random concurrent transfers across every configured server
    Load {
        #[arg(long)]
        servers: PathBuf,
        #[command(flatten)]
        workload: Workload,
        /// Leave the cluster running afterwards
        #[arg(long)]
        no_halt: bool,
    },
    /// Run the load generator against an in-process cluster
    Simulate {
        #[arg(long, default_value_t = 3)]
        replicas: ServerId,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[command(flatten)]
        workload: Workload,
    },
}

#[derive(Subcommand, Debug)]
enum Action {
    Create,
    Deposit {
        account: AccountId,
        #[arg(allow_negative_numbers = true)]
        amount: Balance,
    },
    Balance {
        account: AccountId,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        #[arg(allow_negative_numbers = true)]
        amount: Balance,
    },
    Halt,
    Id,
}

#[derive(clap::Args, Debug)]
struct Workload {
    #[arg(long, default_value_t = 4)]
    tasks: usize,
    #[arg(long, default_value_t = 50)]
    iterations: usize,
    #[arg(long, default_value_t = 20)]
    accounts: AccountId,
    #[arg(long, default_value_t = 50)]
    max_amount: Balance,
    #[arg(long)]
    seed: Option<u64>,
}

impl Workload {
    fn into_config(self, halt: bool) -> LoadConfig {
        LoadConfig {
            tasks: self.tasks,
            iterations: self.iterations,
            accounts: self.accounts,
            max_amount: self.max_amount,
            seed: self.seed,
            halt,
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<ReplicaSettings> {
    match path {
        Some(path) => ReplicaSettings::load(path).with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(ReplicaSettings::default()),
    }
}

async fn serve(id: ServerId, servers: PathBuf, settings: Option<PathBuf>, audit_log: Option<PathBuf>) -> Result<()> {
    let cluster = ClusterConfig::load(&servers)?;
    let mut settings = load_settings(settings.as_ref())?;
    if audit_log.is_some() {
        settings.audit_log = audit_log;
    }
    let peers = cluster.peers_of(id)?;
    let port = cluster.address(id)?.port;

    let audit: Arc<dyn AuditSink> = match &settings.audit_log {
        Some(path) => Arc::new(
            FileAuditLog::open(path).with_context(|| format!("opening audit log {}", path.display()))?,
        ),
        None => Arc::new(NullAuditLog),
    };
    let directory = Arc::new(TcpDirectory::new(&cluster, &settings));
    let replica = Arc::new(Replica::new(id, peers, &settings, directory, audit));

    let node = Node::bind(replica, ("0.0.0.0", port), settings.shutdown_grace).await?;
    let report = node.run().await?;
    println!("{report}");
    println!("ledger digest {}", report.ledger_digest);
    Ok(())
}

async fn client(servers: PathBuf, server: ServerId, action: Action) -> Result<()> {
    let cluster = ClusterConfig::load(&servers)?;
    let client = BankClient::new(&cluster, server, &ReplicaSettings::default())?;
    match action {
        Action::Create => println!("{}", client.create_account().await?),
        Action::Deposit { account, amount } => println!("{}", client.deposit(account, amount).await?),
        Action::Balance { account } => match client.get_balance(account).await? {
            Some(balance) => println!("{balance}"),
            None => bail!("account {account} does not exist on server {server}"),
        },
        Action::Transfer { from, to, amount } => println!("{}", client.transfer(from, to, amount).await?),
        Action::Halt => println!("{}", client.halt().await?),
        Action::Id => println!("{}", client.get_server_id().await?),
    }
    Ok(())
}

async fn load(servers: PathBuf, config: LoadConfig) -> Result<()> {
    let cluster = ClusterConfig::load(&servers)?;
    let settings = ReplicaSettings::default();
    let mut endpoints: Vec<Arc<dyn Endpoint>> = Vec::new();
    for id in cluster.server_ids() {
        endpoints.push(Arc::new(BankClient::new(&cluster, id, &settings)?));
    }

    let summary = run_load(endpoints, &config).await?;
    println!(
        "{} requests, {} ok, {} insufficient funds, {} other; latency mean {:?} max {:?}",
        summary.requests,
        summary.ok,
        summary.insufficient_funds,
        summary.other,
        summary.mean_latency,
        summary.max_latency
    );
    if let Some(report) = summary.halt {
        println!("halted: {report}");
    }
    Ok(())
}

async fn run_simulation(replicas: ServerId, settings: Option<PathBuf>, config: LoadConfig) -> Result<()> {
    let settings = load_settings(settings.as_ref())?;
    let (summary, reports) = simulate(replicas, &settings, &config).await?;
    println!(
        "{} requests, {} ok, {} insufficient funds; latency mean {:?} max {:?}",
        summary.requests, summary.ok, summary.insufficient_funds, summary.mean_latency, summary.max_latency
    );
    for report in &reports {
        println!("{report} {}", report.ledger_digest);
    }
    if reports.windows(2).any(|pair| pair[0].ledger_digest != pair[1].ledger_digest) {
        bail!("replicas diverged");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: LogLevel = args.log_level.parse()?;
    init_logging_with_config(LogConfig::new(level).json_format(args.json_logs))?;

    match args.command {
        Command::Serve {
            id,
            servers,
            settings,
            audit_log,
        } => serve(id, servers, settings, audit_log).await?,
        Command::Client { servers, server, action } => client(servers, server, action).await?,
        Command::Load {
            servers,
            workload,
            no_halt,
        } => load(servers, workload.into_config(!no_halt)).await?,
        Command::Simulate {
            replicas,
            settings,
            workload,
        } => run_simulation(replicas, settings, workload.into_config(true)).await?,
    }

    info!("done");
    Ok(())
}
