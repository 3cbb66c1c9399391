use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use benchfleet::agent::{ClientAgent, ServerAgent};
use benchfleet::config::{AgentConfig, LifecycleConfig, DEFAULT_READY_MARKER};
use benchfleet::driver::DriverClient;
use benchfleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "benchfleet")]
#[command(version)]
#[command(about = "Benchmark agents that run servers and load workers for remote drivers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the server agent (launches benchmarked applications)
    Server(AgentArgs),

    /// Run the client agent (launches load-generation workers)
    Client(AgentArgs),

    /// Driver commands against a running agent
    Job {
        #[command(flatten)]
        driver: DriverArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:5010")]
    listen: SocketAddr,

    /// Host name drivers use to reach launched applications
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Lifecycle tick interval in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Driver silence (ms) after which a job is deleted
    #[arg(long, default_value = "30000")]
    liveness_timeout_ms: u64,

    /// Time (ms) between interrupt and kill when stopping a process
    #[arg(long, default_value = "5000")]
    grace_ms: u64,

    /// Output substring that marks an application as ready
    #[arg(long, default_value = DEFAULT_READY_MARKER)]
    ready_marker: String,

    /// Lines retained per job log
    #[arg(long, default_value = "1000")]
    log_capacity: usize,

    /// Maximum number of jobs held at once
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Interval (ms) between resource samples of a running application
    #[arg(long, default_value = "1000")]
    counter_interval_ms: u64,

    /// Resource samples kept per job
    #[arg(long, default_value = "600")]
    max_counter_samples: usize,

    /// Parent directory of per-job working directories
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Extra scenario mapping, format "name=/path" (repeatable)
    #[arg(long = "scenario", value_parser = parse_scenario)]
    scenarios: Vec<(String, String)>,
}

impl AgentArgs {
    fn into_config(self) -> AgentConfig {
        let lifecycle = LifecycleConfig {
            tick_interval_ms: self.tick_ms,
            liveness_timeout_ms: self.liveness_timeout_ms,
            stop_grace_period_ms: self.grace_ms,
            ready_marker: self.ready_marker,
            counter_interval_ms: self.counter_interval_ms,
            max_counter_samples: self.max_counter_samples,
            ..LifecycleConfig::default()
        };

        let mut config = AgentConfig::new(self.listen)
            .with_hostname(self.hostname)
            .with_lifecycle(lifecycle);
        config.log_capacity = self.log_capacity;
        config.max_jobs = self.max_jobs;
        config.work_root = self.work_root;
        for (name, path) in &self.scenarios {
            config = config.with_scenario(name, path);
        }
        config
    }
}

fn parse_scenario(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && path.starts_with('/') => {
            Ok((name.trim().to_string(), path.to_string()))
        }
        _ => Err(format!("expected name=/path, got {:?}", value)),
    }
}

// =============================================================================
// Driver Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DriverArgs {
    /// Agent address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:5010")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job description (JSON file, or "-" for stdin)
    Submit { file: PathBuf },
    /// Show a job (also counts as a heartbeat)
    Status { job_id: u64 },
    /// Send a heartbeat
    Touch { job_id: u64 },
    /// Request deletion of a job
    Delete { job_id: u64 },
    /// List all jobs
    List,
    /// Print captured process output
    Output {
        job_id: u64,

        /// Absolute line position to start from
        #[arg(long, default_value = "0")]
        skip: u64,
    },
}

// =============================================================================
// Agent Implementation
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_agent(args: AgentArgs, client_side: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = args.into_config();
    tracing::info!(
        listen_addr = %config.listen_addr,
        hostname = %config.hostname,
        role = if client_side { "client" } else { "server" },
        scenarios = ?config.scenarios.names().collect::<Vec<_>>(),
        "Starting benchfleet agent"
    );

    let shutdown = install_shutdown_handler();
    if client_side {
        ClientAgent::new(config).run(shutdown).await?;
    } else {
        ServerAgent::new(config).run(shutdown).await?;
    }
    Ok(())
}

// =============================================================================
// Driver Command Handlers
// =============================================================================

fn field<'a>(job: &'a Value, name: &str) -> &'a str {
    job.get(name).and_then(Value::as_str).unwrap_or("-")
}

fn print_job(job: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:  {}", job.get("id").and_then(Value::as_u64).unwrap_or(0));
            println!("State:   {}", field(job, "state"));
            if let Some(url) = job.get("url").and_then(Value::as_str) {
                println!("URL:     {}", url);
            }
            if let Some(pid) = job.get("processId").and_then(Value::as_u64) {
                println!("PID:     {}", pid);
            }
            if let Some(error) = job.get("error").and_then(Value::as_str) {
                println!("Error:   {}", error);
            }
        }
    }
    Ok(())
}

async fn handle_job(
    driver: DriverArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = DriverClient::new(&driver.addr);

    match command {
        JobCommands::Submit { file } => {
            let raw = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                tokio::fs::read_to_string(&file).await?
            };
            let description: Value = serde_json::from_str(&raw)?;
            let job = client.submit(&description).await?;
            match driver.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job.get("id").and_then(Value::as_u64).unwrap_or(0));
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = client.status(job_id).await?;
            print_job(&job, &driver.output)?;
        }
        JobCommands::Touch { job_id } => {
            client.touch(job_id).await?;
            if let OutputFormat::Table = driver.output {
                println!("Job {} touched", job_id);
            }
        }
        JobCommands::Delete { job_id } => {
            client.delete(job_id).await?;
            if let OutputFormat::Table = driver.output {
                println!("Job {} marked for deletion", job_id);
            }
        }
        JobCommands::List => {
            let jobs = client.list().await?;
            match driver.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found");
                        return Ok(());
                    }
                    println!("{:<8} {:<16} {:<14} SESSION", "ID", "STATE", "SCENARIO");
                    for job in &jobs {
                        println!(
                            "{:<8} {:<16} {:<14} {}",
                            job.get("id").and_then(Value::as_u64).unwrap_or(0),
                            field(job, "state"),
                            job.get("scenario")
                                .or_else(|| job.get("executable"))
                                .and_then(Value::as_str)
                                .unwrap_or("-"),
                            field(job, "sessionId"),
                        );
                    }
                }
            }
        }
        JobCommands::Output { job_id, skip } => {
            let page = client.output(job_id, skip).await?;
            match driver.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                OutputFormat::Table => {
                    if page.discarded > skip {
                        eprintln!("({} lines discarded before this page)", page.discarded - skip);
                    }
                    for line in &page.lines {
                        println!("{}", line);
                    }
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(agent_args) => run_agent(agent_args, false).await?,
        Commands::Client(agent_args) => run_agent(agent_args, true).await?,
        Commands::Job { driver, command } => handle_job(driver, command).await?,
    }

    Ok(())
}
