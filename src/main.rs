use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};

use judo::config::Config;
use judo::{jlog_debug, jlog_warn, Command, Error, Inventory, Job, Logger, Payload, Result, Script, SshTransport};

/// Judo - run a command or a script on many hosts over ssh
#[derive(Parser, Debug)]
#[command(name = "judo")]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("payload").required(true).args(["script", "command"])))]
#[command(after_help = "ENVIRONMENT:\n    JUDO_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Script file, or directory containing an executable named `script`, to upload and run
    #[arg(short = 's', long)]
    pub script: Option<PathBuf>,

    /// Shell command to run on every target
    #[arg(short = 'c', long)]
    pub command: Option<String>,

    /// Inventory file (default: from ~/.judo/judo.toml, else ./inventory)
    #[arg(short = 'i', long)]
    pub inventory: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Hosts or groups to target
    #[arg(required = true)]
    pub targets: Vec<String>,
}

impl Cli {
    /// Validate the payload locally, before any host is contacted.
    fn payload(&self) -> Result<Payload> {
        match (&self.script, &self.command) {
            (Some(path), None) => Ok(Payload::Script(Script::new(path)?)),
            (None, Some(cmd)) => Ok(Payload::Command(Command::new(cmd)?)),
            _ => Err(Error::Validation(
                "exactly one of --script and --command is required".to_string(),
            )),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let bootstrap = Logger::new(cli.debug, None);
    let config = Config::load(&bootstrap)?;
    let log = match config.log_path() {
        Some(path) => Logger::new(cli.debug, Some(path)),
        None => bootstrap,
    };

    let payload = cli.payload()?;

    let inventory = match cli.inventory.clone().or_else(|| config.inventory_path()) {
        Some(path) => Inventory::load(&path, &log)?,
        None => {
            jlog_debug!(log, "No inventory file, treating targets as host names");
            Inventory::empty(&log)
        }
    };
    let job = Job::for_targets(&inventory, &cli.targets, payload)?
        .with_remote_dir(config.effective_remote_dir()?)?;
    let transport = Arc::new(SshTransport::from_config(&config)?);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let hosts = job.hosts().to_vec();
        let signal_log = log.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                jlog_warn!(signal_log, "Interrupted, cancelling {} hosts", hosts.len());
                for host in &hosts {
                    host.cancel();
                }
            }
        });

        let result = job.execute(transport, &log).await;
        interrupt.abort();
        result
    });

    let (_, failed) = result.report(&log);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
