use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use tracing::{info, warn};

use osclink::config::{self, FileConfig, LocalConfig, SshSettings};
use osclink::message::{self, Message};
use osclink::terminal::TerminalGuard;
use osclink::{LocalLink, Password, SshLink, Transport, logging, signals};

const PASSWORD_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "osclink-client")]
#[command(about = "Talk to a collector that is only reachable through a terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/osclink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a local shell with the tunnel running underneath it
    Local(LocalArgs),
    /// Launch the collector over SSH and talk to it directly
    Ssh(SshArgs),
}

#[derive(Parser)]
struct LocalArgs {
    /// Shell to run (default: $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Requests sent once the server connects (default: topology and config)
    #[arg(long = "request")]
    requests: Vec<String>,
}

#[derive(Parser)]
struct SshArgs {
    /// Remote host, optionally as USER@HOST
    destination: String,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Trust an unknown host key for this session without asking
    #[arg(long)]
    trust_host: bool,

    /// Requests sent once the server connects (default: topology and config)
    #[arg(long = "request")]
    requests: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let fc = config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let log_dir = fc.log.dir.clone().unwrap_or_else(config::default_log_dir);
    let log_path = logging::init_file_logging(&log_dir, "osclink-client", &fc.log.filter)?;
    info!(log = %log_path.display(), "osclink-client starting");

    signals::install().context("Failed to install signal handlers")?;

    let result = match cli.command {
        Commands::Local(args) => run_local(&fc, args),
        Commands::Ssh(args) => run_ssh(&fc, args),
    };

    if let Some(signal) = signals::terminating_signal() {
        info!(signal, "exiting on signal");
        std::process::exit(128 + signal);
    }
    result
}

fn run_local(fc: &FileConfig, args: LocalArgs) -> Result<()> {
    let mut config = LocalConfig::from_file(&fc.local);
    if args.shell.is_some() {
        config.shell = args.shell;
    }
    let poll_interval = config.poll_interval;
    let requests = requests_or_default(args.requests);

    let mut link = LocalLink::new(config);
    link.start().context("Failed to start local tunnel")?;
    let inbox = link.inbox();

    // Shell output owns the screen, so payloads only go to the log.
    while link.is_running() {
        if let Some(payload) = inbox.wait_timeout_and_pop(poll_interval) {
            dispatch(&mut link, &payload, &requests)?;
        }
    }
    link.finish();
    Ok(())
}

fn run_ssh(fc: &FileConfig, args: SshArgs) -> Result<()> {
    let mut settings = SshSettings::from_file(&fc.ssh);
    match args.destination.split_once('@') {
        Some((user, host)) => {
            settings.user = user.to_string();
            settings.host = host.to_string();
        }
        None => settings.host = args.destination.clone(),
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    let poll_interval = settings.poll_interval;
    let requests = requests_or_default(args.requests);

    let mut link = SshLink::new(settings).context("Failed to set up SSH client")?;
    link.connect()
        .with_context(|| format!("Failed to connect to {}", link.host))?;

    if !link.is_host_known() {
        if args.trust_host {
            link.ignore_unknown_host();
        } else {
            confirm_host(&mut link)?;
        }
    }

    if let Err(e) = link.try_authenticate_with_publickey() {
        info!(error = %e, "falling back to password authentication");
        authenticate_with_password(&mut link)?;
    }

    link.start().context("Failed to start the remote collector")?;
    println!("Attached to {}. Type one payload per line, Ctrl-D to quit.", link.host);

    let lines = spawn_line_reader();
    loop {
        while let Some(payload) = link.try_pull() {
            println!("server sends: {}", String::from_utf8_lossy(&payload));
            dispatch(&mut link, &payload, &requests)?;
        }
        match lines.recv_timeout(poll_interval) {
            Ok(line) if line.is_empty() => {}
            Ok(line) => link.send(line.as_bytes())?,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if signals::termination_requested() {
            break;
        }
        if !link.is_running() {
            warn!("remote command ended");
            println!("The remote command has ended.");
            break;
        }
    }
    link.disconnect();
    Ok(())
}

fn confirm_host(link: &mut SshLink) -> Result<()> {
    let answer = prompt(&format!(
        "The authenticity of host '{}' can't be established.\n\
         Trust it [o]nce, [s]ave it to known_hosts, or [N]o? ",
        link.host
    ))?;
    match answer.trim().to_ascii_lowercase().as_str() {
        "o" | "once" => link.ignore_unknown_host(),
        "s" | "save" => link
            .write_known_hosts()
            .context("Failed to save host key")?,
        _ => bail!("Host key for {} not trusted", link.host),
    }
    Ok(())
}

fn authenticate_with_password(link: &mut SshLink) -> Result<()> {
    for attempt in 1..=PASSWORD_ATTEMPTS {
        let password = read_password(&format!("{}@{}'s password: ", link.user, link.host))?;
        link.password = Password::from(password);
        match link.authenticate_with_password() {
            Ok(()) => return Ok(()),
            Err(e) if attempt < PASSWORD_ATTEMPTS => eprintln!("{e}"),
            Err(e) => return Err(e).context("Authentication failed"),
        }
    }
    bail!("Authentication failed")
}

/// React to one server payload. Shared by both transports.
fn dispatch<T: Transport>(link: &mut T, payload: &[u8], requests: &[String]) -> Result<()> {
    let Some(msg) = Message::parse(payload) else {
        return Ok(());
    };
    info!(command = %msg.command, args = msg.args.len(), "server sends");

    if msg.is(message::SERVER_CONNECT) {
        info!("the server has been connected");
        for request in requests {
            link.send(request.as_bytes())
                .with_context(|| format!("Failed to send {request}"))?;
        }
    } else if msg.is(message::HEATMAP_DATA) {
        match msg.float_args() {
            Ok(samples) => info!(samples = samples.len(), "heatmap received"),
            Err(e) => warn!(error = %e, "bad heatmap sample"),
        }
    } else if msg.is(message::TOPOLOGY) || msg.is(message::CONFIG) {
        let bytes: usize = msg.args.iter().map(String::len).sum();
        info!(command = %msg.command, bytes, "received");
    } else if msg.is(message::SERVER_WARNING) {
        warn!(text = %msg.args.join(";"), "server warning");
    } else {
        warn!(command = %msg.command, "bad server response");
    }
    Ok(())
}

fn requests_or_default(requests: Vec<String>) -> Vec<String> {
    if requests.is_empty() {
        vec![
            message::REQUEST_TOPOLOGY.to_string(),
            message::REQUEST_CONFIG.to_string(),
        ]
    } else {
        requests
    }
}

fn spawn_line_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line.trim_end().to_string()).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt(question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer)
}

fn read_password(question: &str) -> Result<String> {
    let guard = TerminalGuard::new();
    guard.disable_echo();
    let answer = prompt(question);
    drop(guard);
    println!();
    let mut answer = answer?;
    while answer.ends_with(['\n', '\r']) {
        answer.pop();
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requests_match_the_handshake() {
        assert_eq!(
            requests_or_default(Vec::new()),
            vec!["REQUEST/TOPOLOGY", "REQUEST/CONFIG"]
        );
        assert_eq!(
            requests_or_default(vec!["REQUEST/HEATMAP-DATA".into()]),
            vec!["REQUEST/HEATMAP-DATA"]
        );
    }

    #[test]
    fn ssh_destination_parses() {
        let cli = Cli::parse_from(["osclink-client", "ssh", "ops@collector", "-p", "2222"]);
        let Commands::Ssh(args) = cli.command else {
            panic!("expected ssh subcommand");
        };
        assert_eq!(args.destination, "ops@collector");
        assert_eq!(args.port, Some(2222));
        assert!(!args.trust_host);
    }
}
