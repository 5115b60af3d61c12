use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{info, warn};

use osclink::message::{self, Message};
use osclink::{ServerLink, config, logging, signals};

const HEATMAP_MAX: u32 = 100_000;

#[derive(Parser)]
#[command(name = "osclink-server")]
#[command(about = "Answer osclink requests arriving on the controlling terminal")]
struct Cli {
    /// Number of samples in a heatmap reply
    #[arg(long, default_value_t = 500)]
    heatmap_size: usize,

    /// Config file (defaults to ~/.config/osclink/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let fc = config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let log_dir = fc.log.dir.clone().unwrap_or_else(config::default_log_dir);
    logging::init_file_logging(&log_dir, "osclink-server", &fc.log.filter)?;

    let mut link = ServerLink::stdio();
    link.start()?;

    println!("Server started. Reaching out to client.");
    link.send(message::SERVER_CONNECT.as_bytes())?;

    let result = serve(&mut link, cli.heatmap_size);
    link.finish();

    if let Some(signal) = signals::terminating_signal() {
        info!(signal, "exiting on signal");
        std::process::exit(128 + signal);
    }
    result
}

fn serve<R: Read, W: Write>(link: &mut ServerLink<R, W>, heatmap_size: usize) -> Result<()> {
    while let Some(payload) = link.pull_next() {
        let Some(request) = Message::parse(&payload) else {
            continue;
        };
        info!(command = %request.command, "client request");
        let reply = answer(&request, heatmap_size);
        link.send(&reply.to_payload())
            .with_context(|| format!("Failed to answer {}", request.command))?;
    }
    info!("server loop finished");
    Ok(())
}

fn answer(request: &Message, heatmap_size: usize) -> Message {
    if request.is(message::REQUEST_TOPOLOGY) {
        Message::new(message::TOPOLOGY).arg(topology())
    } else if request.is(message::REQUEST_CONFIG) {
        Message::new(message::CONFIG).arg(format!("heatmap_size={heatmap_size}"))
    } else if request.is(message::REQUEST_HEATMAP_DATA) {
        let mut rng = rand::rng();
        (0..heatmap_size).fold(Message::new(message::HEATMAP_DATA), |reply, _| {
            reply.arg(rng.random_range(0..HEATMAP_MAX).to_string())
        })
    } else {
        warn!(command = %request.command, "unsupported request");
        Message::new(message::SERVER_WARNING)
            .arg(format!("unsupported request {}", request.command))
    }
}

/// Processing units as one opaque field: `System{Machine#0{PU#0,PU#1}}`.
fn topology() -> String {
    let units = std::thread::available_parallelism().map_or(1, |n| n.get());
    let pus: Vec<String> = (0..units).map(|i| format!("PU#{i}")).collect();
    format!("System{{Machine#0{{{}}}}}", pus.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use osclink::codec::{Direction, Scanner};
    use std::io::Cursor;

    fn client_frame(payload: &str) -> Vec<u8> {
        let mut frame = osclink::codec::encode(Direction::ClientToServer, payload.as_bytes());
        frame.push(b'\n');
        frame
    }

    fn replies(output: &[u8]) -> Vec<Message> {
        let mut scanner = Scanner::new(Direction::ServerToClient);
        scanner
            .feed(output)
            .frames
            .iter()
            .filter_map(|p| Message::parse(p))
            .collect()
    }

    #[test]
    fn heatmap_has_requested_size_and_range() {
        let reply = answer(&Message::new(message::REQUEST_HEATMAP_DATA), 25);
        assert!(reply.is(message::HEATMAP_DATA));
        let samples = reply.float_args().unwrap();
        assert_eq!(samples.len(), 25);
        assert!(samples.iter().all(|s| (0.0..HEATMAP_MAX as f32).contains(s)));
    }

    #[test]
    fn unknown_requests_get_a_warning() {
        let mut input = client_frame("REQUEST/FLAMEGRAPH");
        input.extend(client_frame(message::REQUEST_HEATMAP_DATA));
        let mut link = ServerLink::new(Cursor::new(input), Vec::new());
        serve(&mut link, 3).unwrap();

        let replies = replies(link.output());
        assert_eq!(replies.len(), 2);
        assert!(replies[0].is(message::SERVER_WARNING));
        assert_eq!(replies[0].args, vec!["unsupported request REQUEST/FLAMEGRAPH"]);
        assert!(replies[1].is(message::HEATMAP_DATA));
        assert_eq!(replies[1].args.len(), 3);
    }

    #[test]
    fn default_handshake_requests_get_real_answers() {
        let mut input = client_frame(message::REQUEST_TOPOLOGY);
        input.extend(client_frame(message::REQUEST_CONFIG));
        let mut link = ServerLink::new(Cursor::new(input), Vec::new());
        serve(&mut link, 42).unwrap();

        let replies = replies(link.output());
        assert_eq!(replies.len(), 2);
        assert!(replies[0].is(message::TOPOLOGY));
        assert_eq!(replies[0].args.len(), 1);
        assert!(replies[0].args[0].starts_with("System{Machine#0{PU#0"));
        assert!(replies[1].is(message::CONFIG));
        assert_eq!(replies[1].args, vec!["heatmap_size=42"]);
    }
}
