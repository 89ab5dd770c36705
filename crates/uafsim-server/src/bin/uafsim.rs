//! CLI entrypoint for the uafsim server and rehearsal tooling.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uafsim_registry::ChunkRegistry;
use uafsim_server::protocol::escape_bytes;
use uafsim_server::scenario::{self, ScenarioRunner, ScenarioSet};
use uafsim_server::structured_log::{self, LogEmitter, LogLevel, SharedLog};
use uafsim_server::{AllocRequest, Client, Request, Server, ServerConfig};

/// Heap-lifecycle simulator served over TCP.
#[derive(Debug, Parser)]
#[command(name = "uafsim")]
#[command(about = "Chunk lifecycle simulator for rehearsing heap-bug triage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Where to reach a server. Unset values come from `UAFSIM_*` or defaults.
#[derive(Debug, clap::Args)]
struct Target {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

impl Target {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server in the foreground.
    Serve {
        #[command(flatten)]
        target: Target,
        /// Bytes per socket read; also the largest frame.
        #[arg(long)]
        read_buffer: Option<usize>,
        /// Append JSONL logs here instead of stderr.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Minimum log level (trace, debug, info, warn, error).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Send frames over one connection and print each reply.
    Send {
        #[command(flatten)]
        target: Target,
        /// Treat each frame as hex instead of text.
        #[arg(long)]
        hex: bool,
        /// Frames to send, in order.
        #[arg(required = true)]
        frames: Vec<String>,
    },
    /// Allocate a chunk: sends `ALLOC` with a little-endian size field.
    Alloc {
        #[command(flatten)]
        target: Target,
        /// Declared size; data past it is truncated by the server.
        #[arg(long)]
        size: u32,
        /// Treat the data as hex instead of text.
        #[arg(long)]
        hex: bool,
        /// Chunk contents.
        #[arg(default_value = "")]
        data: String,
    },
    /// List the built-in scenario sets, or print one as JSON.
    Scenarios {
        /// Set to print; lists names when omitted.
        name: Option<String>,
    },
    /// Replay scenario sets against a running server and print a JSON report.
    Rehearse {
        #[command(flatten)]
        target: Target,
        /// Scenario set JSON file (repeatable).
        #[arg(long)]
        scenario: Vec<PathBuf>,
        /// Built-in scenario set name (repeatable). All built-ins run when
        /// neither this nor --scenario is given.
        #[arg(long)]
        builtin: Vec<String>,
        /// Fixed value for `${run}`; random when omitted.
        #[arg(long)]
        run_tag: Option<String>,
        /// Output path for the report (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Log file path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn resolve(config: &ServerConfig) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let addr = config.bind_address();
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("{addr} did not resolve to any address").into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            target,
            read_buffer,
            log,
            log_level,
        } => {
            let mut config = target.config();
            if let Some(n) = read_buffer.filter(|&n| n > 0) {
                config.read_buffer = n;
            }
            if let Some(level) = log_level {
                config.log_level = LogLevel::from_str_loose(&level)
                    .ok_or_else(|| format!("unknown log level {level:?}"))?;
            }

            let run_id = structured_log::default_run_id();
            let emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &config.service, &run_id)?,
                None => LogEmitter::to_stderr(&config.service, &run_id),
            };
            let log = SharedLog::new(emitter.with_min_level(config.log_level));

            let server = Server::bind(&config, Arc::new(ChunkRegistry::new()), log)?;
            eprintln!("uafsim listening on {}", server.local_addr());
            server.serve()?;
            eprintln!("uafsim stopped");
        }
        Command::Send {
            target,
            hex,
            frames,
        } => {
            let mut client = Client::connect(resolve(&target.config())?)?;
            for frame in frames {
                let bytes = if hex {
                    hex::decode(frame.trim())?
                } else {
                    frame.into_bytes()
                };
                let reply = client.request(&bytes)?;
                println!("{}", escape_bytes(&reply));
            }
        }
        Command::Alloc {
            target,
            size,
            hex,
            data,
        } => {
            let data = if hex {
                hex::decode(data.trim())?
            } else {
                data.into_bytes()
            };
            let request = Request::Alloc(AllocRequest { size, data });
            let mut client = Client::connect(resolve(&target.config())?)?;
            println!("{}", escape_bytes(&client.send(&request)?));
        }
        Command::Scenarios { name } => match name {
            Some(name) => println!("{}", scenario::builtin(&name)?.to_json()?),
            None => {
                for name in scenario::BUILTIN_NAMES {
                    println!("{name}");
                }
            }
        },
        Command::Rehearse {
            target,
            scenario: files,
            builtin,
            run_tag,
            output,
        } => {
            let mut sets = Vec::new();
            for path in &files {
                sets.push(ScenarioSet::from_file(path)?);
            }
            let names: Vec<String> = if files.is_empty() && builtin.is_empty() {
                scenario::BUILTIN_NAMES.iter().map(|s| (*s).to_string()).collect()
            } else {
                builtin
            };
            for name in &names {
                sets.push(scenario::builtin(name)?);
            }

            let runner = ScenarioRunner::new(
                resolve(&target.config())?,
                run_tag.unwrap_or_else(scenario::fresh_run_tag),
            );
            let report = runner.run_all(&sets)?;
            let json = serde_json::to_string_pretty(&report)?;
            if let Some(path) = output {
                std::fs::write(&path, &json)?;
                eprintln!("Wrote rehearsal report to {}", path.display());
            } else {
                println!("{json}");
            }
            eprintln!(
                "Rehearsal: {}/{} scenarios passed",
                report.passed, report.total
            );
            if !report.all_passed() {
                return Err(format!("{} scenario(s) failed", report.failed).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = structured_log::validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation error(s) in {} line(s) of {}",
                    errors.len(),
                    lines,
                    log.display()
                )
                .into());
            }
            println!("{}: {lines} valid line(s)", log.display());
        }
    }

    Ok(())
}
