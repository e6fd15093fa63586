//! Entry point for machinectl. Parses args, sends one request and prints the replies.

mod output;

use anyhow::{bail, Context, Result};
use machined::client::{send_and_recv, send_only};
use machined::wire::{
    param, user_param, Body, MachineMessage, ProcessMessage, UserMessage, PORT_MACHINED,
};
use output::{render_text, view, View};
use std::env;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing_subscriber::EnvFilter;

const USAGE_COMMANDS: &str = "Commands:
  machines              stats for every machine (broadcast)
  procs [NAME]          registered processes with cpu and memory
  tags [TAG]            tag sections, or the lines of one section
  user [UID|NAME]       user environments, with core dumps for one user
  pid PID               whether PID is running
  signal SIGNUM [NAME]  signal matching processes
  reset                 reload the daemon's configuration
  interface             the daemon's internal interface";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Machines,
    Procs(Option<String>),
    Tags(String),
    User(Option<String>),
    Pid(u32),
    Signal(u8, Option<String>),
    Reset,
    Interface,
}

struct ParsedArgs {
    host: Option<Ipv4Addr>,
    port: u16,
    json: bool,
    command: Command,
}

fn usage(prog: &str) -> String {
    format!("Usage: {prog} [--host ADDR|-H ADDR] [--port PORT|-p PORT] [--json] <command>\n{USAGE_COMMANDS}")
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "machinectl".into());
    let mut host = None;
    let mut port = PORT_MACHINED;
    let mut json = false;
    let mut rest: Vec<String> = Vec::new();

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "--json" => json = true,
            "--host" | "-H" => host = it.next(),
            "--port" | "-p" => {
                let v = it.next().unwrap_or_default();
                port = v.parse().map_err(|_| format!("invalid port '{v}'"))?;
            }
            _ if arg.starts_with("--host=") => host = arg.split_once('=').map(|(_, v)| v.to_string()),
            _ if arg.starts_with("--port=") => {
                let v = arg.split_once('=').map(|(_, v)| v).unwrap_or("");
                port = v.parse().map_err(|_| format!("invalid port '{v}'"))?;
            }
            _ => rest.push(arg),
        }
    }
    let host = match host {
        Some(h) => Some(h.parse().map_err(|_| format!("invalid address '{h}'"))?),
        None => None,
    };

    let mut words = rest.into_iter();
    let Some(cmd) = words.next() else {
        return Err(usage(&prog));
    };
    let arg = words.next();
    let command = match cmd.as_str() {
        "machines" => Command::Machines,
        "procs" => Command::Procs(arg),
        "tags" => Command::Tags(arg.unwrap_or_default()),
        "user" => Command::User(arg),
        "pid" => {
            let pid = arg.and_then(|p| p.parse().ok()).ok_or("pid needs a numeric PID")?;
            Command::Pid(pid)
        }
        "signal" => {
            let sig = arg
                .and_then(|s| s.parse().ok())
                .ok_or("signal needs a numeric SIGNUM")?;
            Command::Signal(sig, words.next())
        }
        "reset" => Command::Reset,
        "interface" => Command::Interface,
        other => return Err(format!("unknown command '{other}'\n{}", usage(&prog))),
    };
    Ok(ParsedArgs {
        host,
        port,
        json,
        command,
    })
}

/// Process query for `name`, or for everything.
fn process_query(name: Option<String>) -> ProcessMessage {
    match name {
        Some(name) => ProcessMessage {
            param: param::USE_NAME,
            name,
            ..Default::default()
        },
        None => ProcessMessage::default(),
    }
}

fn request(command: Command) -> Body {
    match command {
        Command::Machines => Body::HighPrecisionMachine {
            machine: MachineMessage::<u32>::default(),
            io_wait: 0,
        },
        Command::Procs(name) => Body::ProcessStats {
            process: process_query(name),
            cpu: 0,
            mem: 0,
        },
        Command::Tags(tag) => Body::Tags {
            tags: vec![tag],
            exists: false,
        },
        Command::User(who) => {
            let mut u = UserMessage::default();
            match who {
                Some(w) => match w.parse::<u16>() {
                    Ok(uid) => {
                        u.param = user_param::USE_UID | user_param::CHECK_COREDUMPS;
                        u.uid = uid;
                    }
                    Err(_) => {
                        u.param = user_param::USE_NAME | user_param::CHECK_COREDUMPS;
                        u.username = w;
                    }
                },
                None => u.param = 0,
            }
            Body::User(u)
        }
        Command::Pid(pid) => Body::Pid {
            pid,
            running: false,
        },
        Command::Signal(signal, name) => Body::Signal {
            process: process_query(name),
            signal,
        },
        Command::Reset => Body::Reset,
        Command::Interface => Body::QueryInterface {
            address: Ipv4Addr::UNSPECIFIED,
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            if msg.starts_with("Usage:") {
                return Ok(());
            }
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // cluster-wide queries default to broadcast, the rest to this machine
    let default_host = match parsed.command {
        Command::Machines | Command::Procs(_) => Ipv4Addr::BROADCAST,
        _ => Ipv4Addr::LOCALHOST,
    };
    let target = SocketAddrV4::new(parsed.host.unwrap_or(default_host), parsed.port);

    if let Command::Signal(..) = parsed.command {
        send_only(target, request(parsed.command))
            .await
            .context("sending signal request")?;
        return Ok(());
    }

    let replies = send_and_recv(target, request(parsed.command))
        .await
        .with_context(|| format!("querying {target}"))?;
    let views: Vec<View> = replies.iter().filter_map(|(from, m)| view(*from, m)).collect();
    if views.is_empty() {
        if parsed.json {
            println!("[]");
            return Ok(());
        }
        bail!("no matching replies");
    }
    if parsed.json {
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else {
        for v in &views {
            println!("{}", render_text(v));
        }
    }
    Ok(())
}
