//! lifeline-admin CLI tool
//!
//! Drives a running lifeline-node over its admin socket.
//!
//! Usage:
//!   lifeline-admin check-in [note]
//!   lifeline-admin set-status <green|yellow|orange|red> [note]
//!   lifeline-admin state

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use lifeline_heartbeat::Answer;
use lifeline_mesh::Status;
use lifeline_node::{AdminCommand, AdminResponse};

fn print_usage() {
    eprintln!("lifeline-admin - Control a running Lifeline node");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  lifeline-admin check-in [note]                 Affirm current status");
    eprintln!("  lifeline-admin set-status <status> [note]      green, yellow, orange or red");
    eprintln!("  lifeline-admin set-interval <id>               15min, 30min, 1hr, 2hr, 4hr, off");
    eprintln!("  lifeline-admin reset                           Reset the dead man's switch");
    eprintln!("  lifeline-admin add-peer <id> [host:port]       Track and dial a peer");
    eprintln!("  lifeline-admin add-code <code>                 Dial a peer by connection code");
    eprintln!("  lifeline-admin remove-peer <id>                Forget a peer");
    eprintln!("  lifeline-admin register-group <a> <b> <c> <d>  Register a trust cell");
    eprintln!("  lifeline-admin group-active <id> <true|false>  Toggle a trust cell");
    eprintln!("  lifeline-admin groups                          List trust cells");
    eprintln!("  lifeline-admin topology                        Report overlapping cells");
    eprintln!("  lifeline-admin sample <x> <y> <z>              Feed a motion sample");
    eprintln!("  lifeline-admin coherence                       Current coherence score");
    eprintln!("  lifeline-admin daily <question=value>...       Submit a daily check-in");
    eprintln!("  lifeline-admin daily-summary                   Average and trend");
    eprintln!("  lifeline-admin escalation <on|off> [url]       Configure the webhook");
    eprintln!("  lifeline-admin export-log                      Personal log as JSON");
    eprintln!("  lifeline-admin export-daily                    Daily history as JSON");
    eprintln!("  lifeline-admin code                            Our connection code");
    eprintln!("  lifeline-admin state                           Full state view");
    eprintln!("  lifeline-admin ping                            Check if daemon is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LIFELINE_SOCKET  Path to admin socket (default: ./lifeline-data/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("LIFELINE_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./lifeline-data/admin.sock"))
}

fn send_command(cmd: &AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to lifeline-node at {:?}: {}\n\
             Is the lifeline-node running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn arg(args: &[String], index: usize, command: &str, what: &str) -> String {
    match args.get(index) {
        Some(value) => value.clone(),
        None => fail(format!("{} requires a {} argument", command, what)),
    }
}

fn number(value: &str) -> f64 {
    value
        .parse()
        .unwrap_or_else(|_| fail(format!("{:?} is not a number", value)))
}

/// Everything after `from`, joined, or nothing.
fn rest(args: &[String], from: usize) -> Option<String> {
    let rest = args.get(from..).unwrap_or_default().join(" ");
    (!rest.is_empty()).then_some(rest)
}

fn parse_command(args: &[String]) -> AdminCommand {
    let name = args[1].as_str();
    match name {
        "check-in" => AdminCommand::CheckIn { note: rest(args, 2) },
        "set-status" => {
            let status: Status = arg(args, 2, name, "status")
                .parse()
                .unwrap_or_else(|e| fail(e));
            AdminCommand::SetStatus {
                status,
                note: rest(args, 3),
            }
        }
        "set-interval" => AdminCommand::SetInterval {
            interval: arg(args, 2, name, "interval"),
        },
        "reset" => AdminCommand::ResetDeadMan,
        "add-peer" => AdminCommand::AddPeer {
            peer_id: Some(arg(args, 2, name, "peer id")),
            name: None,
            addr: args.get(3).cloned(),
            code: None,
        },
        "add-code" => AdminCommand::AddPeer {
            peer_id: None,
            name: None,
            addr: None,
            code: Some(arg(args, 2, name, "code")),
        },
        "remove-peer" => AdminCommand::RemovePeer {
            peer_id: arg(args, 2, name, "peer id"),
        },
        "register-group" => AdminCommand::RegisterGroup {
            members: args[2..].to_vec(),
        },
        "group-active" => AdminCommand::SetGroupActive {
            group_id: arg(args, 2, name, "cell id"),
            active: match arg(args, 3, name, "true|false").as_str() {
                "true" | "on" => true,
                "false" | "off" => false,
                other => fail(format!("expected true or false, got {:?}", other)),
            },
        },
        "groups" => AdminCommand::ListGroups,
        "topology" => AdminCommand::ValidateTopology,
        "sample" => AdminCommand::AddSample {
            x: number(&arg(args, 2, name, "x")),
            y: number(&arg(args, 3, name, "y")),
            z: number(&arg(args, 4, name, "z")),
        },
        "coherence" => AdminCommand::Coherence,
        "daily" => {
            let answers = args[2..]
                .iter()
                .map(|pair| match pair.split_once('=') {
                    Some((question, value)) => Answer::new(question, number(value)),
                    None => fail(format!("expected question=value, got {:?}", pair)),
                })
                .collect();
            AdminCommand::DailyCheckIn { answers }
        }
        "daily-summary" => AdminCommand::DailySummary,
        "escalation" => AdminCommand::SetEscalation {
            enabled: match arg(args, 2, name, "on|off").as_str() {
                "on" => true,
                "off" => false,
                other => fail(format!("expected on or off, got {:?}", other)),
            },
            webhook_url: args.get(3).cloned(),
            include_location: false,
        },
        "export-log" => AdminCommand::ExportLog,
        "export-daily" => AdminCommand::ExportDaily,
        "code" => AdminCommand::ConnectionCode,
        "state" => AdminCommand::State,
        "ping" => AdminCommand::Ping,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = parse_command(&args);

    match send_command(&cmd) {
        Ok(response) => match response {
            AdminResponse::Ok { message } => {
                println!("{}", message);
            }
            AdminResponse::Error { error } => fail(error),
            AdminResponse::Data { data } => match serde_json::to_string_pretty(&data) {
                Ok(pretty) => println!("{}", pretty),
                Err(_) => println!("{}", data),
            },
            AdminResponse::Pong => {
                println!("pong - lifeline-node is running");
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
