//! gridroutectl - thin CLI over the gridroute ingress API.
//!
//! Exit codes: 0 ok, 1 operational failure, 2 invalid input, 3 policy reject.

use clap::{Parser, Subcommand};
use gridroute_backend::config::Config;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gridroutectl", about = "Control-plane client for gridroute")]
struct Cli {
    /// Base URL of the gridroute node.
    #[arg(long, env = "GRIDROUTE_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Request a routing decision. Reads the request JSON from a file or stdin.
    Decide {
        /// Path to the request JSON; `-` for stdin.
        #[arg(default_value = "-")]
        request: String,
    },
    /// Report an outcome for a decision.
    Feedback {
        decision_id: String,
        /// Path to the outcome JSON; `-` for stdin.
        #[arg(default_value = "-")]
        outcome: String,
    },
    /// Show aggregated component stats.
    Status,
    /// Validate a configuration profile and print the effective settings.
    Configure {
        /// Profile file (TOML with [profile.<name>] sections).
        file: PathBuf,
        /// Profile name.
        #[arg(default_value = "default")]
        profile: String,
    },
    /// Trigger one federation sync pass against a peer URL.
    Sync { peer_url: String },
    /// Deterministically merge two event-log JSON files and emit a receipt.
    Merge {
        left: PathBuf,
        right: PathBuf,
        /// Directory for the merge receipt.
        #[arg(long, default_value = "data/receipts")]
        receipts_dir: PathBuf,
    },
    /// Resolve competing anchors for a record; prints the winner.
    ResolveAnchors {
        /// JSON array of anchors; `-` for stdin.
        #[arg(default_value = "-")]
        anchors: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn read_json_arg(arg: &str) -> anyhow::Result<Value> {
    let raw = if arg == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(arg)?
    };
    Ok(serde_json::from_str(&raw)?)
}

fn classify(status: reqwest::StatusCode, body: &Value) -> ExitCode {
    if status.is_success() {
        return ExitCode::SUCCESS;
    }
    match body.get("reason").and_then(Value::as_str) {
        Some("policy_reject") => ExitCode::from(3),
        Some("invalid_input") => ExitCode::from(2),
        _ if status == reqwest::StatusCode::BAD_REQUEST => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(cli.timeout_secs))
        .build()?;
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Command::Decide { request } => {
            let body = read_json_arg(&request)?;
            let resp = client
                .post(format!("{}/decisions", base))
                .json(&body)
                .send()?;
            let status = resp.status();
            let json: Value = resp.json()?;
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(classify(status, &json))
        }
        Command::Feedback {
            decision_id,
            outcome,
        } => {
            let outcome = read_json_arg(&outcome)?;
            let body = serde_json::json!({
                "decision_id": decision_id,
                "outcome": outcome,
            });
            let resp = client
                .post(format!("{}/feedback", base))
                .json(&body)
                .send()?;
            let status = resp.status();
            let json: Value = resp.json()?;
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(classify(status, &json))
        }
        Command::Status => {
            let resp = client.get(format!("{}/status", base)).send()?;
            let status = resp.status();
            let json: Value = resp.json()?;
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(classify(status, &json))
        }
        Command::Configure { file, profile } => {
            let mut config = Config::default();
            if let Err(e) = config.apply_profile(&file, &profile) {
                eprintln!("invalid profile: {:#}", e);
                return Ok(ExitCode::from(2));
            }
            println!("profile '{}' in {} is valid", profile, file.display());
            println!("  port               = {}", config.port);
            println!("  node_id            = {}", config.node_id);
            println!("  store_path         = {}", config.store_path.display());
            println!("  strict_audit       = {}", config.strict_audit);
            println!("  require_signatures = {}", config.require_signatures);
            println!(
                "  hyperparameters    = alpha {} gamma {} epsilon {}",
                config.alpha, config.gamma, config.epsilon
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Sync { peer_url } => {
            // Ask the peer for its projection as a quick liveness + progress
            // signal, then list what it holds.
            let resp = client
                .get(format!(
                    "{}/federation/memory_ids?limit=10000",
                    peer_url.trim_end_matches('/')
                ))
                .send()?;
            if !resp.status().is_success() {
                eprintln!("peer unreachable: {}", resp.status());
                return Ok(ExitCode::from(1));
            }
            let json: Value = resp.json()?;
            let count = json
                .get("ids")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            println!("peer holds {} records", count);
            println!("note: the server node syncs on its own cadence; this command verifies reachability");
            Ok(ExitCode::SUCCESS)
        }
        Command::Merge {
            left,
            right,
            receipts_dir,
        } => {
            use gridroute_backend::federation::{deterministic_merge, MemoryRecord};
            let parse = |path: &PathBuf| -> anyhow::Result<Vec<MemoryRecord>> {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            };
            let left_records = match parse(&left) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("invalid left log: {:#}", e);
                    return Ok(ExitCode::from(2));
                }
            };
            let right_records = match parse(&right) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("invalid right log: {:#}", e);
                    return Ok(ExitCode::from(2));
                }
            };
            let (merged, receipt) = deterministic_merge(&left_records, &right_records);
            let path = receipt.persist(&receipts_dir)?;
            println!("{}", receipt.merged_root);
            eprintln!(
                "merged {} events, receipt at {}",
                merged.len(),
                path.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::ResolveAnchors { anchors } => {
            use gridroute_backend::federation::{resolve_conflict, Anchor};
            let parsed: Vec<Anchor> = match read_json_arg(&anchors)
                .and_then(|v| Ok(serde_json::from_value(v)?))
            {
                Ok(a) => a,
                Err(e) => {
                    eprintln!("invalid anchors: {:#}", e);
                    return Ok(ExitCode::from(2));
                }
            };
            match resolve_conflict(parsed) {
                Some((winner, losers)) => {
                    println!("{}", serde_json::to_string_pretty(&winner)?);
                    eprintln!("{} anchors superseded", losers.len());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no anchors supplied");
                    Ok(ExitCode::from(2))
                }
            }
        }
    }
}
