//! switchyard-ctl — inspect a running Switchyard deployment.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use switchyard_core::config::SwitchyardConfig;
use switchyard_core::wire::ServiceRecord;
use switchyard_services::{Discovery, ServiceType};

const DEFAULT_WAIT_MS: u64 = 2_000;

// ── Output types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RecordView {
    service: String,
    endpoint: String,
    routing_id: String,
    weight: u32,
    registered_at: u64,
    origin: u32,
}

impl From<&ServiceRecord> for RecordView {
    fn from(r: &ServiceRecord) -> Self {
        Self {
            service: r.service.clone(),
            endpoint: r.endpoint.clone(),
            routing_id: hex::encode(&r.routing_id),
            weight: r.weight,
            registered_at: r.registered_at,
            origin: r.origin,
        }
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

struct ServicesArgs<'a> {
    broadcast: &'a str,
    service: &'a str,
    service_type: ServiceType,
    json: bool,
    wait: Duration,
}

/// Follow the registry feed until the service shows up or the wait runs
/// out, then print what is known.
async fn cmd_services(args: ServicesArgs<'_>) -> Result<()> {
    let discovery = Discovery::new(args.service_type);
    discovery
        .connect_registry(args.broadcast)
        .with_context(|| format!("cannot follow {}", args.broadcast))?;
    discovery.subscribe(args.service)?;

    let mut updates = discovery.updates();
    let _ = tokio::time::timeout(args.wait, async {
        while !discovery.service_available(args.service) {
            if updates.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    let records = discovery.get_receivers(args.service);
    discovery.close();

    if args.json {
        let views: Vec<RecordView> = records.iter().map(RecordView::from).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No live records for {:?}.", args.service);
        return Ok(());
    }
    println!("═══════════════════════════════════════");
    println!("  {} ({:?}, {} records)", args.service, args.service_type, records.len());
    println!("═══════════════════════════════════════");
    for r in &records {
        println!("  ┌─ {}", r.endpoint);
        println!("  │  routing id : {}", hex::encode(&r.routing_id));
        println!("  │  weight     : {}", r.weight);
        println!("  │  registered : {}", r.registered_at);
        println!("  └─ origin     : {}", r.origin);
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let config = SwitchyardConfig::load().context("failed to load config")?;
    println!("# {}", SwitchyardConfig::file_path().display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn print_usage() {
    println!("switchyard-ctl — inspect a Switchyard deployment");
    println!();
    println!("USAGE:");
    println!("  switchyard-ctl services <broadcast-endpoint> <service> [--spot] [--json] [--wait <ms>]");
    println!("  switchyard-ctl config");
    println!("  switchyard-ctl help");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut service_type = ServiceType::Gateway;
    let mut json = false;
    let mut wait = Duration::from_millis(DEFAULT_WAIT_MS);
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--spot" => service_type = ServiceType::Spot,
            "--json" => json = true,
            "--wait" => {
                i += 1;
                let ms: u64 = args
                    .get(i)
                    .context("--wait requires a value")?
                    .parse()
                    .context("--wait must be a number of milliseconds")?;
                wait = Duration::from_millis(ms);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["services", broadcast, service] => {
            cmd_services(ServicesArgs {
                broadcast,
                service,
                service_type,
                json,
                wait,
            })
            .await
        }
        ["services", ..] => bail!("usage: services <broadcast-endpoint> <service>"),
        ["config"] => cmd_config(),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
