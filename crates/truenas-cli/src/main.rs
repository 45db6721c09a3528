//! # truenas
//!
//! Command-line access to one appliance: raw method calls, topic
//! following and cached entity listings. Flags override the layered
//! settings from `~/.truenas/client.json` and `TRUENAS_*`.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing::info;
use truenas_client::Machine;
use truenas_core::FieldValue;
use truenas_ddp::{PushEvent, PushKind};
use truenas_settings::{ClientSettings, CredentialSettings, load_settings, load_settings_from_path};

/// TrueNAS websocket client.
#[derive(Parser, Debug)]
#[command(name = "truenas", about = "TrueNAS websocket client", version)]
struct Cli {
    /// Settings file (defaults to `~/.truenas/client.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Appliance host, optionally with `:port`.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Account name for password login.
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Account password for password login.
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// API key login.
    #[arg(short = 'a', long, global = true)]
    api_key: Option<String>,

    /// Bearer token login.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Connect with `ws://` instead of `wss://`.
    #[arg(short, long, global = true)]
    insecure: bool,

    /// More logging (`-v` info, `-vv` debug, `-vvv` trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a method and print its result as JSON.
    Invoke {
        /// Method name, e.g. `system.info`.
        method: String,
        /// Positional arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        arguments: String,
    },
    /// Print every push for a topic until Ctrl-C.
    Subscribe {
        /// Topic name, e.g. `core.get_jobs`.
        topic: String,
    },
    /// Refresh one kind of entity and print one line per entity.
    List {
        /// Entity kind.
        kind: EntityArg,
        /// Include disk temperatures.
        #[arg(long)]
        temperature: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EntityArg {
    Disks,
    Pools,
    Datasets,
    Jails,
    Vms,
}

impl Cli {
    /// Load settings from `--config` (or the default path) and apply flags.
    fn settings(&self) -> Result<ClientSettings> {
        let mut settings = match &self.config {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => load_settings().context("failed to load settings")?,
        };
        self.apply(&mut settings);
        Ok(settings)
    }

    fn apply(&self, settings: &mut ClientSettings) {
        if let Some(host) = &self.host {
            settings.host.clone_from(host);
        }
        if self.insecure {
            settings.secure = false;
        }
        // Any credential flag replaces the configured credentials entirely.
        if self.username.is_some()
            || self.password.is_some()
            || self.api_key.is_some()
            || self.token.is_some()
        {
            settings.credentials = CredentialSettings {
                username: self.username.clone(),
                password: self.password.clone(),
                api_key: self.api_key.clone(),
                token: self.token.clone(),
            };
        }
        let level = match self.verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        settings.log_level = level.to_string();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;
    truenas_core::logging::init_subscriber(&settings.log_level);

    let machine = Machine::create(&settings)
        .await
        .with_context(|| format!("failed to connect to {}", settings.url()))?;
    let outcome = run(&machine, cli.command).await;
    machine.close().await;
    outcome
}

async fn run(machine: &Machine, command: Command) -> Result<()> {
    match command {
        Command::Invoke { method, arguments } => {
            let params = parse_arguments(&arguments)?;
            let result = machine
                .invoke(&method, params)
                .await
                .with_context(|| format!("{method} failed"))?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
        }
        Command::Subscribe { topic } => follow(machine, &topic).await?,
        Command::List { kind, temperature } => {
            for line in list(machine, kind, temperature).await? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn parse_arguments(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(raw).context("--arguments is not valid JSON")? {
        Value::Array(params) => Ok(params),
        other => bail!("--arguments must be a JSON array, got {other}"),
    }
}

async fn follow(machine: &Machine, topic: &str) -> Result<()> {
    let mut queue = machine
        .subscribe(topic)
        .await
        .with_context(|| format!("failed to subscribe to {topic}"))?;
    info!(topic, "following");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = queue.recv() => match event {
                Some(event) => println!("{}", format_event(&event)),
                None => {
                    info!(topic, "subscription ended");
                    return Ok(());
                }
            },
        }
    }

    if machine.state().is_open() {
        machine
            .unsubscribe(topic)
            .await
            .with_context(|| format!("failed to unsubscribe from {topic}"))?;
    }
    Ok(())
}

fn format_event(event: &PushEvent) -> String {
    let kind = match event.kind {
        PushKind::Added => "added",
        PushKind::Changed => "changed",
    };
    json!({
        "msg": kind,
        "collection": event.collection,
        "id": event.id.to_json(),
        "fields": FieldValue::Map(event.fields.clone()).to_json(),
    })
    .to_string()
}

async fn list(machine: &Machine, kind: EntityArg, temperature: bool) -> Result<Vec<String>> {
    let lines = match kind {
        EntityArg::Disks => machine
            .get_disks(temperature)
            .await?
            .iter()
            .map(|d| {
                let temp = d
                    .temperature()
                    .ok()
                    .flatten()
                    .map_or_else(|| "-".to_string(), |t| format!("{t:.0}C"));
                format!(
                    "{}\t{}\t{}\t{}\t{}\t{temp}",
                    d.name(),
                    d.serial(),
                    d.disk_type(),
                    d.model(),
                    d.size()
                )
            })
            .collect(),
        EntityArg::Pools => machine
            .get_pools()
            .await?
            .iter()
            .map(|p| format!("{}\t{}\t{}", p.name(), p.guid(), p.status()))
            .collect(),
        EntityArg::Datasets => machine
            .get_datasets()
            .await?
            .iter()
            .map(|d| {
                format!(
                    "{}\t{}\t{}\t{}\t{:.2}x",
                    d.id(),
                    d.dataset_type(),
                    d.used_bytes(),
                    d.total_bytes(),
                    d.compression_ratio()
                )
            })
            .collect(),
        EntityArg::Jails => machine
            .get_jails()
            .await?
            .iter()
            .map(|j| {
                let status = j.status().map_or_else(|_| "-".to_string(), |s| s.to_string());
                format!("{}\t{status}", j.name())
            })
            .collect(),
        EntityArg::Vms => machine
            .get_vms()
            .await?
            .iter()
            .map(|v| {
                let status = v.status().map_or_else(|_| "-".to_string(), |s| s.to_string());
                format!("{}\t{}\t{status}", v.id(), v.name())
            })
            .collect(),
    };
    Ok(lines)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
