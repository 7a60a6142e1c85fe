//! `FleetLock` CLI — operator command-line client for the locker kiosk
//! fleet control plane.
//!
//! A standalone HTTP client that talks exclusively to `fleetlock-server`'s
//! REST API (no dependency on the internal crates) — the same shape as the
//! teacher's thin-HTTP-client CLI.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn header(icon: &str, title: &str) {
    println!("{BOLD}{icon} {title}{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key}:{RESET} {value}");
}

fn success(msg: &str) {
    println!("  {GREEN}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("  {YELLOW}!{RESET} {msg}");
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

#[derive(Parser)]
#[command(
    name = "fleetlock",
    version,
    about = "FleetLock CLI — operator tool for inspecting and controlling a locker kiosk fleet over HTTP"
)]
struct Cli {
    /// Base URL of the `fleetlock-server` instance to talk to.
    #[arg(long, env = "FLEETLOCK_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Identity asserted for staff-only operations (sent as `X-Staff-User`).
    #[arg(long, env = "FLEETLOCK_STAFF_USER")]
    staff_user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server is reachable.
    Status,
    /// Run a handful of read-only connectivity and configuration checks.
    Doctor,
    /// Inspect and control individual lockers.
    #[command(subcommand)]
    Locker(LockerCommands),
    /// Inspect and control a kiosk's command queue.
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Inspect kiosk liveness.
    #[command(subcommand)]
    Heartbeat(HeartbeatCommands),
    /// Inspect and extend zone/relay-card hardware mapping.
    #[command(subcommand)]
    Zones(ZoneCommands),
    /// Query the audit event log.
    Events {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        locker: Option<i32>,
        #[arg(long = "type")]
        event_type: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Probe or reset a rate-limit bucket.
    #[command(subcommand)]
    RateLimit(RateLimitCommands),
}

#[derive(Subcommand)]
enum LockerCommands {
    /// List every locker provisioned for a kiosk.
    List {
        #[arg(long)]
        kiosk: String,
    },
    /// Show a single locker's current state.
    Get {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
    },
    /// Release a locker back to Free (staff override).
    Release {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
        #[arg(long, default_value = "staff_override")]
        method: String,
    },
    /// Block a locker from further assignment.
    Block {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
    },
    /// Unblock a locker back to Free.
    Unblock {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
    },
    /// Force a locker to an arbitrary target state, bypassing preconditions.
    ForceTransition {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
        /// One of: free, reserved, owned, blocked, error.
        #[arg(long)]
        target: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List pending commands for a kiosk (the same view a kiosk poller sees).
    List {
        #[arg(long)]
        kiosk: String,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Enqueue a remote-open command for a single locker.
    OpenLocker {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
    },
    /// Enqueue a remote-open command for several lockers at once.
    BulkOpen {
        #[arg(long)]
        kiosk: String,
        #[arg(long, value_delimiter = ',')]
        locker_ids: Vec<i32>,
    },
    /// Enqueue a block command.
    Block {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
        #[arg(long)]
        reason: String,
    },
    /// Enqueue an unblock command.
    Unblock {
        #[arg(long)]
        kiosk: String,
        locker_id: i32,
    },
    /// Enqueue a clear-queue command.
    ClearQueue {
        #[arg(long)]
        kiosk: String,
    },
    /// Cancel a single pending/executing command.
    Cancel {
        #[arg(long)]
        kiosk: String,
        command_id: String,
    },
    /// Cancel every pending/executing command for a kiosk — used after
    /// detecting a kiosk restart to drop orphaned commands.
    Clear {
        #[arg(long)]
        kiosk: String,
    },
}

#[derive(Subcommand)]
enum HeartbeatCommands {
    /// Show a single kiosk's last-known heartbeat.
    Get { kiosk_id: String },
    /// List kiosks by liveness status (online, offline, maintenance, error).
    List {
        #[arg(long, default_value = "online")]
        status: String,
    },
}

#[derive(Subcommand)]
enum ZoneCommands {
    /// Show the current zone / relay-card configuration.
    Show,
    /// Resolve a locker id to its relay slave address and coil.
    Map { locker_id: i32 },
    /// Report a newly wired relay card and reconcile zone ranges against it.
    Extend {
        #[arg(long)]
        slave_address: u32,
    },
}

#[derive(Subcommand)]
enum RateLimitCommands {
    /// Check whether a dimension/key pair currently has tokens available.
    Check {
        /// One of: rfid_card, locker, ip_address, qr_device.
        #[arg(long)]
        dimension: String,
        #[arg(long)]
        key: String,
    },
    /// Clear a bucket and its violation history (staff-only, audited).
    Reset {
        #[arg(long)]
        dimension: String,
        #[arg(long)]
        key: String,
    },
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    addr: String,
    staff_user: Option<String>,
}

impl Client {
    fn new(addr: String, staff_user: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), addr, staff_user }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    fn staff_header(&self) -> Result<&str> {
        self.staff_user
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("staff identity required — set FLEETLOCK_STAFF_USER or use --staff-user"))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn get_staff(&self, path: &str) -> Result<Value> {
        let staff_user = self.staff_header()?;
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Staff-User", staff_user)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.http.post(self.url(path)).json(body).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn post_staff(&self, path: &str, body: &Value) -> Result<Value> {
        let staff_user = self.staff_header()?;
        let resp = self
            .http
            .post(self.url(path))
            .header("X-Staff-User", staff_user)
            .json(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    async fn post_staff_no_body(&self, path: &str) -> Result<Value> {
        let staff_user = self.staff_header()?;
        let resp = self
            .http
            .post(self.url(path))
            .header("X-Staff-User", staff_user)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client::new(cli.addr, cli.staff_user);

    match run(&client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(client: &Client, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Status => cmd_status(client).await,
        Commands::Doctor => cmd_doctor(client).await,
        Commands::Locker(sub) => cmd_locker(client, sub).await,
        Commands::Queue(sub) => cmd_queue(client, sub).await,
        Commands::Heartbeat(sub) => cmd_heartbeat(client, sub).await,
        Commands::Zones(sub) => cmd_zones(client, sub).await,
        Commands::Events { kiosk, locker, event_type, since, until, limit } => {
            cmd_events(client, kiosk, locker, event_type, since, until, limit).await
        }
        Commands::RateLimit(sub) => cmd_rate_limit(client, sub).await,
    }
}

async fn cmd_status(client: &Client) -> Result<()> {
    header("📡", "FleetLock server status");
    match client.get("/v1/zones").await {
        Ok(_) => {
            success(&format!("reachable at {}", client.addr));
            Ok(())
        }
        Err(e) => bail!("server unreachable at {}: {e:#}", client.addr),
    }
}

async fn cmd_doctor(client: &Client) -> Result<()> {
    header("🩺", "FleetLock doctor");
    let mut warnings = 0u32;

    match client.get("/v1/zones").await {
        Ok(_) => success(&format!("server reachable at {}", client.addr)),
        Err(e) => {
            warning(&format!("server unreachable: {e:#}"));
            warnings += 1;
        }
    }

    if client.staff_user.is_some() {
        success("staff identity configured");
    } else {
        warning("no staff identity set (FLEETLOCK_STAFF_USER) — staff-only commands will fail");
        warnings += 1;
    }

    println!();
    if warnings == 0 {
        success("all checks passed");
    } else {
        warning(&format!("{warnings} warning(s)"));
    }
    Ok(())
}

async fn cmd_locker(client: &Client, cmd: LockerCommands) -> Result<()> {
    match cmd {
        LockerCommands::List { kiosk } => {
            let resp = client.get(&format!("/v1/kiosks/{kiosk}/lockers")).await?;
            header("🔒", &format!("lockers at {kiosk}"));
            print_json(&resp);
            Ok(())
        }
        LockerCommands::Get { kiosk, locker_id } => {
            let resp = client.get(&format!("/v1/kiosks/{kiosk}/lockers/{locker_id}")).await?;
            print_json(&resp);
            Ok(())
        }
        LockerCommands::Release { kiosk, locker_id, method } => {
            let resp = client
                .post_staff(
                    &format!("/v1/kiosks/{kiosk}/lockers/{locker_id}/force-transition"),
                    &json!({ "target": "free", "reason": format!("cli release ({method})") }),
                )
                .await?;
            success(&format!("released {kiosk}/{locker_id}"));
            print_json(&resp);
            Ok(())
        }
        LockerCommands::Block { kiosk, locker_id } => {
            let resp =
                client.post_staff(&format!("/v1/kiosks/{kiosk}/lockers/{locker_id}/block"), &Value::Null).await?;
            success(&format!("blocked {kiosk}/{locker_id}"));
            print_json(&resp);
            Ok(())
        }
        LockerCommands::Unblock { kiosk, locker_id } => {
            let resp = client
                .post_staff(&format!("/v1/kiosks/{kiosk}/lockers/{locker_id}/unblock"), &Value::Null)
                .await?;
            success(&format!("unblocked {kiosk}/{locker_id}"));
            print_json(&resp);
            Ok(())
        }
        LockerCommands::ForceTransition { kiosk, locker_id, target, reason } => {
            let resp = client
                .post_staff(
                    &format!("/v1/kiosks/{kiosk}/lockers/{locker_id}/force-transition"),
                    &json!({ "target": target, "reason": reason }),
                )
                .await?;
            success(&format!("forced {kiosk}/{locker_id} to {target}"));
            print_json(&resp);
            Ok(())
        }
    }
}

async fn cmd_queue(client: &Client, cmd: QueueCommands) -> Result<()> {
    match cmd {
        QueueCommands::List { kiosk, limit } => {
            let resp = client.get(&format!("/v1/kiosks/{kiosk}/commands/poll?limit={limit}")).await?;
            header("📋", &format!("pending commands for {kiosk}"));
            print_json(&resp);
            Ok(())
        }
        QueueCommands::OpenLocker { kiosk, locker_id } => {
            enqueue(client, &kiosk, json!({ "command_type": "open_locker", "locker_id": locker_id })).await
        }
        QueueCommands::BulkOpen { kiosk, locker_ids } => {
            enqueue(client, &kiosk, json!({ "command_type": "bulk_open", "locker_ids": locker_ids })).await
        }
        QueueCommands::Block { kiosk, locker_id, reason } => {
            enqueue(client, &kiosk, json!({ "command_type": "block", "locker_id": locker_id, "reason": reason }))
                .await
        }
        QueueCommands::Unblock { kiosk, locker_id } => {
            enqueue(client, &kiosk, json!({ "command_type": "unblock", "locker_id": locker_id })).await
        }
        QueueCommands::ClearQueue { kiosk } => {
            enqueue(client, &kiosk, json!({ "command_type": "clear_queue" })).await
        }
        QueueCommands::Cancel { kiosk, command_id } => {
            client
                .post_staff_no_body(&format!("/v1/kiosks/{kiosk}/commands/{command_id}/cancel"))
                .await?;
            success(&format!("cancelled {command_id}"));
            Ok(())
        }
        QueueCommands::Clear { kiosk } => {
            let resp = client.post_staff_no_body(&format!("/v1/kiosks/{kiosk}/commands/clear")).await?;
            success(&format!("cleared pending queue for {kiosk}"));
            print_json(&resp);
            Ok(())
        }
    }
}

async fn enqueue(client: &Client, kiosk: &str, payload: Value) -> Result<()> {
    let resp =
        client.post_staff(&format!("/v1/kiosks/{kiosk}/commands"), &json!({ "payload": payload })).await?;
    success(&format!("enqueued for {kiosk}"));
    print_json(&resp);
    Ok(())
}

async fn cmd_heartbeat(client: &Client, cmd: HeartbeatCommands) -> Result<()> {
    match cmd {
        HeartbeatCommands::Get { kiosk_id } => {
            let resp = client.get(&format!("/v1/kiosks/{kiosk_id}/heartbeat")).await?;
            print_json(&resp);
            Ok(())
        }
        HeartbeatCommands::List { status } => {
            let resp = client.get(&format!("/v1/kiosks?status={status}")).await?;
            header("💓", &format!("kiosks with status={status}"));
            print_json(&resp);
            Ok(())
        }
    }
}

async fn cmd_zones(client: &Client, cmd: ZoneCommands) -> Result<()> {
    match cmd {
        ZoneCommands::Show => {
            let resp = client.get("/v1/zones").await?;
            header("🗺️ ", "zone configuration");
            print_json(&resp);
            Ok(())
        }
        ZoneCommands::Map { locker_id } => {
            let resp = client.get(&format!("/v1/zones/map/{locker_id}")).await?;
            print_json(&resp);
            Ok(())
        }
        ZoneCommands::Extend { slave_address } => {
            let resp = client
                .post_staff(
                    "/v1/zones/extend",
                    &json!({
                        "new_cards": [{ "slave_address": slave_address, "enabled": true }],
                    }),
                )
                .await?;
            success(&format!("reconciled zones after adding relay card {slave_address}"));
            print_json(&resp);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_events(
    client: &Client,
    kiosk: Option<String>,
    locker: Option<i32>,
    event_type: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: u32,
) -> Result<()> {
    let mut query = vec![format!("limit={limit}")];
    if let Some(k) = kiosk {
        query.push(format!("kiosk_id={k}"));
    }
    if let Some(l) = locker {
        query.push(format!("locker_id={l}"));
    }
    if let Some(t) = event_type {
        query.push(format!("event_type={t}"));
    }
    if let Some(s) = since {
        query.push(format!("since={s}"));
    }
    if let Some(u) = until {
        query.push(format!("until={u}"));
    }
    let resp = client.get_staff(&format!("/v1/events?{}", query.join("&"))).await?;
    header("📜", "events");
    print_json(&resp);
    Ok(())
}

async fn cmd_rate_limit(client: &Client, cmd: RateLimitCommands) -> Result<()> {
    match cmd {
        RateLimitCommands::Check { dimension, key } => {
            let resp = client.get(&format!("/v1/rate-limit/check?dimension={dimension}&key={key}")).await?;
            print_json(&resp);
            Ok(())
        }
        RateLimitCommands::Reset { dimension, key } => {
            client
                .post_staff("/v1/rate-limit/reset", &json!({ "dimension": dimension, "key": key }))
                .await?;
            success(&format!("reset {dimension}:{key}"));
            Ok(())
        }
    }
}
