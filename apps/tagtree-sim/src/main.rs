//! # TagTree Sim
//!
//! A standalone CLI that runs several rule-tree editors against one in-memory
//! endpoint and shows the optimistic write path at work: local apply, CAS
//! attempt, conflict reconciliation and bounded retry.
//!
//! ```text
//! client ──apply──▶ local tree
//!        ──POST {client_id, base_version, ...}──▶ endpoint
//!        ◀──409 {latest_data, current_version}── reconcile, retry
//!        ◀──200 {version_id}──────────────────── commit
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use tagtree_sdk::{
    ClientConfigBuilder, FlatRules, MemoryKvStore, MemoryTransport, OccConfigBuilder, OccError,
    OccEvent, RecordingSink, RuleGroup, RulesClient, RulesTree, TreeBuilder,
};
use tokio::sync::broadcast;

type SimResult<T> = Result<T, Box<dyn Error>>;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tagtree-sim")]
#[command(about = "Optimistic concurrency simulator for shared rule trees (TagTree SDK)")]
#[command(version)]
struct Cli {
    /// Log SDK internals (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two editors, one stale write, one reconciliation
    Demo,
    /// Many editors hammering the same endpoint
    Contention {
        /// Number of concurrent clients
        #[arg(short, long, default_value_t = 4)]
        clients: usize,
        /// Writes per client
        #[arg(short, long, default_value_t = 5)]
        ops: usize,
        /// Delay between retries, in milliseconds
        #[arg(short, long, default_value_t = 20)]
        delay: u64,
        /// Attempts per write
        #[arg(short, long, default_value_t = tagtree_sdk::MAX_RETRIES)]
        attempts: u32,
    },
    /// Build and print a tree from a JSON rules file
    Tree {
        /// Path to a JSON payload with groups, keywords and hierarchy
        path: PathBuf,
    },
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_tree(label: &str, tree: &RulesTree) {
    println!(
        "  {} {}",
        label.bright_magenta(),
        format!("(version {})", tree.version).dimmed()
    );
    if tree.is_empty() {
        println!("    {}", "(no groups)".dimmed());
        return;
    }
    tree.walk(|depth, group| print_group(depth, group));
}

fn print_group(depth: usize, group: &RuleGroup) {
    let indent = "  ".repeat(depth + 2);
    let name = if group.enabled {
        group.name.bright_white().bold()
    } else {
        group.name.dimmed().strikethrough()
    };
    let keywords = if group.keywords.is_empty() {
        String::new()
    } else {
        format!("[{}]", group.keyword_texts().join(", "))
    };
    println!(
        "{}{} {} {}",
        indent,
        name,
        format!("#{}", group.id).dimmed(),
        keywords.bright_green()
    );
}

fn show_events(who: &str, events: &mut broadcast::Receiver<OccEvent>) {
    while let Ok(event) = events.try_recv() {
        let line = match event {
            OccEvent::Applied { op } => format!("{} applied locally", op),
            OccEvent::AttemptStarted {
                attempt,
                base_version,
                ..
            } => format!("attempt {} at base {}", attempt, base_version),
            OccEvent::Conflicted {
                current_version,
                unique_modifiers,
                ..
            } => format!(
                "{} server at {}, {} other editor(s)",
                "conflict:".bright_red(),
                current_version.map_or("?".to_string(), |v| v.to_string()),
                unique_modifiers
            ),
            OccEvent::Succeeded {
                attempts, version, ..
            } => format!(
                "{} version {} after {} attempt(s)",
                "committed".bright_green(),
                version,
                attempts
            ),
            OccEvent::RolledBack { reason, .. } => format!("rolled back: {}", reason),
            OccEvent::Failed { error, .. } => format!("{} {}", "failed:".bright_red(), error),
        };
        println!("    {} {}", format!("{:>6}", who).bright_magenta(), line);
    }
}

fn open_client(
    transport: &Arc<MemoryTransport>,
    name: &str,
    delay_ms: u64,
    attempts: u32,
) -> SimResult<RulesClient<MemoryTransport>> {
    let config = ClientConfigBuilder::new()
        .key_prefix(name)
        .occ(
            OccConfigBuilder::new()
                .retry_delay(delay_ms)
                .max_attempts(attempts)
                .notify_on_failure(false)
                .build(),
        )
        .build();
    Ok(RulesClient::open(
        transport.clone(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(RecordingSink::new()),
        config,
    )?)
}

fn seed() -> FlatRules {
    let mut rules = FlatRules::new(1);
    rules.insert_group(1, "Animals", true);
    rules.insert_group(2, "Cats", true);
    rules.insert_group(3, "Dogs", true);
    rules.add_edge(1, 2);
    rules.add_edge(1, 3);
    rules.add_keyword(2, "cat");
    rules.add_keyword(2, "kitten");
    rules.add_keyword(3, "dog");
    rules
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo() -> SimResult<()> {
    header("DEMO — Stale Write, Conflict, Reconcile, Retry");

    let transport = Arc::new(MemoryTransport::new(seed()));
    let alice = open_client(&transport, "alice", 200, tagtree_sdk::MAX_RETRIES)?;
    let bob = open_client(&transport, "bob", 200, tagtree_sdk::MAX_RETRIES)?;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    section("Phase 1: Both editors fetch version 1");
    alice.refresh().await?;
    bob.refresh().await?;
    step(&format!("alice id {}", alice.client_id()));
    step(&format!("bob   id {}", bob.client_id()));
    if let Some(tree) = alice.tree() {
        show_tree("shared", &tree);
    }

    section("Phase 2: alice creates a group under Animals");
    let created = alice.create_group("Birds", true, Some(1)).await?;
    show_events("alice", &mut alice_events);
    let birds = created.new_id.unwrap_or_default();
    step(&format!("server assigned id {} to Birds", birds));

    section("Phase 3: bob, still at version 1, adds a keyword");
    bob.add_keyword(3, "puppy").await?;
    show_events("bob", &mut bob_events);

    section("Phase 4: alice refreshes");
    alice.refresh().await?;
    for (who, client) in [("alice", &alice), ("bob", &bob)] {
        if let Some(tree) = client.tree() {
            show_tree(who, &tree);
        }
    }

    let converged = alice.tree().map(|t| t.groups.clone()) == bob.tree().map(|t| t.groups.clone());
    if converged {
        println!("\n  {} {}", "✓".bright_green().bold(), "EDITORS AGREE".bright_green().bold());
    } else {
        println!("\n  {} {}", "✗".bright_red().bold(), "EDITORS DIFFER".bright_red().bold());
    }
    Ok(())
}

// ─── Contention ────────────────────────────────────────────────────────────

#[derive(Default)]
struct ContentionStats {
    committed: usize,
    exhausted: usize,
    failed: usize,
}

async fn run_contention(clients: usize, ops: usize, delay: u64, attempts: u32) -> SimResult<()> {
    header("CONTENTION — Concurrent Editors, One Endpoint");

    let transport = Arc::new(MemoryTransport::new(seed()));
    let mut editors = Vec::with_capacity(clients);
    for i in 0..clients {
        let client = open_client(&transport, &format!("editor{}", i), delay, attempts)?;
        client.refresh().await?;
        editors.push(Arc::new(client));
    }
    step(&format!(
        "{} editors x {} writes, {} attempt(s) each, {}ms back-off",
        clients, ops, attempts, delay
    ));

    let mut handles = Vec::with_capacity(clients);
    for (i, editor) in editors.iter().enumerate() {
        let editor = editor.clone();
        handles.push(tokio::spawn(async move {
            let mut stats = ContentionStats::default();
            for n in 0..ops {
                let group = 2 + ((i + n) % 2) as i64;
                match editor.add_keyword(group, format!("e{}-{}", i, n)).await {
                    Ok(_) => stats.committed += 1,
                    Err(OccError::RetriesExhausted { .. }) => stats.exhausted += 1,
                    Err(_) => stats.failed += 1,
                }
                tokio::task::yield_now().await;
            }
            stats
        }));
    }

    let mut total = ContentionStats::default();
    for handle in handles {
        let stats = handle.await?;
        total.committed += stats.committed;
        total.exhausted += stats.exhausted;
        total.failed += stats.failed;
    }
    let reconciliations: u64 = editors
        .iter()
        .map(|e| e.coordinator().reconciler().reconciliations())
        .sum();

    section("Results");
    step(&format!("committed       {}", total.committed.to_string().bright_green()));
    step(&format!("exhausted       {}", total.exhausted.to_string().bright_yellow()));
    step(&format!("failed          {}", total.failed.to_string().bright_red()));
    step(&format!("reconciliations {}", reconciliations));
    step(&format!("server version  {}", transport.version()));

    let expected = 1 + total.committed as i64;
    if transport.version() == expected {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "EVERY COMMIT ADVANCED THE VERSION EXACTLY ONCE".bright_green().bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            format!("VERSION {} != EXPECTED {}", transport.version(), expected)
                .bright_red()
                .bold()
        );
    }
    Ok(())
}

// ─── Tree ──────────────────────────────────────────────────────────────────

fn run_tree(path: &PathBuf) -> SimResult<()> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let payload = ["latest_data", "data"]
        .iter()
        .find_map(|key| value.get(*key).filter(|v| v.is_object()))
        .unwrap_or(&value);

    let rules = FlatRules::from_value(payload);
    let tree = TreeBuilder::build(&rules);

    header(&format!("TREE — {}", path.display()));
    step(&format!(
        "{} groups, {} keywords, {} edges in; {} roots out",
        rules.groups.len(),
        rules.keywords.len(),
        rules.hierarchy.len(),
        tree.groups.len()
    ));
    show_tree("rules", &tree);
    Ok(())
}

// ─── Main ──────────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> SimResult<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(true).init();

    match cli.command {
        Commands::Demo => run_demo().await,
        Commands::Contention {
            clients,
            ops,
            delay,
            attempts,
        } => run_contention(clients.max(1), ops, delay, attempts).await,
        Commands::Tree { path } => run_tree(&path),
    }
}
