//! fOS Ad-Block host
//!
//! Command line front end for the content-blocking engine. Loads the
//! persisted settings, answers block and cosmetic queries, manages lists,
//! rules and the whitelist, and in `serve` mode keeps subscriptions fresh in
//! the background while answering queries read from stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fos_adblock::{
    AdBlockEngine, EngineConfig, FilterCatalog, HttpClient, ListUpdateOutcome, ListUpdater,
    RequestInterceptor, ResourceType, SettingsStore, SystemClock, UpdateReport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "fos-adblock")]
#[command(about = "fOS content blocker: request filtering, element hiding, list updates")]
struct Cli {
    /// Data directory holding settings and cached filter lists
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Filter list catalog (TOML) used instead of the bundled one
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide whether a request would be blocked
    Check {
        /// Request URL
        url: String,

        /// URL of the page issuing the request
        #[arg(short, long, default_value = "")]
        source: String,

        /// Resource type (script, image, xhr, ...)
        #[arg(short, long, default_value = "other")]
        kind: String,
    },

    /// Print the cosmetic rules for a page
    Cosmetic {
        /// Page URL
        url: String,

        /// Print injected scripts instead of the stylesheet
        #[arg(long)]
        js: bool,
    },

    /// Refresh subscriptions now
    Update {
        /// Only this list
        id: Option<String>,
    },

    /// Show or manage installed filter lists
    Lists {
        #[command(subcommand)]
        action: Option<ListAction>,
    },

    /// Subscribe to a filter list URL and fetch it
    Subscribe {
        url: String,

        /// Add the subscription switched off
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a filter list
    Unsubscribe { id: String },

    /// Manage whitelisted domains
    Whitelist {
        #[command(subcommand)]
        action: WhitelistAction,
    },

    /// Manage custom rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Replay a request log and print block statistics
    Stats {
        /// File with one `<url> [source] [kind]` request per line
        requests: PathBuf,

        /// Number of top blocked domains to show
        #[arg(long)]
        top: Option<usize>,

        /// Write the statistics as JSON to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Export settings to a JSON file
    Export { path: PathBuf },

    /// Import settings from a JSON file
    Import { path: PathBuf },

    /// Answer queries from stdin and update lists in the background
    Serve,
}

#[derive(Subcommand)]
enum ListAction {
    /// Switch a list on
    Enable { id: String },
    /// Switch a list off
    Disable { id: String },
    /// Install a local filter file as a user list
    Import {
        id: String,
        file: PathBuf,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Print the bundled catalog
    Catalog,
}

#[derive(Subcommand)]
enum WhitelistAction {
    Add { domain: String },
    Remove { domain: String },
    List,
}

#[derive(Subcommand)]
enum RuleAction {
    Add { rule: String },
    Remove { rule: String },
    Enable { rule: String },
    Disable { rule: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, query answers to stdout
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    let catalog = match &cli.catalog {
        Some(path) => FilterCatalog::from_toml_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => FilterCatalog::bundled().context("Bundled catalog is invalid")?,
    };
    let storage = SettingsStore::new(cli.data_dir.clone().unwrap_or_else(SettingsStore::default_dir));
    info!("Using data directory {}", storage.dir().display());

    let engine = Arc::new(AdBlockEngine::open(
        storage,
        &catalog,
        EngineConfig::default(),
        Arc::new(SystemClock),
    ));

    match cli.command {
        Commands::Check { url, source, kind } => cmd_check(&engine, &url, &source, &kind),
        Commands::Cosmetic { url, js } => {
            let text = if js {
                engine.get_js_rules(&url)
            } else {
                engine.get_css_rules(&url)
            };
            print!("{}", text);
            Ok(())
        }
        Commands::Update { id } => cmd_update(engine, id.as_deref()).await,
        Commands::Lists { action } => cmd_lists(&engine, &catalog, action),
        Commands::Subscribe { url, disabled } => {
            let updater = ListUpdater::new(engine, Arc::new(HttpClient::with_defaults()));
            let outcome = updater.subscribe(&url, !disabled).await?;
            println!("{}: {}", url, describe(outcome));
            Ok(())
        }
        Commands::Unsubscribe { id } => {
            if !engine.remove_filter_list(&id) {
                bail!("No filter list '{}'", id);
            }
            println!("Removed {}", id);
            Ok(())
        }
        Commands::Whitelist { action } => cmd_whitelist(&engine, action),
        Commands::Rule { action } => cmd_rule(&engine, action),
        Commands::Stats {
            requests,
            top,
            export,
        } => cmd_stats(engine, &requests, top, export.as_deref()),
        Commands::Export { path } => {
            engine
                .export_settings(&path)
                .with_context(|| format!("Failed to export settings to {}", path.display()))?;
            println!("Settings written to {}", path.display());
            Ok(())
        }
        Commands::Import { path } => {
            engine
                .import_settings(&path)
                .with_context(|| format!("Failed to import settings from {}", path.display()))?;
            println!("Settings imported from {}", path.display());
            Ok(())
        }
        Commands::Serve => cmd_serve(engine).await,
    }
}

fn cmd_check(engine: &AdBlockEngine, url: &str, source: &str, kind: &str) -> Result<()> {
    let kind = kind.parse().unwrap_or(ResourceType::Other);
    let decision = engine.decide_detailed(url, source, kind);
    println!(
        "{} {} ({:?})",
        if decision.blocked { "BLOCK" } else { "ALLOW" },
        url,
        decision.reason
    );
    Ok(())
}

fn describe(outcome: ListUpdateOutcome) -> String {
    match outcome {
        ListUpdateOutcome::Updated { rules } => format!("updated, {} rules", rules),
        ListUpdateOutcome::Unchanged { rules } => format!("unchanged, {} rules", rules),
        ListUpdateOutcome::Superseded => "superseded by a newer update".to_string(),
        ListUpdateOutcome::Skipped => "added (disabled, not fetched)".to_string(),
    }
}

fn print_report(report: &UpdateReport) {
    for id in &report.updated {
        println!("updated    {}", id);
    }
    for id in &report.unchanged {
        println!("unchanged  {}", id);
    }
    for (id, message) in &report.failed {
        println!("failed     {} ({})", id, message);
    }
}

async fn cmd_update(engine: Arc<AdBlockEngine>, id: Option<&str>) -> Result<()> {
    let updater = ListUpdater::new(engine, Arc::new(HttpClient::with_defaults()));
    match id {
        Some(id) => {
            let outcome = updater.update(id).await?;
            println!("{}: {}", id, describe(outcome));
        }
        None => {
            let report = updater.update_all().await;
            print_report(&report);
            if !report.failed.is_empty() {
                bail!("{} list(s) failed to update", report.failed.len());
            }
        }
    }
    Ok(())
}

fn cmd_lists(engine: &AdBlockEngine, catalog: &FilterCatalog, action: Option<ListAction>) -> Result<()> {
    match action {
        None => {
            for list in engine.lists() {
                println!(
                    "[{}] {:<40} {:<32} {:>7} rules  updated {}",
                    if list.enabled { "x" } else { " " },
                    list.id,
                    list.name,
                    list.rules,
                    list.last_updated
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
            println!("{:?}", engine.status());
        }
        Some(ListAction::Enable { id }) => toggle_list(engine, &id, true)?,
        Some(ListAction::Disable { id }) => toggle_list(engine, &id, false)?,
        Some(ListAction::Import { id, file, name }) => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if !engine.import_user_list(&id, &name, &text) {
                bail!("Could not install {} as '{}'", file.display(), id);
            }
            let rules = engine.list_info(&id).map(|l| l.rules).unwrap_or(0);
            println!("Installed '{}' with {} rules", id, rules);
        }
        Some(ListAction::Catalog) => {
            for entry in &catalog.lists {
                println!(
                    "{} {:<28} {}",
                    if entry.enabled_by_default { "*" } else { " " },
                    entry.name,
                    entry.url
                );
            }
        }
    }
    Ok(())
}

fn toggle_list(engine: &AdBlockEngine, id: &str, enabled: bool) -> Result<()> {
    if engine.list_info(id).is_none() {
        bail!("No filter list '{}'", id);
    }
    engine.set_filter_list_enabled(id, enabled);
    println!("{} {}", if enabled { "Enabled" } else { "Disabled" }, id);
    Ok(())
}

fn cmd_whitelist(engine: &AdBlockEngine, action: WhitelistAction) -> Result<()> {
    match action {
        WhitelistAction::Add { domain } => {
            if !engine.add_whitelist_domain(&domain) {
                bail!("'{}' is empty or already whitelisted", domain);
            }
        }
        WhitelistAction::Remove { domain } => {
            if !engine.remove_whitelist_domain(&domain) {
                bail!("'{}' is not whitelisted", domain);
            }
        }
        WhitelistAction::List => {
            for domain in engine.whitelist() {
                println!("{}", domain);
            }
        }
    }
    Ok(())
}

fn cmd_rule(engine: &AdBlockEngine, action: RuleAction) -> Result<()> {
    match action {
        RuleAction::Add { rule } => {
            if !engine.add_custom_rule(&rule) {
                bail!("Rule rejected (unsupported or duplicate): {}", rule);
            }
        }
        RuleAction::Remove { rule } => {
            if !engine.remove_custom_rule(&rule) {
                bail!("No such custom rule: {}", rule);
            }
        }
        RuleAction::Enable { rule } => {
            if !engine.set_custom_rule_enabled(&rule, true) {
                bail!("No such custom rule: {}", rule);
            }
        }
        RuleAction::Disable { rule } => {
            if !engine.set_custom_rule_enabled(&rule, false) {
                bail!("No such custom rule: {}", rule);
            }
        }
        RuleAction::List => {
            for rule in engine.custom_rules() {
                println!(
                    "[{}] {} ({} hits)",
                    if rule.enabled { "x" } else { " " },
                    rule.rule,
                    rule.hit_count
                );
            }
        }
    }
    Ok(())
}

/// Split a `<url> [source] [kind]` query line
fn parse_query(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.split_whitespace();
    let url = parts.next()?;
    let source = parts.next().unwrap_or("");
    let kind = parts.next().unwrap_or("other");
    Some((url, source, kind))
}

fn cmd_stats(
    engine: Arc<AdBlockEngine>,
    requests: &Path,
    top: Option<usize>,
    export: Option<&Path>,
) -> Result<()> {
    let log = std::fs::read_to_string(requests)
        .with_context(|| format!("Failed to read {}", requests.display()))?;

    let interceptor = RequestInterceptor::new(engine.clone());
    for (url, source, kind) in log.lines().filter_map(parse_query) {
        interceptor.should_block_request(url, source, kind);
    }

    let stats = engine.statistics();
    println!(
        "{} requests, {} blocked ({} ns average check)",
        stats.total_requests,
        stats.total_blocked,
        interceptor.avg_check_time_ns()
    );
    for (domain, count) in engine.top_blocked_domains(top) {
        println!("{:>8}  {}", count, domain);
    }

    if let Some(path) = export {
        engine
            .export_statistics(path)
            .with_context(|| format!("Failed to export statistics to {}", path.display()))?;
    }
    Ok(())
}

/// Query loop
///
/// Each stdin line is one of:
/// - `<url> [source] [kind]` → `block` or `allow`
/// - `css <page url>` / `js <page url>` → cosmetic text, then a blank line
/// - `stats` → statistics as one JSON line
async fn cmd_serve(engine: Arc<AdBlockEngine>) -> Result<()> {
    let updater = Arc::new(ListUpdater::new(
        engine.clone(),
        Arc::new(HttpClient::with_defaults()),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let updater_task = tokio::spawn(updater.run(shutdown_rx));

    let interceptor = RequestInterceptor::new(engine.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Serving queries on stdin");
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if let Some(page) = line.strip_prefix("css ") {
            println!("{}", interceptor.get_css_rules(page.trim()));
        } else if let Some(page) = line.strip_prefix("js ") {
            println!("{}\n", interceptor.get_js_rules(page.trim()));
        } else if line == "stats" {
            println!("{}", serde_json::to_string(&engine.statistics())?);
        } else if let Some((url, source, kind)) = parse_query(line) {
            let blocked = interceptor.should_block_request(url, source, kind);
            println!("{}", if blocked { "block" } else { "allow" });
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = updater_task.await {
        warn!("Updater task ended abnormally: {}", e);
    }

    let (total, blocked, _) = interceptor.stats();
    info!("Served {} queries, {} blocked", total, blocked);
    Ok(())
}
