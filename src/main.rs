use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vibedom_proxy::cli::{Cli, Commands, LogFormat};
use vibedom_proxy::dlp::Location;
use vibedom_proxy::dlp::catalog::PatternCatalog;
use vibedom_proxy::dlp::scrubber::{ContentScrubber, ScrubConfig};
use vibedom_proxy::gateway::PolicyGateway;
use vibedom_proxy::logging::{self, export};
use vibedom_proxy::policy::config::AppConfig;
use vibedom_proxy::policy::reload::{self, ReloadSources};
use vibedom_proxy::policy::whitelist::Whitelist;
use vibedom_proxy::proxy::{ProxyServer, ProxySettings};

/// Load the config file, or defaults plus environment overrides if it does not exist.
fn load_config(config_path: &Path) -> anyhow::Result<AppConfig> {
    if config_path.exists() {
        return Ok(AppConfig::load_from_path(config_path)?);
    }
    tracing::debug!(
        "Config {} not found, using defaults",
        config_path.display()
    );
    let mut config = AppConfig::default();
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { watch } => {
            cmd_start(&cli.config, watch).await?;
        }
        Commands::Check { host } => {
            cmd_check(&cli.config, &host)?;
        }
        Commands::Scrub {
            file,
            content_type,
            findings_only,
        } => {
            cmd_scrub(&cli.config, &file, content_type.as_deref(), findings_only)?;
        }
        Commands::Rules => {
            cmd_rules(&cli.config)?;
        }
        Commands::Logs { tail, format } => {
            cmd_logs(&cli.config, tail, format)?;
        }
        Commands::Status => {
            cmd_status(&cli.config)?;
        }
        Commands::Init => {
            cmd_init(&cli.config)?;
        }
    }

    Ok(())
}

async fn cmd_start(config_path: &Path, watch: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("vibedom proxy starting...");
    println!("Config:    {}", config_path.display());
    println!("Listen:    {}", config.proxy.listen);
    println!("Whitelist: {}", config.whitelist.path.display());

    let gateway = Arc::new(PolicyGateway::from_config(&config)?);
    println!("Rules loaded: {}", gateway.catalog().len());

    let sources = ReloadSources::from(&config);
    reload::start_sighup_handler(sources.clone(), gateway.clone())?;
    let _watcher = if watch {
        Some(reload::start_file_watcher(sources, gateway.clone())?)
    } else {
        None
    };

    let server = ProxyServer::new(
        config.proxy.listen.clone(),
        gateway.clone(),
        ProxySettings::from(&config.proxy),
    );
    let addr = server.start().await?;
    println!("Proxy running on {}", addr);
    println!(
        "Set HTTP_PROXY=http://{0} HTTPS_PROXY=http://{0} to route traffic through vibedom",
        addr
    );

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    let failures = gateway.audit_failures();
    if failures > 0 {
        eprintln!("Warning: {} audit records could not be written", failures);
    }
    Ok(())
}

fn cmd_check(config_path: &Path, host: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let whitelist = Whitelist::load_or_deny_all(&config.whitelist.path);
    let verdict = whitelist.evaluate(host);
    println!(
        "{}: {}",
        if verdict.allowed { "ALLOW" } else { "DENY" },
        verdict.reason
    );
    Ok(())
}

fn cmd_scrub(
    config_path: &Path,
    file: &Path,
    content_type: Option<&str>,
    findings_only: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = PatternCatalog::load(config.dlp.patterns.as_deref(), config.dlp.builtin_pii)?;
    let scrubber = ContentScrubber::new(ScrubConfig::from(&config.dlp));
    let content = std::fs::read(file)?;

    let scrubbed = scrubber.scrub(&content, content_type, &catalog, Location::RequestBody);
    if !findings_only {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&scrubbed.content)?;
        stdout.flush()?;
    }
    if scrubbed.findings.is_empty() {
        eprintln!("No findings.");
    }
    for finding in &scrubbed.findings {
        eprintln!("{:<32} x{}", finding.rule_name, finding.occurrence_count);
    }
    Ok(())
}

fn cmd_rules(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let catalog = PatternCatalog::load(config.dlp.patterns.as_deref(), config.dlp.builtin_pii)?;
    println!(
        "{:<28} {:<8} {:<10} {}",
        "RULE", "CATEGORY", "SEVERITY", "PLACEHOLDER"
    );
    println!("{}", "─".repeat(80));
    for rule in catalog.rules() {
        println!(
            "{:<28} {:<8} {:<10} {}",
            rule.name(),
            format!("{:?}", rule.category()).to_lowercase(),
            format!("{:?}", rule.severity()).to_lowercase(),
            rule.placeholder()
        );
    }
    println!("\n{} rules", catalog.len());
    Ok(())
}

fn cmd_logs(config_path: &Path, tail: usize, format: LogFormat) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if !config.audit.path.exists() {
        println!("No audit log found at {}.", config.audit.path.display());
        return Ok(());
    }

    let mut records = logging::query_recent(&config.audit.path, tail)?;
    match format {
        LogFormat::Json => println!("{}", export::export_json(&records)?),
        LogFormat::Csv => {
            records.reverse();
            print!("{}", export::export_csv(&records)?);
        }
        LogFormat::Table => {
            if records.is_empty() {
                println!("No log entries found.");
                return Ok(());
            }
            println!(
                "{:<26} {:<8} {:<30} {:<6} {}",
                "TIMESTAMP", "METHOD", "HOST", "ALLOW", "FINDINGS"
            );
            println!("{}", "─".repeat(110));
            for record in &records {
                println!(
                    "{:<26} {:<8} {:<30} {:<6} {}",
                    record.timestamp,
                    record.method,
                    record.host,
                    if record.allowed { "yes" } else { "no" },
                    export::summarize_findings(record)?
                );
            }
        }
    }
    Ok(())
}

fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if !config.audit.path.exists() {
        println!("vibedom status: no audit log found at {}.", config.audit.path.display());
        println!("Run 'vibedom-proxy start' to begin monitoring.");
        return Ok(());
    }
    let stats = logging::query_stats(&config.audit.path)?;
    println!("vibedom status");
    println!("──────────────");
    println!("Total exchanges: {}", stats.total);
    println!("  Allowed:       {}", stats.allowed);
    println!("  Denied:        {}", stats.denied);
    println!("  Scrubbed:      {}", stats.scrubbed);
    println!("  Not scrubbed:  {}", stats.degraded);
    Ok(())
}

fn cmd_init(config_path: &Path) -> anyhow::Result<()> {
    println!("Initializing vibedom proxy configuration...");
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let files = [
        (config_path.to_path_buf(), include_str!("../templates/vibedom.toml")),
        (dir.join("trusted_domains.txt"), include_str!("../templates/trusted_domains.txt")),
    ];
    for (path, content) in &files {
        if path.exists() {
            println!("  Already exists: {}", path.display());
        } else {
            std::fs::write(path, content)?;
            println!("  Created: {}", path.display());
        }
    }

    println!("\nDone! Next steps:");
    println!("  1. Edit trusted_domains.txt to list allowed hosts");
    println!("  2. Start the proxy:  vibedom-proxy start");
    println!("  3. Point the agent at it: HTTP_PROXY / HTTPS_PROXY=http://127.0.0.1:8080");
    Ok(())
}
