//! Session commands: `progeny spin`, `cleanup`, `list`, `reconcile`.

use anyhow::{Result, anyhow};
use chrono::Utc;
use std::collections::BTreeMap;

use progeny::config::ProgenyConfig;
use progeny::spinner::command::{SpecParts, ToolConfig, parse_key_value};
use progeny::spinner::manager::{LifecycleManager, SpinRequest};
use progeny::spinner::models::{SelectorParts, Session, session_url};

use super::super::SpinArgs;

fn parse_pairs(raw: &[String]) -> Result<Option<ToolConfig>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut map = BTreeMap::new();
    for item in raw {
        let (key, value) = parse_key_value(item).map_err(|e| anyhow!(e))?;
        map.insert(key, value);
    }
    Ok(Some(map))
}

/// Translate CLI flags into the loosely-typed spec input.
pub fn spec_parts(args: &SpinArgs) -> Result<SpecParts> {
    Ok(SpecParts {
        command: args.command.clone(),
        prebaked: args.prebaked.clone(),
        recipe: args.recipe.clone(),
        recipe_args: (!args.args.is_empty()).then(|| args.args.clone()),
        recipe_kwargs: parse_pairs(&args.kwargs)?,
        config: parse_pairs(&args.config)?,
    })
}

pub async fn cmd_spin(config: &ProgenyConfig, args: SpinArgs) -> Result<()> {
    let spec = spec_parts(&args)?.into_spec()?;
    let mut request = SpinRequest::new(args.username.clone(), spec).uniquify(args.uniquify);
    if let Some(name) = &args.session_name {
        request = request.session_name(name.clone());
    }

    let (manager, _) = LifecycleManager::open(config).await?;
    let outcome = manager.spin(request).await?;
    let url = session_url(
        &config.toml.server.public_host,
        outcome.port,
        &outcome.session_name,
    );

    println!();
    println!(
        "{} session {} on port {}",
        console::style("Spun").green().bold(),
        outcome.session_name,
        outcome.port
    );
    println!("  {}", url);
    println!();
    Ok(())
}

pub async fn cmd_cleanup(config: &ProgenyConfig, parts: SelectorParts) -> Result<()> {
    let selector = parts.into_selector()?;
    let (manager, _) = LifecycleManager::open(config).await?;
    let cleaned = manager.cleanup(&selector).await?;

    println!();
    if cleaned.is_empty() {
        println!("No sessions matched {}", selector);
    } else {
        println!("Cleaned up {} session(s):", cleaned.len());
        for session in &cleaned {
            println!(
                "  {} (port {}, pid {})",
                session.session_name, session.port, session.pid
            );
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_list(config: &ProgenyConfig, parts: SelectorParts) -> Result<()> {
    let (manager, _) = LifecycleManager::open(config).await?;
    let sessions = if parts.is_empty() {
        manager.list().await?
    } else {
        manager.lookup(&parts.into_selector()?).await?
    };

    println!();
    if sessions.is_empty() {
        println!("No live sessions.");
        println!();
        return Ok(());
    }
    print_sessions(&sessions, &config.toml.server.public_host);
    println!();
    println!("{} live session(s)", sessions.len());
    println!();
    Ok(())
}

fn print_sessions(sessions: &[Session], host: &str) {
    let now = Utc::now();
    println!(
        "{:<6} {:<20} {:<16} {:<8} {:<8} URL",
        "Port", "Session", "User", "PID", "Age"
    );
    println!(
        "{:<6} {:<20} {:<16} {:<8} {:<8} ---",
        "------", "--------------------", "----------------", "--------", "--------"
    );
    for session in sessions {
        println!(
            "{:<6} {:<20} {:<16} {:<8} {:<8} {}",
            session.port,
            session.session_name,
            session.username,
            session.pid,
            format_age(session.age(now)),
            console::style(session.url(host)).dim()
        );
    }
}

/// Render an age as its two largest units, e.g. `2h05m`.
pub fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m", h, m)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

pub async fn cmd_reconcile(config: &ProgenyConfig) -> Result<()> {
    let (manager, pruned) = LifecycleManager::open(config).await?;
    let live = manager.list().await?.len();

    println!();
    if pruned.is_empty() {
        println!("Registry is consistent ({} live session(s)).", live);
    } else {
        println!(
            "{} {} stale session(s):",
            console::style("Pruned").yellow().bold(),
            pruned.len()
        );
        for session in &pruned {
            println!("  {} (port {}, pid {})", session.session_name, session.port, session.pid);
        }
        println!("{} live session(s) remain.", live);
    }
    println!();
    Ok(())
}
