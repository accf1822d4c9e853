mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use colored::Colorize;
use syncpoint::config::Config;
use syncpoint::diff::{ChangeType, MetadataEquality};
use syncpoint::history::{HistoryStore, SnapshotId};
use syncpoint::path::RelativePath;
use syncpoint::sync::{SyncAction, SyncEngine, Synchronizer};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let engine = SyncEngine::new(config.store.clone());
    let equality = MetadataEquality::with_tolerance(config.mtime_tolerance());

    match cli.command {
        Command::Init => {
            let created = engine.run(|tx| {
                let histories = HistoryStore::new(tx);
                let mut created = Vec::new();
                for name in config.folders.keys() {
                    if !histories.exists(name)? {
                        histories.create_history(name)?;
                        created.push(name.clone());
                    }
                }
                Ok(created)
            })?;

            if created.is_empty() {
                println!("All {} folder(s) already have a history", config.folders.len());
            }
            for name in created {
                println!("{} {}", "created".green(), name);
            }
        }

        Command::Snapshot { folders } => {
            let names: Vec<String> = if folders.is_empty() {
                config.folders.keys().cloned().collect()
            } else {
                folders
            };
            let roots = names
                .iter()
                .map(|name| Ok((name.clone(), config.folder(name)?.to_path_buf())))
                .collect::<Result<Vec<_>>>()?;

            let recorded = engine.run(|tx| {
                let histories = HistoryStore::new(tx);
                let mut recorded = Vec::new();
                for (name, root) in &roots {
                    if !histories.exists(name)? {
                        histories.create_history(name)?;
                    }
                    let snapshot = histories.record_folder(name, root)?;
                    recorded.push((name.clone(), snapshot.map(|s| s.id)));
                }
                Ok(recorded)
            })?;

            for (name, id) in recorded {
                match id {
                    Some(id) => println!("{} {} {}", "snapshot".green(), name, short(id.as_str())),
                    None => println!("{} {}", "unchanged".dimmed(), name),
                }
            }
        }

        Command::Sync => {
            let result = engine.run(|tx| Synchronizer::new(tx, equality).synchronize())?;

            match &result.sync_point {
                Some(point) => println!("Sync point {}", point.id.to_string().bold()),
                None => println!("Nothing changed since the last sync point"),
            }
            for action in &result.actions {
                print_action(action);
            }
            for conflict in &result.conflicts {
                println!(
                    "{} {} ({} versions)",
                    "conflict".red().bold(),
                    conflict.path(),
                    conflict.versions().len()
                );
            }
            if result.cancelled > 0 {
                println!("{} superseded action(s) cancelled", result.cancelled);
            }
        }

        Command::Diff { folder, from, to } => {
            let lists = engine.run(|tx| {
                let sync = Synchronizer::new(tx, equality);
                let to = match &to {
                    Some(id) => SnapshotId::new(id.clone()),
                    None => sync.histories().latest_snapshot(&folder)?.id,
                };
                let from = from.as_ref().map(|id| SnapshotId::new(id.clone()));
                sync.diff(&folder, from.as_ref(), &to)
            })?;

            if lists.is_empty() {
                println!("No changes");
            }
            for list in lists {
                let kinds: Vec<String> = list.iter().map(|c| c.change_type().to_string()).collect();
                println!("{} {}", list.path(), kinds.join(" -> ").dimmed());
            }
        }

        Command::Actions { state, path } => {
            let path = path.as_deref().map(RelativePath::parse).transpose()?;
            let actions = engine.run(|tx| {
                let store = Synchronizer::new(tx, equality).actions();
                match (state, &path) {
                    (Some(state), Some(path)) => store.by_state_and_path(state.into(), path),
                    (Some(state), None) => store.by_state(state.into()),
                    (None, Some(path)) => store.by_path(path),
                    (None, None) => store.items(),
                }
            })?;

            if actions.is_empty() {
                println!("No sync actions");
            }
            for action in &actions {
                print_action(action);
            }
        }

        Command::Mark { id, state } => {
            let id = Uuid::parse_str(&id).with_context(|| format!("Invalid action id '{}'", id))?;
            let action = engine.run(|tx| {
                Synchronizer::new(tx, equality)
                    .actions()
                    .set_state(&id, state.into())
            })?;
            print_action(&action);
        }

        Command::Conflicts => {
            let conflicts = engine.run(|tx| Synchronizer::new(tx, equality).conflicts().items())?;
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in conflicts {
                println!(
                    "{} {} (snapshot set {})",
                    "conflict".red().bold(),
                    conflict.file_path,
                    short(conflict.snapshot_id.as_str())
                );
            }
        }

        Command::Resolve { path, keep } => {
            let path = RelativePath::parse(&path)?;
            let action = engine.run(|tx| {
                Synchronizer::new(tx, equality).resolve(&path, keep.as_deref())
            })?;

            println!("{} {}", "resolved".green(), path);
            if let Some(action) = action {
                print_action(&action);
            }
        }

        Command::Remove { folder } => {
            engine.run(|tx| HistoryStore::new(tx).remove_history(&folder))?;
            println!("{} {}", "removed".yellow(), folder);
        }

        Command::Status => {
            let (histories, point, pending, conflicts) = engine.run(|tx| {
                let sync = Synchronizer::new(tx, equality);
                Ok((
                    sync.histories().latest_ids()?,
                    sync.sync_points().latest()?,
                    sync.actions().pending()?.len(),
                    sync.conflicts().items()?.len(),
                ))
            })?;

            println!("{}", "Histories".bold());
            if histories.is_empty() {
                println!("  (none)");
            }
            for (name, id) in &histories {
                println!("  {:<20} {}", name, short(id.as_str()));
            }
            match point {
                Some(point) => println!(
                    "Sync point {} at {}",
                    point.id,
                    point.created.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("Not synchronized yet"),
            }
            println!("{} pending action(s), {} conflict(s)", pending, conflicts);
        }
    }

    Ok(())
}

fn print_action(action: &SyncAction) {
    let kind = match action.change_type {
        ChangeType::Added => "add".green(),
        ChangeType::Modified => "update".cyan(),
        ChangeType::Deleted => "delete".red(),
    };
    println!(
        "{:<8} {} {} {}",
        kind,
        action.path,
        format!("[{} from {}]", action.state(), action.source).dimmed(),
        action.id.to_string().dimmed()
    );
}

fn short(id: &str) -> &str {
    &id[..id.len().min(10)]
}
