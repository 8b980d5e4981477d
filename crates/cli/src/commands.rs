//! Command handlers.
//!
//! Handlers write to any `io::Write` so they can be exercised without a
//! terminal.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use hive_core::bus::{PersistedMessageRecord, PENDING_NAMESPACE};
use hive_core::config::{config_path, HiveConfig};
use hive_core::machine::{MachineSnapshot, MACHINE_NAMESPACE};
use hive_core::store::{SetOptions, Store};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum StoreCommand {
    /// Print the value stored under a key
    Get { namespace: String, key: String },
    /// Store a JSON value (plain text is stored as a string)
    Set {
        namespace: String,
        key: String,
        value: String,
        /// Expire the entry after this many milliseconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// List the live keys of a namespace
    Keys { namespace: String },
    /// Delete one key
    Delete { namespace: String, key: String },
    /// Delete every entry in a namespace
    Clear { namespace: String },
    /// List namespaces holding at least one entry
    Namespaces,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to the runtime directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

pub fn status(store: &Store, out: &mut impl Write) -> Result<()> {
    writeln!(out, "backend:  {}", store.backend_name())?;
    writeln!(out, "durable:  {}", store.is_durable())?;
    writeln!(out, "pending:  {}", store.count(PENDING_NAMESPACE)?)?;
    writeln!(out, "machines: {}", store.count(MACHINE_NAMESPACE)?)?;
    Ok(())
}

/// Unprocessed bus messages, in replay order
pub fn pending(store: &Store, json: bool, out: &mut impl Write) -> Result<()> {
    let mut records = Vec::new();
    for entry in store.entries(PENDING_NAMESPACE)? {
        match serde_json::from_value::<PersistedMessageRecord>(entry.value) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(key = %entry.key, "Unreadable message record: {}", e),
        }
    }
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
        return Ok(());
    }
    if records.is_empty() {
        writeln!(out, "No pending messages")?;
        return Ok(());
    }
    for record in &records {
        writeln!(
            out,
            "{:<9} {:<24} {}  {}",
            record.priority.as_str(),
            record.kind.as_str(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.id
        )?;
    }
    Ok(())
}

/// Persisted state machine snapshots
pub fn machines(store: &Store, json: bool, out: &mut impl Write) -> Result<()> {
    let mut snapshots: Vec<(String, MachineSnapshot<Value>)> = Vec::new();
    for entry in store.entries(MACHINE_NAMESPACE)? {
        match serde_json::from_value(entry.value) {
            Ok(snapshot) => snapshots.push((entry.key, snapshot)),
            Err(e) => tracing::warn!(machine = %entry.key, "Unreadable machine snapshot: {}", e),
        }
    }
    snapshots.sort_by(|a, b| a.0.cmp(&b.0));

    if json {
        let map: serde_json::Map<String, Value> = snapshots
            .into_iter()
            .map(|(name, snapshot)| serde_json::to_value(snapshot).map(|v| (name, v)))
            .collect::<Result<_, _>>()?;
        writeln!(out, "{}", serde_json::to_string_pretty(&map)?)?;
        return Ok(());
    }
    if snapshots.is_empty() {
        writeln!(out, "No persisted machines")?;
        return Ok(());
    }
    for (name, snapshot) in &snapshots {
        let state = match &snapshot.current_state {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let error = snapshot
            .last_error
            .as_ref()
            .map(|e| format!("  (last error: {})", e.message))
            .unwrap_or_default();
        writeln!(out, "{:<24} {:<14}{}", name, state, error)?;
    }
    Ok(())
}

pub fn store(store: &Store, command: StoreCommand, out: &mut impl Write) -> Result<()> {
    match command {
        StoreCommand::Get { namespace, key } => match store.get_value(&namespace, &key)? {
            Some(value) => writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?,
            None => bail!("No entry {}/{}", namespace, key),
        },
        StoreCommand::Set {
            namespace,
            key,
            value,
            ttl,
        } => {
            let value = parse_value(&value);
            let options = match ttl {
                Some(ms) => SetOptions::ttl(Duration::from_millis(ms)),
                None => SetOptions::default(),
            };
            store.set(&namespace, &key, &value, options)?;
            writeln!(out, "Stored {}/{}", namespace, key)?;
        }
        StoreCommand::Keys { namespace } => {
            for key in store.keys(&namespace)? {
                writeln!(out, "{}", key)?;
            }
        }
        StoreCommand::Delete { namespace, key } => {
            if !store.delete(&namespace, &key)? {
                bail!("No entry {}/{}", namespace, key);
            }
            writeln!(out, "Deleted {}/{}", namespace, key)?;
        }
        StoreCommand::Clear { namespace } => {
            let removed = store.clear_namespace(&namespace)?;
            writeln!(out, "Removed {} entries from {}", removed, namespace)?;
        }
        StoreCommand::Namespaces => {
            for namespace in store.namespaces()? {
                writeln!(out, "{}", namespace)?;
            }
        }
    }
    Ok(())
}

pub fn purge(store: &Store, out: &mut impl Write) -> Result<()> {
    let purged = store.purge_expired()?;
    writeln!(out, "Purged {} expired entries", purged)?;
    Ok(())
}

pub async fn config(config: &HiveConfig, command: ConfigCommand, out: &mut impl Write) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            writeln!(out, "{}", serde_json::to_string_pretty(config)?)?;
        }
        ConfigCommand::Init { force } => {
            let path = config_path();
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let path = HiveConfig::default()
                .save()
                .await
                .context("Failed to write default configuration")?;
            writeln!(out, "Wrote {}", path.display())?;
        }
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
