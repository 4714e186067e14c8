//! Kubeconfig-style document handling.
//!
//! A service-account bundle is merged into the user's existing kubeconfig
//! instead of overwriting it: named entries in `clusters`, `contexts` and
//! `users` are replaced in place when the incoming document carries an entry
//! with the same name, and appended otherwise. The merge is idempotent.

use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::core::{Error, Result};

const MERGE_SECTIONS: [&str; 3] = ["clusters", "contexts", "users"];
const DEFAULT_KEYS: [&str; 2] = ["apiVersion", "kind"];

/// Merge `incoming` into `base` in place.
///
/// Per section, existing entries keep their position when replaced; entries
/// the base has never seen are appended in the incoming document's order.
/// `current-context` is always taken from the incoming document, while
/// `apiVersion` and `kind` are only filled in when the base lacks them.
pub fn merge(base: &mut Mapping, incoming: &Mapping) {
    for section in MERGE_SECTIONS {
        merge_section(base, incoming, section);
    }
    let current = Value::from("current-context");
    if let Some(value) = incoming.get(&current) {
        base.insert(current, value.clone());
    }
    for key in DEFAULT_KEYS {
        let key = Value::from(key);
        if !base.contains_key(&key) {
            if let Some(value) = incoming.get(&key) {
                base.insert(key, value.clone());
            }
        }
    }
}

fn merge_section(base: &mut Mapping, incoming: &Mapping, section: &str) {
    let key = Value::from(section);
    let Some(incoming_value) = incoming.get(&key) else {
        return;
    };
    if !base.contains_key(&key) {
        base.insert(key, incoming_value.clone());
        return;
    }
    let incoming_entries: Vec<Value> = incoming_value
        .as_sequence()
        .cloned()
        .unwrap_or_default();
    let Some(base_entries) = base.get_mut(&key).and_then(Value::as_sequence_mut) else {
        return;
    };
    // Slots are consumed as they replace base entries; leftovers append.
    let mut remaining: Vec<Option<Value>> = incoming_entries.into_iter().map(Some).collect();
    for entry in base_entries.iter_mut() {
        let Some(name) = entry_name(entry).map(str::to_owned) else {
            continue;
        };
        for slot in remaining.iter_mut() {
            let matches = slot
                .as_ref()
                .and_then(entry_name)
                .is_some_and(|candidate| candidate == name);
            if matches {
                if let Some(replacement) = slot.take() {
                    *entry = replacement;
                }
                break;
            }
        }
    }
    base_entries.extend(remaining.into_iter().flatten());
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry
        .as_mapping()?
        .get(&Value::from("name"))?
        .as_str()
}

/// Read a kubeconfig document, treating a missing or empty file as an empty
/// document.
pub async fn load(path: &Path) -> Result<Mapping> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Mapping::new()),
        Err(err) => return Err(Error::Io(err)),
    };
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    Ok(serde_yaml::from_str(&text)?)
}

pub async fn save(path: &Path, doc: &Mapping) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_yaml::to_string(doc)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}
