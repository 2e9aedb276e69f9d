use std::{collections::HashMap, env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

const DEFAULT_GC_COOLDOWN_SECS: u64 = 30;
const DEFAULT_GC_GRACE_SECS: u64 = 300;
const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 90;

/// Snapshot of the process environment, captured once per configuration
/// build so lookups stay consistent within one resolution pass.
#[derive(Clone, Debug)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        let secs = self
            .var(key)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Resolved paths and policy knobs for one modkeep home.
#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub store_root: PathBuf,
    pub manifests_root: PathBuf,
    pub profiles_root: PathBuf,
    pub audit_root: PathBuf,
    pub gc_cooldown: Duration,
    pub gc_grace: Duration,
    pub audit_retention_days: u32,
}

impl Config {
    /// Build a configuration from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let home = match snapshot.var("MODKEEP_HOME") {
            Some(path) => PathBuf::from(path),
            None => dirs_next::home_dir()
                .context("failed to resolve HOME for the modkeep library")?
                .join(".modkeep"),
        };
        let store_root = snapshot
            .var("MODKEEP_STORE_PATH")
            .map_or_else(|| home.join("store"), PathBuf::from);
        let audit_retention_days = snapshot
            .var("MODKEEP_AUDIT_RETENTION_DAYS")
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(DEFAULT_AUDIT_RETENTION_DAYS);
        Ok(Self {
            manifests_root: home.join("manifests"),
            profiles_root: home.join("profiles"),
            audit_root: home.join("audit"),
            store_root,
            gc_cooldown: snapshot.secs("MODKEEP_GC_COOLDOWN_SECS", DEFAULT_GC_COOLDOWN_SECS),
            gc_grace: snapshot.secs("MODKEEP_GC_GRACE_SECS", DEFAULT_GC_GRACE_SECS),
            audit_retention_days,
            home,
        })
    }
}
