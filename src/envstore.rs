//! The persisted environment-entry store: configuration values (like the
//! chosen compiler) that participate in staleness without being files.
//!
//! On disk it is a small directory with one record file per key.  A record
//! holds the version the value last changed at, then the value itself.
//! Setting a key to the value it already holds leaves the version alone, so
//! an unchanged configuration never invalidates anything.

use crate::version::{now_ms, Version};
use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::path::PathBuf;

/// Prefix distinguishing entry vertices from path vertices in the graph.
const VERTEX_PREFIX: &str = "env:";

#[derive(Debug)]
struct Record {
    version: u64,
    value: String,
}

pub struct EnvStore {
    dir: PathBuf,
    records: HashMap<String, Record>,
}

impl EnvStore {
    /// Load every record under `dir`.  A missing directory is an empty store;
    /// it is created on the first write.
    pub fn load(dir: impl Into<PathBuf>) -> anyhow::Result<EnvStore> {
        let dir = dir.into();
        let mut records = HashMap::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let key = match entry.file_name().into_string() {
                        Ok(key) => key,
                        Err(name) => bail!("{:?}: non-utf8 entry name", name),
                    };
                    // A leftover temp file means a write never landed.
                    if key.ends_with(".tmp") {
                        continue;
                    }
                    let text = std::fs::read_to_string(entry.path())?;
                    let record = parse_record(&text)
                        .with_context(|| format!("{}: bad entry record", entry.path().display()))?;
                    records.insert(key, record);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(anyhow!("read {}: {}", dir.display(), err)),
        }
        Ok(EnvStore { dir, records })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.records.get(key).map(|rec| rec.value.as_str())
    }

    pub fn version(&self, key: &str) -> Version {
        match self.records.get(key) {
            Some(rec) => Version::Stamp(rec.version),
            None => Version::Missing,
        }
    }

    /// Write `key` = `value`.  A first observation lands at version 0; a
    /// changed value advances the version past every previously issued one;
    /// an unchanged value returns the stored version untouched.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<Version> {
        if key.is_empty() || key.contains(std::path::MAIN_SEPARATOR) {
            bail!("invalid entry key {:?}", key);
        }
        let version = match self.records.get(key) {
            Some(rec) if rec.value == value => return Ok(Version::Stamp(rec.version)),
            Some(rec) => now_ms().max(rec.version + 1),
            None => 0,
        };
        self.write_record(key, version, value)?;
        self.records.insert(
            key.to_string(),
            Record {
                version,
                value: value.to_string(),
            },
        );
        Ok(Version::Stamp(version))
    }

    fn write_record(&self, key: &str, version: u64, value: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| anyhow!("create {}: {}", self.dir.display(), err))?;
        let path = self.dir.join(key);
        let tmp = self.dir.join(format!("{}.tmp", key));
        std::fs::write(&tmp, format!("{}\n{}", version, value))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The graph vertex name for an entry key.
    pub fn vertex_name(key: &str) -> String {
        format!("{}{}", VERTEX_PREFIX, key)
    }

    /// Inverse of vertex_name.
    pub fn entry_key(name: &str) -> &str {
        name.strip_prefix(VERTEX_PREFIX).unwrap_or(name)
    }
}

fn parse_record(text: &str) -> anyhow::Result<Record> {
    let (version, value) = text
        .split_once('\n')
        .ok_or_else(|| anyhow!("missing version line"))?;
    Ok(Record {
        version: version.trim().parse()?,
        value: value.to_string(),
    })
}
