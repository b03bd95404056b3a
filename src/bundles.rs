use std::fs;
use std::path::{Path, PathBuf};

use hex::encode;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::MigrateError;

const UP_FILE: &str = "up.sql";
const DOWN_FILE: &str = "down.sql";
const VERIFY_FILE: &str = "verify.sql";
const META_FILE: &str = "meta.yaml";

const INCLUDE_PREFIX: &str = "-- @include ";

/// Separator byte between the expanded up script and the down script in
/// the fingerprint input.
const FINGERPRINT_SEP: u8 = 0x1F;

/// Optional per-migration metadata, parsed from `meta.yaml`.
///
/// Unknown keys are rejected so that typos surface at load time instead of
/// silently losing a constraint.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleMeta {
    #[serde(default)]
    pub timeout_sec: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_reversible")]
    pub reversible: bool,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub online_safe: bool,
    #[serde(default)]
    pub pre_hooks: Vec<String>,
    #[serde(default)]
    pub post_hooks: Vec<String>,
}

fn default_reversible() -> bool {
    true
}

impl Default for BundleMeta {
    fn default() -> Self {
        BundleMeta {
            timeout_sec: None,
            tags: Vec::new(),
            reversible: true,
            requires: Vec::new(),
            online_safe: false,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }
}

/// One on-disk migration bundle, fully resolved.
///
/// Scripts are read and `@include`-expanded at load time; later phases
/// never go back to the filesystem.
#[derive(Clone, Debug)]
pub struct Bundle {
    id: String,
    dir: PathBuf,
    up_script: String,
    down_script: String,
    verify_script: Option<String>,
    meta: BundleMeta,
    fingerprint: String,
}

impl Bundle {
    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(dead_code)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn up_script(&self) -> &str {
        &self.up_script
    }

    pub fn down_script(&self) -> &str {
        &self.down_script
    }

    pub fn verify_script(&self) -> Option<&str> {
        self.verify_script.as_deref()
    }

    pub fn meta(&self) -> &BundleMeta {
        &self.meta
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
impl Bundle {
    /// In-memory bundle for planner and executor tests.
    pub(crate) fn synthetic(id: &str, up: &str, down: &str, meta: BundleMeta) -> Self {
        let fingerprint = fingerprint(up, down);
        Bundle {
            id: id.to_string(),
            dir: PathBuf::from(id),
            up_script: up.to_string(),
            down_script: down.to_string(),
            verify_script: None,
            meta,
            fingerprint,
        }
    }
}

/// Discovers migration bundles one level below `root`, sorted by id.
///
/// Each bundle directory must contain `up.sql` and `down.sql`; `verify.sql`
/// and `meta.yaml` are optional. Ids must be strictly ascending in
/// lexicographic order, which the sorted directory listing guarantees
/// unless two entries collide after normalization.
pub fn load_bundles(root: &Path) -> Result<Vec<Bundle>, MigrateError> {
    if !root.is_dir() {
        return Err(MigrateError::BundleError(format!(
            "migrations directory '{}' does not exist or is not a directory",
            root.display()
        )));
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    let mut bundles = Vec::with_capacity(dirs.len());
    for dir in dirs {
        bundles.push(load_bundle(&dir)?);
    }
    bundles.sort_by(|a, b| a.id.cmp(&b.id));
    require_sequential(&bundles)?;
    Ok(bundles)
}

fn load_bundle(dir: &Path) -> Result<Bundle, MigrateError> {
    let id = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            MigrateError::BundleError(format!(
                "bundle directory '{}' has a non-UTF-8 name",
                dir.display()
            ))
        })?
        .to_string();

    let up_raw = read_required(dir, &id, UP_FILE)?;
    let down_script = read_required(dir, &id, DOWN_FILE)?;
    let up_script = expand_includes(&up_raw, dir, &id)?;

    let verify_path = dir.join(VERIFY_FILE);
    let verify_script = if verify_path.is_file() {
        Some(fs::read_to_string(&verify_path)?)
    } else {
        None
    };

    let meta = load_meta(&dir.join(META_FILE), &id)?;
    if let Some(timeout) = meta.timeout_sec {
        if timeout == 0 {
            return Err(MigrateError::BundleError(format!(
                "migration {id}: timeout_sec must be a positive integer"
            )));
        }
    }

    let fingerprint = fingerprint(&up_script, &down_script);

    Ok(Bundle {
        id,
        dir: dir.to_path_buf(),
        up_script,
        down_script,
        verify_script,
        meta,
        fingerprint,
    })
}

fn read_required(dir: &Path, id: &str, name: &str) -> Result<String, MigrateError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(MigrateError::BundleError(format!(
            "migration {id} is missing {name}"
        )));
    }
    fs::read_to_string(&path).map_err(|e| {
        MigrateError::BundleError(format!("migration {id}: cannot read {name}: {e}"))
    })
}

fn load_meta(path: &Path, id: &str) -> Result<BundleMeta, MigrateError> {
    if !path.is_file() {
        return Ok(BundleMeta::default());
    }
    let text = fs::read_to_string(path)?;
    serde_yaml::from_str(&text).map_err(|e| {
        MigrateError::BundleError(format!("migration {id}: malformed meta.yaml: {e}"))
    })
}

/// Expands `-- @include <relative-path>` lines in a script.
///
/// One-pass text substitution: the directive line is replaced by the bytes
/// of the referenced file. Included files may not themselves contain
/// `@include` directives, which also rules out cycles. Everything else,
/// whitespace included, passes through untouched so the fingerprint stays
/// stable under renames that do not change the expansion.
fn expand_includes(script: &str, dir: &Path, id: &str) -> Result<String, MigrateError> {
    if !script.contains(INCLUDE_PREFIX) {
        return Ok(script.to_string());
    }

    let mut expanded = String::with_capacity(script.len());
    for line in script.split_inclusive('\n') {
        let content = line.strip_suffix('\n').unwrap_or(line);
        let content = content.strip_suffix('\r').unwrap_or(content);
        match parse_include(content) {
            Some(rel) => {
                let include_path = dir.join(rel);
                let text = fs::read_to_string(&include_path).map_err(|_| {
                    MigrateError::BundleError(format!(
                        "migration {id}: @include file not found: {}",
                        include_path.display()
                    ))
                })?;
                if text.lines().any(|l| parse_include(l).is_some()) {
                    return Err(MigrateError::BundleError(format!(
                        "migration {id}: nested @include in {} is not supported",
                        include_path.display()
                    )));
                }
                expanded.push_str(&text);
                if line.ends_with('\n') && !text.ends_with('\n') {
                    expanded.push('\n');
                }
            }
            None => expanded.push_str(line),
        }
    }
    Ok(expanded)
}

fn parse_include(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(INCLUDE_PREFIX)?;
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// SHA-256 over `expanded_up || 0x1F || down`, lowercase hex.
pub fn fingerprint(expanded_up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(expanded_up.as_bytes());
    hasher.update([FINGERPRINT_SEP]);
    hasher.update(down.as_bytes());
    encode(hasher.finalize())
}

fn require_sequential(bundles: &[Bundle]) -> Result<(), MigrateError> {
    let mut previous: Option<&str> = None;
    for bundle in bundles {
        if let Some(prev) = previous {
            if bundle.id.as_str() <= prev {
                return Err(MigrateError::BundleError(format!(
                    "migration ids are not strictly ascending: '{}' follows '{}'",
                    bundle.id, prev
                )));
            }
        }
        previous = Some(&bundle.id);
    }
    Ok(())
}
