use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::error::MigrateError;

/// Environment variable that overrides the effective DSN, taking
/// precedence over both the config file and `--dsn`.
pub const DSN_ENV_VAR: &str = "PGEVODB_DSN";

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_MIGRATIONS_DIR: &str = "./migrations";
const DEFAULT_LOG_DIR: &str = "./.migrate-logs";
const DEFAULT_TIMEOUT_SEC: u32 = 600;

// =============================================================================
// Raw configuration (exact file shape)
// =============================================================================

/// `migrate.yaml` as written on disk. The recognised keys are an enumerated
/// set; anything else is rejected at load time.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    profiles: BTreeMap<String, RawProfile>,
    default_profile: String,
    #[serde(default)]
    global: RawGlobal,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    dsn: String,
    schema: Option<String>,
    app_env: Option<String>,
    confirm_prod: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobal {
    migrations_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    lock_key: Option<i64>,
    timeout_sec: Option<u32>,
    allow_tags: Option<Vec<String>>,
    interactive: Option<bool>,
}

// =============================================================================
// Resolved profile
// =============================================================================

/// Effective configuration for one run: the selected profile merged with
/// the global section, CLI overrides, and built-in defaults.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub dsn: String,
    pub schema: String,
    pub app_env: Option<String>,
    pub confirm_prod: bool,
    pub migrations_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_key: i64,
    pub timeout_sec: u32,
    pub allow_tags: Vec<String>,
    pub interactive: bool,
}

/// CLI-level overrides applied on top of the selected profile.
#[derive(Clone, Debug, Default)]
pub struct ProfileOverrides {
    pub dsn: Option<String>,
    pub migrations_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub timeout_sec: Option<u32>,
    pub non_interactive: bool,
}

/// Loads `migrate.yaml` and resolves the effective profile.
///
/// Precedence, lowest to highest: built-in defaults, the `global` section,
/// the selected profile, CLI flags, then the `PGEVODB_DSN` environment
/// variable for the DSN alone. Unknown keys surface as `ConfigError`.
pub fn load_profile(
    config_path: &Path,
    profile_name: Option<&str>,
    overrides: &ProfileOverrides,
) -> Result<Profile, MigrateError> {
    if !config_path.is_file() {
        return Err(MigrateError::ConfigError(format!(
            "configuration file not found: {}",
            config_path.display()
        )));
    }

    let raw: RawConfig = Figment::from(Yaml::file(config_path))
        .extract()
        .map_err(|e| {
            MigrateError::ConfigError(format!(
                "invalid configuration {}: {}",
                config_path.display(),
                e
            ))
        })?;

    if raw.profiles.is_empty() {
        return Err(MigrateError::ConfigError(
            "no profiles defined in configuration".to_string(),
        ));
    }
    if !raw.profiles.contains_key(&raw.default_profile) {
        return Err(MigrateError::ConfigError(format!(
            "default_profile '{}' is not defined in profiles",
            raw.default_profile
        )));
    }

    let name = profile_name.unwrap_or(&raw.default_profile).to_string();
    let selected = raw.profiles.get(&name).ok_or_else(|| {
        MigrateError::ConfigError(format!("profile '{name}' not found"))
    })?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let lock_key = raw.global.lock_key.ok_or_else(|| {
        MigrateError::ConfigError(
            "'global.lock_key' must be specified in configuration".to_string(),
        )
    })?;

    let migrations_dir = overrides.migrations_dir.clone().unwrap_or_else(|| {
        resolve_path(
            raw.global
                .migrations_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_MIGRATIONS_DIR)),
            base_dir,
        )
    });
    let log_dir = overrides.log_dir.clone().unwrap_or_else(|| {
        resolve_path(
            raw.global
                .log_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR)),
            base_dir,
        )
    });

    let mut dsn = overrides.dsn.clone().unwrap_or_else(|| selected.dsn.clone());
    if let Ok(env_dsn) = env::var(DSN_ENV_VAR) {
        if !env_dsn.is_empty() {
            dsn = env_dsn;
        }
    }

    Ok(Profile {
        name,
        dsn,
        schema: selected
            .schema
            .clone()
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        app_env: selected.app_env.clone(),
        confirm_prod: selected.confirm_prod.unwrap_or(false),
        migrations_dir,
        log_dir,
        lock_key,
        timeout_sec: overrides
            .timeout_sec
            .or(raw.global.timeout_sec)
            .unwrap_or(DEFAULT_TIMEOUT_SEC),
        allow_tags: raw.global.allow_tags.clone().unwrap_or_default(),
        interactive: !overrides.non_interactive
            && raw.global.interactive.unwrap_or(true),
    })
}

fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
profiles:
  dev:
    dsn: postgres://dev@localhost/dev
  prod:
    dsn: postgres://prod@db/prod
    schema: app
    app_env: production
    confirm_prod: true
default_profile: dev
global:
  migrations_dir: migrations
  log_dir: logs
  lock_key: 427001
  timeout_sec: 120
  allow_tags: [core]
  interactive: false
";

    fn write_config(content: &str) -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("migrate.yaml");
        fs::write(&path, content).expect("Failed to write config");
        (temp_dir, path)
    }

    #[test]
    fn test_default_profile_resolution() {
        let (temp_dir, path) = write_config(SAMPLE);
        let profile =
            load_profile(&path, None, &ProfileOverrides::default()).expect("Load should succeed");

        assert_eq!(profile.name, "dev");
        assert_eq!(profile.dsn, "postgres://dev@localhost/dev");
        assert_eq!(profile.schema, "public");
        assert!(!profile.confirm_prod);
        assert_eq!(profile.lock_key, 427001);
        assert_eq!(profile.timeout_sec, 120);
        assert_eq!(profile.allow_tags, vec!["core"]);
        assert!(!profile.interactive);
        assert_eq!(profile.migrations_dir, temp_dir.path().join("migrations"));
        assert_eq!(profile.log_dir, temp_dir.path().join("logs"));
    }

    #[test]
    fn test_named_profile_resolution() {
        let (_temp_dir, path) = write_config(SAMPLE);
        let profile = load_profile(&path, Some("prod"), &ProfileOverrides::default())
            .expect("Load should succeed");

        assert_eq!(profile.name, "prod");
        assert_eq!(profile.schema, "app");
        assert_eq!(profile.app_env.as_deref(), Some("production"));
        assert!(profile.confirm_prod);
    }

    #[test]
    fn test_unknown_profile_is_config_error() {
        let (_temp_dir, path) = write_config(SAMPLE);
        let err = load_profile(&path, Some("staging"), &ProfileOverrides::default()).unwrap_err();
        assert!(matches!(err, MigrateError::ConfigError(_)));
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let (_temp_dir, path) = write_config(
            "profiles:\n  dev:\n    dsn: x\n    dns: typo\ndefault_profile: dev\nglobal:\n  lock_key: 1\n",
        );
        let err = load_profile(&path, None, &ProfileOverrides::default()).unwrap_err();
        match err {
            MigrateError::ConfigError(msg) => assert!(msg.contains("invalid configuration")),
            other => panic!("Expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_lock_key_is_config_error() {
        let (_temp_dir, path) =
            write_config("profiles:\n  dev:\n    dsn: x\ndefault_profile: dev\n");
        let err = load_profile(&path, None, &ProfileOverrides::default()).unwrap_err();
        match err {
            MigrateError::ConfigError(msg) => assert!(msg.contains("lock_key")),
            other => panic!("Expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_default_profile_is_config_error() {
        let (_temp_dir, path) = write_config(
            "profiles:\n  dev:\n    dsn: x\ndefault_profile: nope\nglobal:\n  lock_key: 1\n",
        );
        let err = load_profile(&path, None, &ProfileOverrides::default()).unwrap_err();
        assert!(matches!(err, MigrateError::ConfigError(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_profile(
            Path::new("/nonexistent/migrate.yaml"),
            None,
            &ProfileOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::ConfigError(_)));
    }

    #[test]
    fn test_cli_overrides_take_precedence() {
        let (_temp_dir, path) = write_config(SAMPLE);
        let overrides = ProfileOverrides {
            dsn: Some("postgres://other@host/db".to_string()),
            migrations_dir: Some(PathBuf::from("/tmp/m")),
            log_dir: Some(PathBuf::from("/tmp/l")),
            timeout_sec: Some(5),
            non_interactive: true,
        };
        let profile = load_profile(&path, None, &overrides).expect("Load should succeed");

        assert_eq!(profile.dsn, "postgres://other@host/db");
        assert_eq!(profile.migrations_dir, PathBuf::from("/tmp/m"));
        assert_eq!(profile.log_dir, PathBuf::from("/tmp/l"));
        assert_eq!(profile.timeout_sec, 5);
        assert!(!profile.interactive);
    }

    #[test]
    fn test_defaults_applied() {
        let (temp_dir, path) = write_config(
            "profiles:\n  dev:\n    dsn: x\ndefault_profile: dev\nglobal:\n  lock_key: 7\n",
        );
        let profile =
            load_profile(&path, None, &ProfileOverrides::default()).expect("Load should succeed");

        assert_eq!(profile.timeout_sec, 600);
        assert_eq!(profile.schema, "public");
        assert!(profile.interactive);
        assert!(profile.allow_tags.is_empty());
        assert_eq!(profile.migrations_dir, temp_dir.path().join("./migrations"));
        assert_eq!(profile.log_dir, temp_dir.path().join("./.migrate-logs"));
    }
}
