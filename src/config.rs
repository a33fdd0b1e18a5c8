use crate::retry::RetryPolicy;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "DEPLOY_HARNESS_";
const PROJECT_CONFIG_NAME: &str = ".deploy-harness.yaml";

pub const DEFAULT_BUILDING_SENTINEL: &str = "This deployment is still building";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Merged YAML configuration. Later layers override earlier ones
/// (default < global < project) and `DEPLOY_HARNESS_*` variables override
/// all files.
#[derive(Debug, Clone)]
pub struct Config {
    merged: Value,
}

impl Config {
    pub fn load(project_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = Value::Mapping(Mapping::new());
        for path in config_paths(project_dir) {
            let value = read_yaml(&path)?;
            merged = merge_values(merged, value);
        }
        Ok(Self { merged })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let merged = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self { merged })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let normalized = normalize_key(key)?;
        if let Some(value) = env_override(&normalized) {
            return Some(value);
        }
        lookup_value(&self.merged, &normalized).and_then(value_to_string)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: BTreeMap<String, String> = BTreeMap::new();
        flatten_value("", &self.merged, &mut entries);
        entries.into_iter().collect()
    }
}

/// Typed view of the keys scenarios care about.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessSettings {
    pub binary: PathBuf,
    pub default_args: Vec<String>,
    pub api_base_url: Option<String>,
    pub token: Option<String>,
    pub retries: u32,
    pub retry_factor: f64,
    pub retry_base_delay: Duration,
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
    pub building_sentinel: String,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("deploy"),
            default_args: Vec::new(),
            api_base_url: None,
            token: None,
            retries: 3,
            retry_factor: 1.0,
            retry_base_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(2),
            poll_deadline: Duration::from_secs(120),
            building_sentinel: DEFAULT_BUILDING_SENTINEL.to_string(),
        }
    }
}

impl HarnessSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let binary = non_empty(config.get("cli.binary"))
            .map(PathBuf::from)
            .unwrap_or(defaults.binary);
        let default_args = match non_empty(config.get("cli.args")) {
            Some(raw) => shell_words::split(&raw).map_err(|_| ConfigError::Invalid {
                key: "cli.args".to_string(),
                value: raw.clone(),
            })?,
            None => defaults.default_args,
        };
        let retry_factor = parse_or(config, "retry.factor", defaults.retry_factor)?;
        if !retry_factor.is_finite() || retry_factor < 1.0 {
            return Err(ConfigError::Invalid {
                key: "retry.factor".to_string(),
                value: retry_factor.to_string(),
            });
        }
        let poll_interval = millis_or(config, "poll.interval_ms", defaults.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "poll.interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            binary,
            default_args,
            api_base_url: non_empty(config.get("api.base_url"))
                .map(|url| url.trim_end_matches('/').to_string()),
            token: non_empty(config.get("api.token")),
            retries: parse_or(config, "retry.retries", defaults.retries)?,
            retry_factor,
            retry_base_delay: millis_or(config, "retry.base_delay_ms", defaults.retry_base_delay)?,
            poll_interval,
            poll_deadline: millis_or(config, "poll.deadline_ms", defaults.poll_deadline)?,
            building_sentinel: non_empty(config.get("deployment.building_sentinel"))
                .unwrap_or(defaults.building_sentinel),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_base_delay(self.retries, self.retry_factor, self.retry_base_delay)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<T: std::str::FromStr>(config: &Config, key: &str, default: T) -> Result<T, ConfigError> {
    let Some(raw) = non_empty(config.get(key)) else {
        return Ok(default);
    };
    raw.parse::<T>().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw,
    })
}

fn millis_or(config: &Config, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_or(config, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn config_paths(project_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = env::var("DEPLOY_HARNESS_DEFAULT_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            paths.push(path);
        }
    }

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            paths.push(global_path);
        }
    }

    if let Some(project_dir) = project_dir {
        let project_path = project_dir.join(PROJECT_CONFIG_NAME);
        if project_path.exists() {
            paths.push(project_path);
        }
    }

    paths
}

fn global_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("DEPLOY_HARNESS_GLOBAL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("deploy-harness").join("config.yaml"))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        // An empty file parses as null and must not wipe earlier layers.
        (base, Value::Null) => base,
        (_, overlay_value) => overlay_value,
    }
}

fn lookup_value<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in key.split('.') {
        let Value::Mapping(map) = current else {
            return None;
        };
        current = map
            .iter()
            .find(|(candidate, _)| {
                candidate
                    .as_str()
                    .is_some_and(|text| normalize_segment(text) == part)
            })
            .map(|(_, value)| value)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Null => Some(String::new()),
        Value::Sequence(values) => Some(
            values
                .iter()
                .map(|item| value_to_string(item).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Mapping(_) => None,
        Value::Tagged(tagged) => value_to_string(&tagged.value),
    }
}

fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, value) in map {
                let Some(key) = key.as_str() else {
                    continue;
                };
                let next_prefix = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_value(&next_prefix, value, out);
            }
        }
        _ => {
            if let Some(rendered) = value_to_string(value) {
                if !prefix.is_empty() {
                    out.insert(prefix.to_string(), rendered);
                }
            }
        }
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key_to_env(key))).ok()
}

fn key_to_env(key: &str) -> String {
    key.chars()
        .map(|ch| match ch {
            '.' | '-' => '_',
            _ => ch.to_ascii_uppercase(),
        })
        .collect()
}

fn normalize_key(key: &str) -> Option<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .split('.')
            .map(normalize_segment)
            .collect::<Vec<_>>()
            .join("."),
    )
}

fn normalize_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|ch| match ch {
            '-' => '_',
            _ => ch.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::test_support::EnvGuard;
    use proptest::prelude::*;
    use proptest::string::string_regex;

    const ENV_KEYS: [&str; 5] = [
        "DEPLOY_HARNESS_DEFAULT_CONFIG",
        "DEPLOY_HARNESS_GLOBAL_CONFIG",
        "DEPLOY_HARNESS_API_TOKEN",
        "DEPLOY_HARNESS_POLL_INTERVAL_MS",
        "DEPLOY_HARNESS_CLI_BINARY",
    ];

    #[test]
    fn load_merges_layers_in_order() {
        let guard = EnvGuard::new(&ENV_KEYS);
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        let global_path = temp.path().join("global.yaml");
        fs::write(
            &default_path,
            "cli:\n  binary: deploy\n  args: --debug\napi:\n  base_url: https://api.example.com/\n",
        )
        .unwrap();
        fs::write(&global_path, "cli:\n  binary: /opt/deploy/bin/deploy\n").unwrap();
        fs::write(
            temp.path().join(PROJECT_CONFIG_NAME),
            "poll:\n  interval_ms: 250\n",
        )
        .unwrap();
        guard.set("DEPLOY_HARNESS_DEFAULT_CONFIG", &default_path);
        guard.set("DEPLOY_HARNESS_GLOBAL_CONFIG", &global_path);

        let config = Config::load(Some(temp.path())).unwrap();

        assert_eq!(config.get("cli.binary").as_deref(), Some("/opt/deploy/bin/deploy"));
        assert_eq!(config.get("cli.args").as_deref(), Some("--debug"));
        assert_eq!(config.get("poll.interval-ms").as_deref(), Some("250"));
        assert_eq!(
            config.list(),
            vec![
                ("api.base_url".to_string(), "https://api.example.com/".to_string()),
                ("cli.args".to_string(), "--debug".to_string()),
                ("cli.binary".to_string(), "/opt/deploy/bin/deploy".to_string()),
                ("poll.interval_ms".to_string(), "250".to_string()),
            ]
        );
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let guard = EnvGuard::new(&ENV_KEYS);
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        fs::write(&default_path, "cli: [unclosed\n").unwrap();
        guard.set("DEPLOY_HARNESS_DEFAULT_CONFIG", &default_path);
        guard.set("DEPLOY_HARNESS_GLOBAL_CONFIG", temp.path().join("missing.yaml"));

        let err = Config::load(None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path == &default_path));
    }

    #[test]
    fn env_override_beats_file_values() {
        let guard = EnvGuard::new(&ENV_KEYS);
        guard.set("DEPLOY_HARNESS_API_TOKEN", "from-env");
        let config = Config::from_yaml("api:\n  token: from-file\n").unwrap();

        assert_eq!(config.get("api.token").as_deref(), Some("from-env"));
    }

    #[test]
    fn settings_resolve_typed_values() {
        let _guard = EnvGuard::new(&ENV_KEYS);
        let config = Config::from_yaml(
            "cli:\n  binary: ./target/debug/deploy\n  args: \"--scope 'my team' --yes\"\napi:\n  base_url: https://api.example.com/\n  token: secret\nretry:\n  retries: 5\n  factor: 2\n  base_delay_ms: 100\npoll:\n  interval_ms: 250\n  deadline_ms: 60000\ndeployment:\n  building_sentinel: Building...\n",
        )
        .unwrap();

        let settings = HarnessSettings::from_config(&config).unwrap();

        assert_eq!(settings.binary, PathBuf::from("./target/debug/deploy"));
        assert_eq!(settings.default_args, vec!["--scope", "my team", "--yes"]);
        assert_eq!(settings.api_base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(settings.token.as_deref(), Some("secret"));
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.poll_deadline, Duration::from_secs(60));
        assert_eq!(settings.building_sentinel, "Building...");
        let policy = settings.retry_policy();
        assert_eq!(policy.retries, 5);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(100),
                factor: 2.0,
                max: crate::retry::DEFAULT_MAX_DELAY,
            }
        );
    }

    #[test]
    fn settings_default_when_keys_missing() {
        let _guard = EnvGuard::new(&ENV_KEYS);
        let config = Config::from_yaml("{}").unwrap();
        let settings = HarnessSettings::from_config(&config).unwrap();
        assert_eq!(settings, HarnessSettings::default());
    }

    #[test]
    fn settings_reject_invalid_values() {
        let _guard = EnvGuard::new(&ENV_KEYS);
        let cases = [
            ("retry:\n  retries: many\n", "retry.retries"),
            ("retry:\n  factor: 0.5\n", "retry.factor"),
            ("poll:\n  interval_ms: 0\n", "poll.interval_ms"),
            ("cli:\n  args: \"--scope 'unterminated\"\n", "cli.args"),
        ];
        for (yaml, expected_key) in cases {
            let config = Config::from_yaml(yaml).unwrap();
            let err = HarnessSettings::from_config(&config).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Invalid { key, .. } if key == expected_key),
                "{} should be rejected, got {:?}",
                expected_key,
                err
            );
        }
    }

    #[test]
    fn empty_overlay_keeps_base() {
        let base: Value = serde_yaml::from_str("a:\n  b: 1\n").unwrap();
        let merged = merge_values(base.clone(), Value::Null);
        assert_eq!(merged, base);
    }

    fn key_segment_strategy() -> impl Strategy<Value = String> {
        string_regex("k[A-Za-z0-9_-]{0,7}").unwrap()
    }

    proptest! {
        #[test]
        fn merge_keeps_sibling_keys(
            left in key_segment_strategy(),
            right in key_segment_strategy(),
            base_value in 0i64..1000,
            overlay_value in 0i64..1000,
        ) {
            prop_assume!(normalize_segment(&left) != normalize_segment(&right));
            let base: Value = serde_yaml::from_str(&format!("root:\n  {}: {}\n", left, base_value)).unwrap();
            let overlay: Value = serde_yaml::from_str(&format!("root:\n  {}: {}\n", right, overlay_value)).unwrap();
            let config = Config { merged: merge_values(base, overlay) };

            prop_assert_eq!(config.get(&format!("root.{}", left)), Some(base_value.to_string()));
            prop_assert_eq!(config.get(&format!("root.{}", right)), Some(overlay_value.to_string()));
        }
    }
}
