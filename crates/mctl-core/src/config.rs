//! YAML configuration schema and directory loader.
//!
//! Two workload file shapes are accepted: a single spec object, or a
//! `{workloads: [...]}` list. Unknown fields are rejected. Before parsing,
//! `${VAR}` references are substituted from a shared `vars.yaml` in the
//! config directory and from process environment variables (the vars file
//! wins).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{RunMode, WorkloadSpec, WorkloadType};

/// Configuration loading or validation failure. Fatal to the load attempt,
/// never to a running daemon.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: invalid YAML: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("duplicate workload name '{name}' in {path}")]
    DuplicateName { name: String, path: PathBuf },
}

impl ConfigError {
    fn invalid(path: &Path, message: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkloadDoc {
    name: String,
    #[serde(rename = "type")]
    workload_type: WorkloadType,
    run_mode: RunMode,
    module: String,
    #[serde(default = "default_entry_point")]
    entry_point: String,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    max_runs: Option<u32>,
    #[serde(default = "default_restart_delay_s")]
    restart_delay_s: f64,
    #[serde(default)]
    timeout_s: Option<f64>,
    #[serde(default)]
    memory_limit_mb: Option<u64>,
    #[serde(default)]
    cpu_nice: Option<i32>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

fn default_entry_point() -> String {
    "run".to_string()
}

fn default_restart_delay_s() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MultiWorkloadDoc {
    workloads: Vec<WorkloadDoc>,
}

impl WorkloadDoc {
    fn into_spec(self, path: &Path) -> Result<WorkloadSpec, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid(path, "'name' must not be empty"));
        }
        match self.run_mode {
            RunMode::Schedule => {
                let expr = self.schedule.as_deref().unwrap_or("");
                if expr.is_empty() {
                    return Err(ConfigError::invalid(
                        path,
                        "'schedule' is required when run_mode is 'schedule'",
                    ));
                }
                // The cron crate expects a seconds field; operators write
                // classic five-field expressions.
                let with_seconds = format!("0 {expr}");
                if cron::Schedule::from_str(&with_seconds).is_err() {
                    return Err(ConfigError::invalid(
                        path,
                        format!("invalid cron expression '{expr}'"),
                    ));
                }
            }
            RunMode::NTimes => match self.max_runs {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(ConfigError::invalid(
                        path,
                        "'max_runs' must be a positive integer when run_mode is 'n_times'",
                    ))
                }
            },
            RunMode::Forever => {}
        }
        if let Some(limit) = self.memory_limit_mb {
            if limit == 0 {
                return Err(ConfigError::invalid(
                    path,
                    "'memory_limit_mb' must be a positive integer",
                ));
            }
        }
        if let Some(nice) = self.cpu_nice {
            if !(-20..=19).contains(&nice) {
                return Err(ConfigError::invalid(
                    path,
                    "'cpu_nice' must be between -20 and 19",
                ));
            }
        }
        if self.restart_delay_s < 0.0 {
            return Err(ConfigError::invalid(
                path,
                "'restart_delay_s' must not be negative",
            ));
        }
        if let Some(timeout) = self.timeout_s {
            if timeout <= 0.0 {
                return Err(ConfigError::invalid(path, "'timeout_s' must be positive"));
            }
        }
        Ok(WorkloadSpec {
            name: self.name,
            workload_type: self.workload_type,
            run_mode: self.run_mode,
            module: self.module,
            entry_point: self.entry_point,
            params: self.params,
            version: self.version,
            schedule: self.schedule,
            max_runs: self.max_runs,
            restart_delay_s: self.restart_delay_s,
            timeout_s: self.timeout_s,
            memory_limit_mb: self.memory_limit_mb,
            cpu_nice: self.cpu_nice,
            tags: self.tags,
        })
    }
}

/// Fleet communication settings for device daemons.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct FleetConfig {
    pub enabled: bool,
    pub client_name: Option<String>,
    pub api_host: String,
    pub api_port: u16,
    pub central_api_url: Option<String>,
    pub heartbeat_interval_s: f64,
    pub api_token: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_name: None,
            api_host: "0.0.0.0".to_string(),
            api_port: 9100,
            central_api_url: None,
            heartbeat_interval_s: 30.0,
            api_token: None,
        }
    }
}

/// Central controller settings (operator host only).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CentralConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub inventory_path: String,
    pub api_token: Option<String>,
    pub stale_threshold_s: f64,
    pub deploy_script_path: Option<String>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8080,
            db_path: "./fleet.db".to_string(),
            inventory_path: "./inventory.yaml".to_string(),
            api_token: None,
            stale_threshold_s: 90.0,
            deploy_script_path: None,
        }
    }
}

/// Top-level `daemon.yaml` contents.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    pub fleet: FleetConfig,
    pub central: CentralConfig,
}

/// Reads workload YAML files from a directory and validates them.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

const DAEMON_CONFIG_NAMES: [&str; 2] = ["daemon.yaml", "daemon.yml"];
const RESERVED_NAMES: [&str; 6] = [
    "daemon.yaml",
    "daemon.yml",
    "inventory.yaml",
    "inventory.yml",
    "vars.yaml",
    "vars.yml",
];

impl ConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Loads every workload file in the directory, enforcing name
    /// uniqueness across the whole set.
    pub fn load_all(&self) -> Result<Vec<WorkloadSpec>, ConfigError> {
        if !self.config_dir.is_dir() {
            return Err(ConfigError::invalid(
                &self.config_dir,
                "config directory does not exist",
            ));
        }
        let vars = self.load_vars()?;

        let mut paths = Vec::new();
        collect_yaml_files(&self.config_dir, &mut paths)?;
        paths.sort();

        let mut specs: Vec<WorkloadSpec> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if RESERVED_NAMES.contains(&file_name.as_str()) {
                continue;
            }
            for spec in self.load_file(&path, &vars)? {
                if !seen.insert(spec.name.clone()) {
                    return Err(ConfigError::DuplicateName {
                        name: spec.name,
                        path,
                    });
                }
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Loads and validates a single workload file.
    pub fn load_file(
        &self,
        path: &Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<WorkloadSpec>, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let rendered = substitute_vars(&raw, vars)
            .map_err(|message| ConfigError::invalid(path, message))?;

        let value: serde_yaml::Value =
            serde_yaml::from_str(&rendered).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let mapping = value
            .as_mapping()
            .ok_or_else(|| ConfigError::invalid(path, "expected a YAML mapping at top level"))?;

        let workloads_key = serde_yaml::Value::String("workloads".to_string());
        let docs: Vec<WorkloadDoc> = if mapping.contains_key(&workloads_key) {
            let multi: MultiWorkloadDoc =
                serde_yaml::from_value(value.clone()).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?;
            multi.workloads
        } else {
            let single: WorkloadDoc =
                serde_yaml::from_value(value.clone()).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?;
            vec![single]
        };

        docs.into_iter().map(|doc| doc.into_spec(path)).collect()
    }

    /// Loads `daemon.yaml` from the config directory, falling back to
    /// defaults when absent.
    pub fn load_daemon_config(&self) -> Result<DaemonConfig, ConfigError> {
        for name in DAEMON_CONFIG_NAMES {
            let path = self.config_dir.join(name);
            if path.exists() {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                if raw.trim().is_empty() {
                    return Ok(DaemonConfig::default());
                }
                return serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                    path,
                    source,
                });
            }
        }
        Ok(DaemonConfig::default())
    }

    /// Shared substitution variables: `vars.yaml` merged over the process
    /// environment.
    fn load_vars(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut vars: BTreeMap<String, String> = std::env::vars().collect();
        for name in ["vars.yaml", "vars.yml"] {
            let path = self.config_dir.join(name);
            if path.exists() {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let file_vars: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&raw)
                    .map_err(|source| ConfigError::Yaml { path, source })?;
                for (key, value) in file_vars {
                    let rendered = match value {
                        serde_yaml::Value::String(s) => s,
                        other => serde_yaml::to_string(&other)
                            .unwrap_or_default()
                            .trim_end()
                            .to_string(),
                    };
                    vars.insert(key, rendered);
                }
                break;
            }
        }
        Ok(vars)
    }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

/// Replaces `${NAME}` references. Unknown names are an error so a typo
/// cannot silently produce an empty value.
fn substitute_vars(raw: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err("unterminated '${' variable reference".to_string());
        };
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(format!("unknown variable '${{{name}}}'")),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn loads_single_and_multi_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "collector.yaml",
            "name: collector\ntype: service\nrun_mode: forever\nmodule: demo.ticker_service\n",
        );
        write(
            dir.path(),
            "batch.yaml",
            concat!(
                "workloads:\n",
                "  - name: counter\n",
                "    type: script\n",
                "    run_mode: n_times\n",
                "    max_runs: 3\n",
                "    module: demo.counter_script\n",
                "  - name: tick\n",
                "    type: agent\n",
                "    run_mode: schedule\n",
                "    schedule: '*/5 * * * *'\n",
                "    module: demo.heartbeat_agent\n",
            ),
        );

        let specs = ConfigLoader::new(dir.path()).load_all().unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["counter", "tick", "collector"]);
        assert_eq!(specs[0].max_runs, Some(3));
        assert_eq!(specs[2].entry_point, "run");
        assert_eq!(specs[2].restart_delay_s, 5.0);
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bad.yaml",
            "name: x\ntype: script\nrun_mode: forever\nmodule: m\nbogus_field: 1\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }), "{err}");
    }

    #[test]
    fn schedule_mode_requires_valid_cron() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "sched.yaml",
            "name: x\ntype: agent\nrun_mode: schedule\nmodule: m\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("'schedule' is required"));

        write(
            dir.path(),
            "sched.yaml",
            "name: x\ntype: agent\nrun_mode: schedule\nschedule: 'not cron'\nmodule: m\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn n_times_requires_positive_max_runs() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "n.yaml",
            "name: x\ntype: script\nrun_mode: n_times\nmax_runs: 0\nmodule: m\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("max_runs"));
    }

    #[test]
    fn cpu_nice_range_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "nice.yaml",
            "name: x\ntype: script\nrun_mode: forever\nmodule: m\ncpu_nice: 20\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("cpu_nice"));
    }

    #[test]
    fn duplicate_names_across_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = "name: dup\ntype: script\nrun_mode: forever\nmodule: m\n";
        write(dir.path(), "a.yaml", spec);
        write(dir.path(), "b.yaml", spec);
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
    }

    #[test]
    fn vars_file_substitution_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "vars.yaml", "REGION: eu-west\n");
        write(
            dir.path(),
            "w.yaml",
            concat!(
                "name: uploader\n",
                "type: agent\n",
                "run_mode: forever\n",
                "module: m\n",
                "params:\n",
                "  region: ${REGION}\n",
            ),
        );
        let specs = ConfigLoader::new(dir.path()).load_all().unwrap();
        assert_eq!(
            specs[0].params.get("region"),
            Some(&serde_json::Value::String("eu-west".to_string()))
        );
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "w.yaml",
            "name: x\ntype: agent\nrun_mode: forever\nmodule: ${NO_SUCH_VAR_SET}\n",
        );
        let err = ConfigLoader::new(dir.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("unknown variable"));
    }

    #[test]
    fn daemon_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigLoader::new(dir.path()).load_daemon_config().unwrap();
        assert!(!cfg.fleet.enabled);
        assert_eq!(cfg.fleet.api_port, 9100);
        assert_eq!(cfg.central.stale_threshold_s, 90.0);
    }

    #[test]
    fn daemon_config_sections_parse() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "daemon.yaml",
            concat!(
                "fleet:\n",
                "  enabled: true\n",
                "  client_name: edge-01\n",
                "  central_api_url: http://controller:8080\n",
                "central:\n",
                "  enabled: true\n",
                "  port: 8090\n",
            ),
        );
        let cfg = ConfigLoader::new(dir.path()).load_daemon_config().unwrap();
        assert!(cfg.fleet.enabled);
        assert_eq!(cfg.fleet.client_name.as_deref(), Some("edge-01"));
        assert_eq!(cfg.central.port, 8090);
        assert_eq!(cfg.central.host, "0.0.0.0");
    }
}
