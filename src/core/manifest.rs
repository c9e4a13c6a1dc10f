//! Manifest store - Global registry and per-app descriptors
//!
//! The registry is read once at boot and never mutated afterwards. Every
//! optional manifest field gets its default here, so the supervisor only
//! ever sees fully-populated descriptors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::ManifestError;
use crate::platform::Signal;

pub const DEFAULT_PRIORITY: u32 = 50;
pub const MIN_PRIORITY: u32 = 10;
pub const MAX_PRIORITY: u32 = 90;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";
pub const DEFAULT_HEALTH_PORT: u16 = 8000;
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Kind of application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Webapp,
    #[default]
    Service,
}

/// How to launch an app
#[derive(Debug, Clone)]
pub struct StartupSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Relative to the app bundle; the bundle itself when absent
    pub working_dir: Option<PathBuf>,
    pub priority: u32,
}

/// How to stop an app
#[derive(Debug, Clone)]
pub struct ShutdownSpec {
    pub timeout: Duration,
    pub signal: Signal,
}

impl Default for ShutdownSpec {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            signal: Signal::Term,
        }
    }
}

/// The probe to run, carrying only the parameters it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    Http {
        port: u16,
        endpoint: String,
        expected_status: u16,
    },
    Tcp {
        port: u16,
    },
    Process,
    Script {
        command: PathBuf,
        args: Vec<String>,
    },
}

impl HealthCheck {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Tcp { .. } => "tcp",
            Self::Process => "process",
            Self::Script { .. } => "script",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSpec {
    pub check: HealthCheck,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            check: HealthCheck::Process,
            interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
        }
    }
}

/// Config template seeded into the app's config dir on first run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    /// Relative to the app bundle
    pub source: PathBuf,
    /// Relative to the app's config dir
    pub dest: PathBuf,
}

/// Immutable description of one application
#[derive(Debug, Clone)]
pub struct AppDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub kind: AppKind,
    pub port: Option<u16>,
    pub url_path: Option<String>,
    pub startup: StartupSpec,
    pub shutdown: ShutdownSpec,
    pub health: HealthSpec,
    pub data_dirs: Vec<PathBuf>,
    pub config_files: Vec<ConfigFile>,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl AppDescriptor {
    /// Minimal descriptor, mostly useful for building registries by hand
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>, priority: u32) -> Self {
        Self {
            name: name.into(),
            version: "unknown".to_string(),
            description: String::new(),
            kind: AppKind::Service,
            port: None,
            url_path: None,
            startup: StartupSpec {
                command: command.into(),
                args: Vec::new(),
                working_dir: None,
                priority,
            },
            shutdown: ShutdownSpec::default(),
            health: HealthSpec::default(),
            data_dirs: Vec::new(),
            config_files: Vec::new(),
            env: BTreeMap::new(),
            log_file: None,
        }
    }

    pub fn with_health(mut self, health: HealthSpec) -> Self {
        self.health = health;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSpec) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.startup.args = args;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = (port != 0).then_some(port);
        self
    }
}

// ---- on-disk shapes -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawGlobalManifest {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    apps: Vec<RawAppEntry>,
    #[serde(default)]
    startup_order: Vec<String>,
}

/// Legacy manifests list bare names; newer ones carry summaries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAppEntry {
    Name(String),
    Summary {
        name: String,
        #[serde(default)]
        port: u16,
        #[serde(rename = "type", default)]
        kind: Option<AppKind>,
    },
}

impl RawAppEntry {
    fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Summary { name, .. } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAppManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    kind: Option<AppKind>,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    path: Option<String>,
    startup: RawStartup,
    #[serde(default)]
    shutdown: RawShutdown,
    #[serde(default)]
    health: Option<RawHealth>,
    #[serde(default)]
    data_dirs: Vec<PathBuf>,
    #[serde(default)]
    config_files: Vec<ConfigFile>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Deserialize)]
struct RawStartup {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, alias = "working_directory")]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    priority: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawShutdown {
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    signal: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawHealthKind {
    Http,
    Tcp,
    #[default]
    Process,
    Script,
}

#[derive(Debug, Deserialize)]
struct RawHealth {
    #[serde(rename = "type", default)]
    kind: RawHealthKind,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    expected_status: Option<u16>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    command: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    #[serde(default)]
    file: Option<PathBuf>,
}

// ---- registry --------------------------------------------------------------

/// Startup order plus descriptors, read-only after load
#[derive(Debug, Default)]
pub struct Registry {
    version: Option<String>,
    order: Vec<String>,
    apps: HashMap<String, AppDescriptor>,
}

impl Registry {
    /// Load the global manifest and the per-app manifests next to it
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            warn!("Global manifest not found: {}", path.display());
            return Ok(Self::default());
        }

        let global: RawGlobalManifest = read_json(path)?;
        let bundle_dir = path.parent().unwrap_or_else(|| Path::new("/"));

        let mut descriptors = Vec::with_capacity(global.apps.len());
        let mut seen = HashSet::new();
        for entry in &global.apps {
            let name = entry.name();
            validate_name(name)?;
            if !seen.insert(name.to_string()) {
                return Err(ManifestError::Duplicate(name.to_string()));
            }

            let manifest_path = bundle_dir.join(name).join("manifest.json");
            if !manifest_path.exists() {
                return Err(ManifestError::MissingAppManifest(name.to_string()));
            }
            let raw: RawAppManifest = read_json(&manifest_path)?;
            let descriptor = build_descriptor(entry, raw)?;
            debug!("Loaded app manifest {}", manifest_path.display());
            descriptors.push(descriptor);
        }

        let mut registry = Self::from_descriptors(descriptors, &global.startup_order)?;
        registry.version = global.version;
        info!(
            "Loaded manifest {}: {} app(s), startup order {:?}",
            path.display(),
            registry.len(),
            registry.order
        );
        Ok(registry)
    }

    /// Build a registry from already-parsed descriptors.
    ///
    /// Apps named in `startup_order` start first, exactly as listed. The rest
    /// follow sorted by priority, then by name.
    pub fn from_descriptors(
        descriptors: Vec<AppDescriptor>,
        startup_order: &[String],
    ) -> Result<Self, ManifestError> {
        let mut apps = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            validate_name(&descriptor.name)?;
            validate_priority(&descriptor.name, descriptor.startup.priority)?;
            let name = descriptor.name.clone();
            if apps.insert(name.clone(), descriptor).is_some() {
                return Err(ManifestError::Duplicate(name));
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(apps.len());
        for name in startup_order {
            if !apps.contains_key(name) {
                return Err(ManifestError::UnknownStartupEntry(name.clone()));
            }
            if order.contains(name) {
                return Err(ManifestError::Duplicate(name.clone()));
            }
            order.push(name.clone());
        }

        let priority = |name: &String| apps[name].startup.priority;
        if order.windows(2).any(|pair| priority(&pair[0]) > priority(&pair[1])) {
            warn!(
                "startup_order {:?} is not sorted by priority, keeping it as declared",
                startup_order
            );
        }

        let mut rest: Vec<String> = apps
            .keys()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        rest.sort_by(|a, b| priority(a).cmp(&priority(b)).then_with(|| a.cmp(b)));
        order.extend(rest);

        Ok(Self {
            version: None,
            order,
            apps,
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.get(name)
    }

    /// App names in startup order
    pub fn startup_order(&self) -> &[String] {
        &self.order
    }

    /// Descriptors in startup order
    pub fn iter(&self) -> impl Iterator<Item = &AppDescriptor> {
        self.order.iter().map(move |name| &self.apps[name])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Lowercase alphanumerics and hyphens, not starting with a hyphen
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn validate_name(name: &str) -> Result<(), ManifestError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ManifestError::InvalidName(name.to_string()))
    }
}

fn validate_priority(name: &str, priority: u32) -> Result<(), ManifestError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(ManifestError::InvalidPriority {
            name: name.to_string(),
            priority,
        })
    }
}

fn build_descriptor(entry: &RawAppEntry, raw: RawAppManifest) -> Result<AppDescriptor, ManifestError> {
    let name = entry.name().to_string();
    if let Some(found) = raw.name.as_deref() {
        if found != name {
            return Err(ManifestError::NameMismatch {
                name,
                found: found.to_string(),
            });
        }
    }

    // The per-app manifest wins; the global summary fills the gaps.
    let (global_port, global_kind) = match entry {
        RawAppEntry::Name(_) => (0, None),
        RawAppEntry::Summary { port, kind, .. } => (*port, *kind),
    };
    let port = if raw.port != 0 { raw.port } else { global_port };
    let port = (port != 0).then_some(port);
    let kind = raw.kind.or(global_kind).unwrap_or_default();

    if raw.startup.command.trim().is_empty() {
        return Err(ManifestError::MissingCommand(name));
    }
    let priority = raw.startup.priority.unwrap_or(DEFAULT_PRIORITY);
    validate_priority(&name, priority)?;

    let signal = match raw.shutdown.signal.as_deref() {
        Some(signal) => signal
            .parse::<Signal>()
            .map_err(|signal| ManifestError::InvalidSignal {
                name: name.clone(),
                signal,
            })?,
        None => Signal::Term,
    };
    let shutdown = ShutdownSpec {
        timeout: Duration::from_secs(
            raw.shutdown
                .timeout
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        ),
        signal,
    };

    let health = match raw.health {
        Some(health) => build_health(&name, port, health)?,
        None => HealthSpec::default(),
    };

    Ok(AppDescriptor {
        version: raw.version.unwrap_or_else(|| "unknown".to_string()),
        description: raw.description,
        kind,
        port,
        url_path: raw.path,
        startup: StartupSpec {
            command: PathBuf::from(raw.startup.command),
            args: raw.startup.args,
            working_dir: raw.startup.working_dir,
            priority,
        },
        shutdown,
        health,
        data_dirs: raw.data_dirs,
        config_files: raw.config_files,
        env: raw.env,
        log_file: raw.logging.file,
        name,
    })
}

fn build_health(name: &str, app_port: Option<u16>, raw: RawHealth) -> Result<HealthSpec, ManifestError> {
    let port = raw
        .port
        .filter(|port| *port != 0)
        .or(app_port)
        .unwrap_or(DEFAULT_HEALTH_PORT);

    let check = match raw.kind {
        RawHealthKind::Http => HealthCheck::Http {
            port,
            endpoint: normalize_endpoint(raw.endpoint.as_deref()),
            expected_status: raw.expected_status.unwrap_or(DEFAULT_EXPECTED_STATUS),
        },
        RawHealthKind::Tcp => HealthCheck::Tcp { port },
        RawHealthKind::Process => HealthCheck::Process,
        RawHealthKind::Script => HealthCheck::Script {
            command: raw
                .command
                .filter(|command| !command.as_os_str().is_empty())
                .ok_or_else(|| ManifestError::MissingHealthCommand(name.to_string()))?,
            args: raw.args,
        },
    };

    Ok(HealthSpec {
        check,
        interval: Duration::from_secs(
            raw.interval
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
        ),
        timeout: Duration::from_secs(
            raw.timeout
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
        ),
    })
}

fn normalize_endpoint(endpoint: Option<&str>) -> String {
    match endpoint {
        None | Some("") => DEFAULT_HEALTH_ENDPOINT.to_string(),
        Some(path) if path.starts_with('/') => path.to_string(),
        Some(path) => format!("/{}", path),
    }
}
