use crate::compose::interpolate::{Environment, interpolate, interpolate_value};
use crate::compose::labels;
use crate::compose::model::{
    BuildSpec, ComposeFile, DEFAULT_NETWORK, Healthcheck, HealthcheckConfig, Mount, MountKind,
    NetworkConfig, PortBinding, PortEntry, Project, Service, ServiceConfig, StringOrList,
    VolumeConfig, VolumeEntry, parse_duration,
};
use crate::error::{Error, Result};
use crate::files::safe_join;
use crate::shared::{ProjectName, ServiceName};
use log::debug;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

const DOTENV: &str = ".env";

/// Loads compose files below a root directory.
#[derive(Debug, Clone)]
pub struct Loader {
    root: PathBuf,
}

impl Loader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads and resolves `file` (relative to the root). All problems found
    /// are reported together.
    pub fn load(&self, file: &str) -> Result<Project> {
        let mut errors = Vec::new();
        match self.resolve(file, &mut errors) {
            Some(project) if errors.is_empty() => Ok(project),
            _ => Err(Error::invalid(format!(
                "failed to load project {file}: {}",
                errors.join("; ")
            ))),
        }
    }

    /// Problems that would keep `file` from loading; empty when it is valid.
    pub fn validate(&self, file: &str) -> Vec<String> {
        let mut errors = Vec::new();
        self.resolve(file, &mut errors);
        errors
    }

    /// The variables a compose file in `dir` is interpolated with: the root
    /// `.env`, then the `.env` next to the file, then the process environment.
    pub fn environment(&self, dir: &Path) -> Result<Environment> {
        let mut env = Environment::new();
        let mut dotenv_files = vec![self.root.join(DOTENV)];
        if dir != self.root {
            dotenv_files.push(dir.join(DOTENV));
        }
        for path in dotenv_files {
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                for (key, value) in parse_dotenv(&content) {
                    let value = interpolate(&value, &env)?;
                    env.insert(key, value);
                }
                debug!("loaded {}", path.display());
            }
        }
        env.extend(std::env::vars());
        Ok(env)
    }

    fn resolve(&self, file: &str, errors: &mut Vec<String>) -> Option<Project> {
        let path = match safe_join(&self.root, file) {
            Ok(path) => path,
            Err(e) => {
                errors.push(e.to_string());
                return None;
            }
        };
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();

        let env = match self.environment(&dir) {
            Ok(env) => env,
            Err(e) => {
                errors.push(format!("failed to read environment: {e}"));
                return None;
            }
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                errors.push(format!("failed to read {file}: {e}"));
                return None;
            }
        };
        let mut document: Value = match serde_yaml::from_str(&content) {
            Ok(Value::Null) => Value::Mapping(Default::default()),
            Ok(document) => document,
            Err(e) => {
                errors.push(format!("{file} is not valid yaml: {e}"));
                return None;
            }
        };
        if let Err(e) = interpolate_value(&mut document, &env) {
            errors.push(e.to_string());
            return None;
        }
        let compose: ComposeFile = match serde_yaml::from_value(document) {
            Ok(compose) => compose,
            Err(e) => {
                errors.push(format!("{file}: {e}"));
                return None;
            }
        };

        let name = compose
            .name
            .clone()
            .or_else(|| env.get("COMPOSE_PROJECT_NAME").cloned())
            .or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .map(|n| normalize_project_name(&n))
            .unwrap_or_default();
        if name.is_empty() {
            errors.push(format!("cannot derive a project name for {file}"));
            return None;
        }

        let profiles = active_profiles(&env);
        let context = Context {
            project: ProjectName::new(name),
            dir,
            config_file: path,
            env,
            compose: &compose,
        };

        let mut services = BTreeMap::new();
        let mut disabled_services = Vec::new();
        for (service_name, config) in &compose.services {
            if !service_enabled(config, &profiles) {
                disabled_services.push(service_name.clone());
                continue;
            }
            if let Some(service) = context.service(service_name, config, errors) {
                services.insert(service_name.clone(), service);
            }
        }

        for service in services.values() {
            for dependency in &service.depends_on {
                if !services.contains_key(dependency) {
                    errors.push(format!(
                        "service {} depends on undefined or disabled service {dependency}",
                        service.name
                    ));
                }
            }
        }

        let mut networks: BTreeMap<String, NetworkConfig> = compose
            .networks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect();
        networks.entry(DEFAULT_NETWORK.to_string()).or_default();
        let volumes: BTreeMap<String, VolumeConfig> = compose
            .volumes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect();

        let project = Project {
            name: context.project,
            working_dir: context.dir,
            config_files: vec![context.config_file],
            services,
            disabled_services,
            networks,
            volumes,
        };
        if errors.is_empty()
            && let Err(e) = project.services_in_order(&[])
        {
            errors.push(e.to_string());
        }
        Some(project)
    }
}

struct Context<'a> {
    project: ProjectName,
    dir: PathBuf,
    config_file: PathBuf,
    env: Environment,
    compose: &'a ComposeFile,
}

impl Context<'_> {
    fn service(
        &self,
        name: &str,
        config: &ServiceConfig,
        errors: &mut Vec<String>,
    ) -> Option<Service> {
        let before = errors.len();

        let build = config.build.as_ref().map(|spec| self.build(spec));
        let image = match (&config.image, &build) {
            (Some(image), _) => image.clone(),
            (None, Some(_)) => format!("{}-{name}", self.project),
            (None, None) => {
                errors.push(format!("service {name} has neither an image nor a build context"));
                String::new()
            }
        };

        let mut args = |field: &str, value: &Option<StringOrList>| match value {
            Some(value) => match value.to_args() {
                Ok(args) => Some(args),
                Err(e) => {
                    errors.push(format!("service {name} {field}: {e}"));
                    None
                }
            },
            None => None,
        };
        let command = args("command", &config.command);
        let entrypoint = args("entrypoint", &config.entrypoint);

        let environment = self.service_environment(name, config, errors);
        let mut mounts = Vec::new();
        for entry in &config.volumes {
            match self.mount(entry) {
                Ok(mount) => mounts.push(mount),
                Err(e) => errors.push(format!("service {name}: {e}")),
            }
        }
        let mut ports = Vec::new();
        for entry in &config.ports {
            match parse_port(entry) {
                Ok(mut bindings) => ports.append(&mut bindings),
                Err(e) => errors.push(format!("service {name}: {e}")),
            }
        }

        let networks = match (&config.networks, &config.network_mode) {
            (Some(networks), _) => networks.resolve(),
            (None, Some(_)) => BTreeMap::new(),
            (None, None) => BTreeMap::from([(DEFAULT_NETWORK.to_string(), vec![])]),
        };
        for network in networks.keys() {
            if network != DEFAULT_NETWORK && !self.compose.networks.contains_key(network) {
                errors.push(format!("service {name} refers to undefined network {network}"));
            }
        }

        let healthcheck = match config.healthcheck.as_ref().map(healthcheck) {
            Some(Ok(check)) => Some(check),
            Some(Err(e)) => {
                errors.push(format!("service {name} healthcheck: {e}"));
                None
            }
            None => None,
        };

        let mut service_labels: BTreeMap<String, String> = config
            .labels
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect();
        service_labels.extend(self.compose_labels(name));

        if errors.len() > before {
            return None;
        }
        Some(Service {
            name: ServiceName::new(name),
            image,
            build,
            container_name: config.container_name.clone(),
            command,
            entrypoint,
            environment,
            labels: service_labels,
            mounts,
            ports,
            depends_on: config.depends_on.names(),
            networks,
            network_mode: config.network_mode.clone(),
            restart: config.restart.clone(),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            hostname: config.hostname.clone(),
            tty: config.tty,
            stdin_open: config.stdin_open,
            privileged: config.privileged,
            extra_hosts: config.extra_hosts.clone(),
            cap_add: config.cap_add.clone(),
            cap_drop: config.cap_drop.clone(),
            healthcheck,
            pull_policy: config.pull_policy.clone(),
        })
    }

    fn compose_labels(&self, service: &str) -> [(String, String); 6] {
        [
            (labels::PROJECT.to_string(), self.project.to_string()),
            (labels::SERVICE.to_string(), service.to_string()),
            (labels::VERSION.to_string(), labels::COMPOSE_VERSION.to_string()),
            (
                labels::WORKING_DIR.to_string(),
                self.dir.to_string_lossy().into_owned(),
            ),
            (
                labels::CONFIG_FILES.to_string(),
                self.config_file.to_string_lossy().into_owned(),
            ),
            (labels::ONEOFF.to_string(), "False".to_string()),
        ]
    }

    fn build(&self, spec: &BuildSpec) -> crate::compose::model::Build {
        let (context, dockerfile, args, target) = match spec {
            BuildSpec::Context(context) => (context.clone(), None, Default::default(), None),
            BuildSpec::Full(config) => (
                config.context.clone().unwrap_or_else(|| ".".to_string()),
                config.dockerfile.clone(),
                config.args.clone(),
                config.target.clone(),
            ),
        };
        crate::compose::model::Build {
            context: self.host_path(&context),
            dockerfile: dockerfile.unwrap_or_else(|| "Dockerfile".to_string()),
            args: args
                .entries()
                .into_iter()
                .filter_map(|(k, v)| {
                    let value = v.or_else(|| self.env.get(&k).cloned())?;
                    Some((k, value))
                })
                .collect(),
            target,
        }
    }

    fn service_environment(
        &self,
        name: &str,
        config: &ServiceConfig,
        errors: &mut Vec<String>,
    ) -> BTreeMap<String, String> {
        let mut environment = BTreeMap::new();
        for env_file in config.env_file.iter().flat_map(StringOrList::to_vec) {
            let path = self.host_path(&env_file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    for (key, value) in parse_dotenv(&content) {
                        match interpolate(&value, &self.env) {
                            Ok(value) => {
                                environment.insert(key, value);
                            }
                            Err(e) => errors.push(format!("service {name} env_file: {e}")),
                        }
                    }
                }
                Err(e) => errors.push(format!(
                    "service {name}: env file {} cannot be read: {e}",
                    path.display()
                )),
            }
        }
        for (key, value) in config.environment.entries() {
            match value.or_else(|| self.env.get(&key).cloned()) {
                Some(value) => {
                    environment.insert(key, value);
                }
                None => {
                    environment.remove(&key);
                }
            }
        }
        environment
    }

    /// Resolves a host path of the file against the file's directory.
    fn host_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return normalize(&home.join(rest));
        }
        normalize(&self.dir.join(path))
    }

    fn mount(&self, entry: &VolumeEntry) -> Result<Mount> {
        let (kind, source, target, read_only) = match entry {
            VolumeEntry::Short(spec) => {
                let parts: Vec<&str> = spec.split(':').collect();
                match parts.as_slice() {
                    [target] => (None, None, target.to_string(), false),
                    [source, target] => (None, Some(source.to_string()), target.to_string(), false),
                    [source, target, mode] => (
                        None,
                        Some(source.to_string()),
                        target.to_string(),
                        mode.split(',').any(|m| m == "ro"),
                    ),
                    _ => return Err(Error::invalid(format!("invalid volume {spec:?}"))),
                }
            }
            VolumeEntry::Long(long) => (
                long.kind.clone(),
                long.source.clone(),
                long.target.clone(),
                long.read_only,
            ),
        };
        if target.is_empty() {
            return Err(Error::invalid("volume without a target".to_string()));
        }

        let kind = match kind.as_deref() {
            Some("bind") => MountKind::Bind,
            Some("volume") => MountKind::Volume,
            Some("tmpfs") => MountKind::Tmpfs,
            Some(other) => {
                return Err(Error::invalid(format!("unsupported volume type {other}")));
            }
            None => match &source {
                Some(s) if s.starts_with(['/', '.', '~']) => MountKind::Bind,
                _ => MountKind::Volume,
            },
        };

        let source = match (kind, source) {
            (MountKind::Bind, Some(source)) => self.host_path(&source).to_string_lossy().into_owned(),
            (MountKind::Bind, None) => {
                return Err(Error::invalid(format!("bind mount {target} has no source")));
            }
            (MountKind::Volume, Some(source)) => {
                if !self.compose.volumes.contains_key(&source) {
                    return Err(Error::invalid(format!("refers to undefined volume {source}")));
                }
                source
            }
            (MountKind::Volume, None) | (MountKind::Tmpfs, _) => String::new(),
        };
        Ok(Mount {
            kind,
            source,
            target,
            read_only,
        })
    }
}

fn healthcheck(config: &HealthcheckConfig) -> Result<Healthcheck> {
    let duration = |value: &Option<String>| value.as_deref().map(parse_duration).transpose();
    let test = if config.disable {
        vec!["NONE".to_string()]
    } else {
        match &config.test {
            Some(StringOrList::String(cmd)) => vec!["CMD-SHELL".to_string(), cmd.clone()],
            Some(StringOrList::List(list)) => list.clone(),
            None => vec![],
        }
    };
    Ok(Healthcheck {
        test,
        interval: duration(&config.interval)?,
        timeout: duration(&config.timeout)?,
        start_period: duration(&config.start_period)?,
        retries: config.retries,
    })
}

fn parse_port_number(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::invalid(format!("invalid port {value:?}")))
}

/// `a` or `a-b`, inclusive.
fn parse_port_range(value: &str) -> Result<Vec<u16>> {
    match value.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse_port_number(start)?, parse_port_number(end)?);
            if start > end {
                return Err(Error::invalid(format!("invalid port range {value:?}")));
            }
            Ok((start..=end).collect())
        }
        None => Ok(vec![parse_port_number(value)?]),
    }
}

pub fn parse_port(entry: &PortEntry) -> Result<Vec<PortBinding>> {
    match entry {
        PortEntry::Number(target) => Ok(vec![PortBinding {
            host_ip: None,
            published: None,
            target: *target,
            protocol: "tcp".to_string(),
        }]),
        PortEntry::Long(long) => {
            let published = match &long.published {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => Some(parse_port_number(&n.to_string())?),
                Some(Value::String(s)) => Some(parse_port_number(s)?),
                Some(other) => {
                    return Err(Error::invalid(format!("invalid published port {other:?}")));
                }
            };
            Ok(vec![PortBinding {
                host_ip: long.host_ip.clone(),
                published,
                target: long.target,
                protocol: long.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
            }])
        }
        PortEntry::Short(spec) => {
            let (spec_ports, protocol) = match spec.rsplit_once('/') {
                Some((ports, protocol)) => (ports, protocol.to_string()),
                None => (spec.as_str(), "tcp".to_string()),
            };
            let (host_ip, rest) = if let Some(bracketed) = spec_ports.strip_prefix('[') {
                let (ip, rest) = bracketed
                    .split_once("]:")
                    .ok_or_else(|| Error::invalid(format!("invalid port {spec:?}")))?;
                (Some(ip.to_string()), rest)
            } else {
                match spec_ports.matches(':').count() {
                    2 => {
                        let (ip, rest) = spec_ports
                            .split_once(':')
                            .ok_or_else(|| Error::invalid(format!("invalid port {spec:?}")))?;
                        (Some(ip.to_string()), rest)
                    }
                    0 | 1 => (None, spec_ports),
                    _ => return Err(Error::invalid(format!("invalid port {spec:?}"))),
                }
            };

            let (published, target) = match rest.rsplit_once(':') {
                Some(("", target)) => (None, target),
                Some((published, target)) => (Some(published), target),
                None => (None, rest),
            };
            let targets = parse_port_range(target)?;
            let published = published.map(parse_port_range).transpose()?;
            if let Some(published) = &published
                && published.len() != targets.len()
                && published.len() != 1
            {
                return Err(Error::invalid(format!("port ranges of {spec:?} differ in size")));
            }

            Ok(targets
                .iter()
                .enumerate()
                .map(|(i, target)| PortBinding {
                    host_ip: host_ip.clone(),
                    published: published
                        .as_ref()
                        .map(|p| if p.len() == 1 { p[0] } else { p[i] }),
                    target: *target,
                    protocol: protocol.clone(),
                })
                .collect())
        }
    }
}

/// Parses `KEY=value` lines. Supports comments, `export` prefixes and single
/// or double quoted values.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = if let Some(inner) = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
            {
                inner.replace("\\n", "\n").replace("\\\"", "\"")
            } else if let Some(inner) = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
            {
                inner.to_string()
            } else {
                match value.find(" #") {
                    Some(pos) => value[..pos].trim_end().to_string(),
                    None => value.to_string(),
                }
            };
            Some((key.to_string(), value))
        })
        .collect()
}

fn active_profiles(env: &Environment) -> BTreeSet<String> {
    env.get("COMPOSE_PROFILES")
        .map(|p| {
            p.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn service_enabled(config: &ServiceConfig, profiles: &BTreeSet<String>) -> bool {
    config.profiles.is_empty()
        || profiles.contains("*")
        || config.profiles.iter().any(|p| profiles.contains(p))
}

/// Lower case, `[a-z0-9_-]` only, starting with a letter or digit.
pub fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect::<String>()
        .trim_start_matches(['_', '-'])
        .to_string()
}

/// Removes `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
