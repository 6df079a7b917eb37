//! Typed configuration for every resource kind.
//!
//! Definitions ([`ServiceUnit`] and friends) hold [`Value`]s that may still
//! be pending while the blueprint is assembled. Right before a resource is
//! submitted its definition is resolved into [`Properties`], which is what the
//! [`Provisioner`](crate::Provisioner) receives.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};

use crate::core::{ArcStr, Kind};
use crate::error::ValueError;
use crate::registry::ResourceHandle;
use crate::secret::SecretEntry;
use crate::value::{OutputRef, Value};

/// Restart behaviour requested for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub internal: u16,
    pub external: Option<u16>,
    pub protocol: Protocol,
}

/// Health probe intent. The orchestrator passes it through to the
/// provisioner untouched, running and retrying it is up to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthProbe {
    /// The probe in exec form, e.g. `["CMD", "pg_isready", "-U", "postgres"]`.
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl HealthProbe {
    /// Runs `args` directly, success is a zero exit status.
    pub fn cmd<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let test = std::iter::once("CMD".to_string())
            .chain(args.into_iter().map(Into::into))
            .collect();

        Self::from_test(test)
    }

    /// Runs `script` through the shell of the container.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_test(vec!["CMD-SHELL".to_string(), script.into()])
    }

    fn from_test(test: Vec<String>) -> Self {
        Self {
            test,
            interval: None,
            timeout: None,
            retries: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Attachment {
    pub network: ResourceHandle,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum Mount {
    Volume {
        volume: ResourceHandle,
        target: String,
    },
    Bind {
        host: Utf8PathBuf,
        target: String,
    },
}

/// A logical application component, e.g. a container.
///
/// ```rust
/// use kumiki::{HealthProbe, RestartPolicy, ServiceUnit};
///
/// let unit = ServiceUnit::new("redis", "redis:7-alpine")
///     .restart(RestartPolicy::UnlessStopped)
///     .probe(HealthProbe::cmd(["redis-cli", "ping"]));
/// ```
#[derive(Debug, Clone)]
pub struct ServiceUnit {
    pub(crate) name: ArcStr,
    pub(crate) image: Value<String>,
    pub(crate) env: BTreeMap<String, Value<String>>,
    pub(crate) command: Vec<String>,
    pub(crate) networks: Vec<Attachment>,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) ports: Vec<PortBinding>,
    pub(crate) restart: RestartPolicy,
    pub(crate) shm_size: Option<u64>,
    pub(crate) probe: Option<HealthProbe>,
}

impl ServiceUnit {
    /// `image` is either a literal reference or an output of an image
    /// resource, e.g. `image.output("image_id")?`.
    pub fn new(name: impl Into<ArcStr>, image: impl Into<Value<String>>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            command: Vec::new(),
            networks: Vec::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            restart: RestartPolicy::default(),
            shm_size: None,
            probe: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds an environment variable. Values read from other resources make
    /// this service depend on them.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<Value<String>>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value<String>>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn network(self, network: &ResourceHandle) -> Self {
        self.network_with_aliases(network, std::iter::empty::<String>())
    }

    pub fn network_with_aliases<I, S>(mut self, network: &ResourceHandle, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks.push(Attachment {
            network: network.clone(),
            aliases: aliases.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn volume(mut self, volume: &ResourceHandle, target: impl Into<String>) -> Self {
        self.mounts.push(Mount::Volume {
            volume: volume.clone(),
            target: target.into(),
        });
        self
    }

    /// Mounts a path of the host machine.
    pub fn bind(mut self, host: impl Into<Utf8PathBuf>, target: impl Into<String>) -> Self {
        self.mounts.push(Mount::Bind {
            host: host.into(),
            target: target.into(),
        });
        self
    }

    pub fn port(mut self, internal: u16, external: u16) -> Self {
        self.ports.push(PortBinding {
            internal,
            external: Some(external),
            protocol: Protocol::Tcp,
        });
        self
    }

    pub fn port_binding(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Size of `/dev/shm` in megabytes.
    pub fn shm_size(mut self, megabytes: u64) -> Self {
        self.shm_size = Some(megabytes);
        self
    }

    pub fn probe(mut self, probe: HealthProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Handles referenced by attachments and mounts, with the kind each one
    /// is expected to have.
    pub(crate) fn attachments(&self) -> impl Iterator<Item = (&ResourceHandle, Kind)> {
        let networks = self
            .networks
            .iter()
            .map(|attachment| (&attachment.network, Kind::Network));

        let volumes = self.mounts.iter().filter_map(|mount| match mount {
            Mount::Volume { volume, .. } => Some((volume, Kind::Volume)),
            Mount::Bind { .. } => None,
        });

        networks.chain(volumes)
    }
}

/// Everything the registry knows about how to build one resource.
pub(crate) enum Definition {
    Network { internal: bool },
    Volume,
    Image { reference: Value<String> },
    Service(Box<ServiceUnit>),
    Secret(Arc<SecretEntry>),
}

impl Definition {
    pub fn kind(&self) -> Kind {
        match self {
            Definition::Network { .. } => Kind::Network,
            Definition::Volume => Kind::Volume,
            Definition::Image { .. } => Kind::Image,
            Definition::Service(_) => Kind::Service,
            Definition::Secret(_) => Kind::Secret,
        }
    }

    /// Every resource output this definition reads.
    pub fn references(&self) -> Vec<OutputRef> {
        match self {
            Definition::Network { .. } | Definition::Volume | Definition::Secret(_) => vec![],
            Definition::Image { reference } => reference.references().cloned().collect(),
            Definition::Service(unit) => {
                let mut refs: Vec<OutputRef> = unit.image.references().cloned().collect();

                for value in unit.env.values() {
                    refs.extend(value.references().cloned());
                }

                for (handle, _) in unit.attachments() {
                    if let Some(name) = handle.known("name") {
                        refs.extend(name.references().cloned());
                    }
                }

                refs
            }
        }
    }

    /// Resolves the definition into the properties handed to the provisioner.
    /// All referenced outputs must be settled at this point.
    pub fn resolve(&self) -> Result<Properties, ValueError> {
        let properties = match self {
            Definition::Network { internal } => Properties::Network {
                internal: *internal,
            },
            Definition::Volume => Properties::Volume,
            Definition::Image { reference } => Properties::Image {
                reference: reference.resolve()?,
            },
            Definition::Service(unit) => Properties::Service(resolve_service(unit)?),
            Definition::Secret(entry) => {
                return Err(ValueError::compute(anyhow::anyhow!(
                    "secret '{}' is generated locally and has no properties",
                    entry.name()
                )));
            }
        };

        Ok(properties)
    }
}

fn resolve_name(handle: &ResourceHandle) -> Result<String, ValueError> {
    match handle.known("name") {
        Some(name) => name.resolve(),
        None => Err(ValueError::compute(anyhow::anyhow!(
            "{} '{}' has no name output",
            handle.kind(),
            handle.name()
        ))),
    }
}

fn resolve_service(unit: &ServiceUnit) -> Result<ServiceProperties, ValueError> {
    let mut env = BTreeMap::new();
    for (key, value) in &unit.env {
        let setting = Setting {
            value: value.resolve()?,
            secret: value.is_secret(),
        };
        env.insert(key.clone(), setting);
    }

    let networks = unit
        .networks
        .iter()
        .map(|attachment| {
            Ok(NetworkAttachment {
                network: resolve_name(&attachment.network)?,
                aliases: attachment.aliases.clone(),
            })
        })
        .collect::<Result<_, ValueError>>()?;

    let mounts = unit
        .mounts
        .iter()
        .map(|mount| {
            Ok(match mount {
                Mount::Volume { volume, target } => MountPoint {
                    source: MountSource::Volume(resolve_name(volume)?),
                    target: target.clone(),
                },
                Mount::Bind { host, target } => MountPoint {
                    source: MountSource::Bind(host.clone()),
                    target: target.clone(),
                },
            })
        })
        .collect::<Result<_, ValueError>>()?;

    Ok(ServiceProperties {
        image: unit.image.resolve()?,
        env,
        command: unit.command.clone(),
        networks,
        mounts,
        ports: unit.ports.clone(),
        restart: unit.restart,
        shm_size: unit.shm_size,
        probe: unit.probe.clone(),
    })
}

/// Fully resolved configuration of a resource, one variant per kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Properties {
    Network { internal: bool },
    Volume,
    Image { reference: String },
    Service(ServiceProperties),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceProperties {
    pub image: String,
    pub env: BTreeMap<String, Setting>,
    pub command: Vec<String>,
    pub networks: Vec<NetworkAttachment>,
    pub mounts: Vec<MountPoint>,
    pub ports: Vec<PortBinding>,
    pub restart: RestartPolicy,
    pub shm_size: Option<u64>,
    pub probe: Option<HealthProbe>,
}

/// A resolved environment variable. Secret settings never show up in
/// `Debug` output or serialized requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Setting {
    value: String,
    secret: bool,
}

impl Setting {
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }
}

impl fmt::Debug for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secret {
            f.write_str("[secret]")
        } else {
            write!(f, "{:?}", self.value)
        }
    }
}

impl Serialize for Setting {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.secret {
            serializer.serialize_str("[secret]")
        } else {
            serializer.serialize_str(&self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub source: MountSource,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountSource {
    Volume(String),
    Bind(Utf8PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_forms() {
        let probe = HealthProbe::cmd(["pg_isready", "-U", "postgres"]);
        assert_eq!(probe.test, ["CMD", "pg_isready", "-U", "postgres"]);

        let probe = HealthProbe::shell("wget -q --spider localhost:3000/health || exit 1")
            .retries(3)
            .interval(Duration::from_secs(5));
        assert_eq!(probe.test[0], "CMD-SHELL");
        assert_eq!(probe.retries, Some(3));
    }

    #[test]
    fn literal_service_resolves() {
        let unit = ServiceUnit::new("web", "nginx:1.27")
            .env("MODE", "production")
            .env("TOKEN", Value::secret("s3cr3t".to_string()))
            .command(["nginx", "-g", "daemon off;"])
            .bind("/tmp/Caddyfile", "/etc/caddy/Caddyfile")
            .port(80, 8080)
            .restart(RestartPolicy::Always);

        let Properties::Service(props) = Definition::Service(Box::new(unit)).resolve().unwrap()
        else {
            panic!("expected service properties");
        };

        assert_eq!(props.image, "nginx:1.27");
        assert_eq!(props.env["MODE"].expose(), "production");
        assert!(props.env["TOKEN"].is_secret());
        assert_eq!(props.ports[0].external, Some(8080));
        assert_eq!(props.mounts[0].source, MountSource::Bind("/tmp/Caddyfile".into()));
    }

    #[test]
    fn secret_settings_are_redacted() {
        let setting = Setting {
            value: "s3cr3t".into(),
            secret: true,
        };

        assert_eq!(format!("{setting:?}"), "[secret]");
        assert_eq!(serde_json::to_string(&setting).unwrap(), r#""[secret]""#);
    }

    #[test]
    fn properties_serialize_with_kind_tag() {
        let json = serde_json::to_value(Properties::Network { internal: true }).unwrap();
        assert_eq!(json["kind"], "network");
        assert_eq!(json["internal"], true);
    }
}
