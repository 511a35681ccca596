//! Service definition builder.
//!
//! Maps a user, an optional class and an image prototype onto the
//! [`ServiceSpec`] the orchestrator creates. Pure apart from hashing the
//! credential: the same inputs always yield the same routing and naming.

use std::{collections::BTreeMap, net::IpAddr};

use {
    codehost_config::CodehostConfig,
    codehost_swarm::{Mount, MountKind, PortBinding, PublishMode, Resources, ServiceSpec},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result, allocator};

/// Label names under the configured prefix.
pub mod labels {
    pub const MANAGED: &str = "managed";
    pub const USERNAME: &str = "username";
    pub const USER_ID: &str = "user_id";
    pub const CLASS_ID: &str = "class_id";
    pub const PROTO_ID: &str = "proto_id";
    pub const START_TIME: &str = "start_time";
    pub const PASSWORD: &str = "password";
    pub const PUBLIC_URL: &str = "public_url";
    pub const HOSTNAME: &str = "hostname";

    /// Full label key, e.g. `codehost.username`.
    #[must_use]
    pub fn key(prefix: &str, name: &str) -> String {
        format!("{prefix}.{name}")
    }
}

/// The user a host is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub username: String,
}

/// Class enrollment the host serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRef {
    pub id: i64,
    pub name: String,
    /// Repository cloned into the workspace on first start.
    pub repo_url: Option<String>,
}

/// Image template a host is started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProto {
    pub id: i64,
    pub name: String,
    pub image: String,
}

/// How code hosts under a hostname are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameKind {
    /// Behind the reverse proxy over HTTPS; the proxy enforces basic auth.
    Public,
    /// Direct `host:port` over HTTP with credentials in the URL.
    Local,
}

impl HostnameKind {
    /// Hostnames without a dot, ending in `.local`, or inside a private IPv4
    /// range are local. Everything else is public.
    #[must_use]
    pub fn classify(hostname: &str) -> Self {
        let host = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
        if !host.contains('.') || host.ends_with(".local") {
            return Self::Local;
        }
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) if v4.is_private() => Self::Local,
            _ => Self::Public,
        }
    }

    /// External ports the builder needs for this kind.
    #[must_use]
    pub fn ports_needed(self, config: &CodehostConfig) -> usize {
        match self {
            Self::Public => 0,
            Self::Local => 1 + usize::from(config.hosts.vnc_port.is_some()),
        }
    }
}

/// A service definition plus the values derived while building it.
#[derive(Debug, Clone)]
pub struct BuiltService {
    pub spec: ServiceSpec,
    pub kind: HostnameKind,
    pub public_url: String,
    pub password: String,
}

/// Build the service definition for `user`.
///
/// `ports` must hold [`HostnameKind::ports_needed`] entries for local
/// hostnames; it is ignored for public ones. A password is generated when
/// none is supplied.
pub fn build_service_spec(
    config: &CodehostConfig,
    user: &UserRef,
    class: Option<&ClassRef>,
    proto: &ImageProto,
    ports: &[u16],
    password: Option<&str>,
    start_time_ms: i64,
) -> Result<BuiltService> {
    let hosts = &config.hosts;
    let hostname = required(hosts.hostname.as_deref(), "hosts.hostname")?;
    let reporting_url = required(hosts.reporting_url.as_deref(), "hosts.reporting_url")?;
    let network = required(hosts.network.as_deref(), "hosts.network")?;
    let image = required(Some(proto.image.as_str()), "proto.image")?;

    let name = allocator::slugify(&user.username)?;
    let password = match password {
        Some(p) => p.to_string(),
        None => allocator::generate_password(),
    };
    let kind = HostnameKind::classify(hostname);
    let prefix = config.swarm.label_prefix.as_str();

    let mut spec = ServiceSpec {
        name: name.clone(),
        image: image.to_string(),
        hostname: Some(name.clone()),
        networks: vec![network.to_string()],
        resources: Resources {
            memory_limit: hosts.memory_limit.clone(),
            cpu_limit: hosts.cpu_limit,
        },
        ..Default::default()
    };

    if let Some(ref storage) = hosts.storage_dir {
        spec.mounts.push(Mount {
            kind: MountKind::Bind,
            source: format!("{}/{name}", storage.trim_end_matches('/')),
            target: hosts.workspace_dir.clone(),
            read_only: false,
        });
    }

    let public_url = match kind {
        HostnameKind::Local => {
            let needed = kind.ports_needed(config);
            if ports.len() < needed {
                return Err(Error::PortsExhausted {
                    start: hosts.port_range.start,
                    end: hosts.port_range.end,
                });
            }
            spec.ports.push(PortBinding {
                published: ports[0],
                target: hosts.container_port,
                mode: PublishMode::Host,
            });
            if let (Some(vnc), Some(published)) = (hosts.vnc_port, ports.get(1)) {
                spec.ports.push(PortBinding {
                    published: *published,
                    target: vnc,
                    mode: PublishMode::Host,
                });
            }
            spec.env.insert("PASSWORD".into(), password.clone());
            spec.env.insert("CODEHOST_AUTH".into(), "password".into());
            format!("http://{name}:{password}@{hostname}:{}/", ports[0])
        },
        HostnameKind::Public => {
            let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;
            spec.labels.extend(proxy_labels(config, &name, hostname, network, &hash));
            spec.env.insert("CODEHOST_AUTH".into(), "none".into());
            format!("https://{name}.{hostname}/")
        },
    };

    let mut env: BTreeMap<String, String> = hosts.extra_env.clone();
    env.append(&mut spec.env);
    env.insert("CODEHOST_REPORTING_URL".into(), reporting_url.to_string());
    env.insert("CODEHOST_USERNAME".into(), user.username.clone());
    env.insert("CODEHOST_SERVICE_NAME".into(), name.clone());
    env.insert("CODEHOST_WORKSPACE".into(), hosts.workspace_dir.clone());
    env.insert("CODEHOST_PUBLIC_URL".into(), public_url.clone());
    if let Some(class) = class {
        env.insert("CODEHOST_CLASS_ID".into(), class.id.to_string());
        if let Some(ref repo) = class.repo_url {
            env.insert("CODEHOST_REPO".into(), repo.clone());
        }
    }
    spec.env = env;

    let mut meta = BTreeMap::new();
    meta.insert(labels::key(prefix, labels::MANAGED), "true".to_string());
    meta.insert(labels::key(prefix, labels::USERNAME), user.username.clone());
    meta.insert(labels::key(prefix, labels::USER_ID), user.id.to_string());
    meta.insert(labels::key(prefix, labels::PROTO_ID), proto.id.to_string());
    meta.insert(labels::key(prefix, labels::START_TIME), start_time_ms.to_string());
    meta.insert(labels::key(prefix, labels::PASSWORD), password.clone());
    meta.insert(labels::key(prefix, labels::PUBLIC_URL), public_url.clone());
    meta.insert(labels::key(prefix, labels::HOSTNAME), hostname.to_string());
    if let Some(class) = class {
        meta.insert(labels::key(prefix, labels::CLASS_ID), class.id.to_string());
    }
    spec.container_labels = meta.clone();
    spec.labels.extend(meta);

    Ok(BuiltService {
        spec,
        kind,
        public_url,
        password,
    })
}

fn required<'a>(value: Option<&'a str>, key: &'static str) -> Result<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(Error::configuration(key))
}

/// Traefik routing for the code server and, when configured, the VNC bridge.
fn proxy_labels(
    config: &CodehostConfig,
    name: &str,
    hostname: &str,
    network: &str,
    password_hash: &str,
) -> BTreeMap<String, String> {
    let hosts = &config.hosts;
    let rule = format!("Host(`{name}.{hostname}`)");
    let auth = format!("{name}-auth");

    let mut l = BTreeMap::new();
    let mut set = |k: String, v: String| {
        l.insert(k, v);
    };
    set("traefik.enable".into(), "true".into());
    set("traefik.docker.network".into(), network.into());
    set(
        format!("traefik.http.middlewares.{auth}.basicauth.users"),
        format!("{name}:{password_hash}"),
    );

    let mut router = |router: &str, rule: String, port: u16| {
        let r = format!("traefik.http.routers.{router}");
        set(format!("{r}.rule"), rule);
        set(format!("{r}.entrypoints"), hosts.entrypoint.clone());
        set(format!("{r}.tls"), "true".into());
        set(format!("{r}.tls.certresolver"), hosts.cert_resolver.clone());
        set(format!("{r}.middlewares"), auth.clone());
        set(format!("{r}.service"), router.to_string());
        set(
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.to_string(),
        );
    };
    router(name, rule.clone(), hosts.container_port);
    if let Some(vnc) = hosts.vnc_port {
        router(
            &format!("{name}-vnc"),
            format!("{rule} && PathPrefix(`/vnc`)"),
            vnc,
        );
    }
    l
}
