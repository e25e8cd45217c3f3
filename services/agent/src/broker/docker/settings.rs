//! Parsing of the string forms used in `docker` backend settings.

use std::fmt;

use super::api::PortBinding;
use crate::error::FleetError;

/// An image reference with its tag resolved.
///
/// A reference without tag or digest resolves to `:latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        // A colon before the last slash belongs to a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        let tag = match (tag, &digest) {
            (None, None) => Some("latest".to_string()),
            (tag, _) => tag,
        };

        Self {
            repository: repository.to_string(),
            tag,
            digest,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// A port mapping, `[ip:][hostPort:]containerPort[/proto]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn parse(spec: &str) -> Result<Self, FleetError> {
        let invalid = |reason: &str| FleetError::Config(format!("invalid port mapping {spec:?}: {reason}"));

        let (rest, protocol) = match spec.rsplit_once('/') {
            Some((rest, proto)) => (rest, proto),
            None => (spec, "tcp"),
        };
        if !matches!(protocol, "tcp" | "udp" | "sctp") {
            return Err(invalid("protocol must be tcp, udp or sctp"));
        }

        let parts: Vec<&str> = rest.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => ("", "", *container),
            [host_port, container] => ("", *host_port, *container),
            [ip, host_port, container] => (*ip, *host_port, *container),
            _ => return Err(invalid("too many ':' separators")),
        };

        let container_port = container_port
            .parse::<u16>()
            .map_err(|_| invalid("container port is not a number"))?;
        if !host_port.is_empty() && host_port.parse::<u16>().is_err() {
            return Err(invalid("host port is not a number"));
        }

        Ok(Self {
            host_ip: host_ip.to_string(),
            host_port: host_port.to_string(),
            container_port,
            protocol: protocol.to_string(),
        })
    }

    /// Engine API key, e.g. `25565/tcp`.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }

    pub fn binding(&self) -> PortBinding {
        PortBinding {
            host_ip: self.host_ip.clone(),
            host_port: self.host_port.clone(),
        }
    }
}

/// A bind mount, `host:container[:mode]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeBind {
    pub host_path: String,
    pub container_path: String,
    pub mode: Option<String>,
}

impl VolumeBind {
    pub fn parse(spec: &str) -> Result<Self, FleetError> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host_path, container_path, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, None),
            [host, container, mode] => (*host, *container, Some(mode.to_string())),
            _ => {
                return Err(FleetError::Config(format!(
                    "invalid volume {spec:?}: expected host:container[:mode]"
                )))
            }
        };
        if host_path.is_empty() || container_path.is_empty() {
            return Err(FleetError::Config(format!(
                "invalid volume {spec:?}: empty path"
            )));
        }

        Ok(Self {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
            mode,
        })
    }
}

impl fmt::Display for VolumeBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path, self.container_path)?;
        if let Some(mode) = &self.mode {
            write!(f, ":{mode}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nginx", "nginx", Some("latest"), "nginx:latest")]
    #[case("itzg/minecraft-server:java21", "itzg/minecraft-server", Some("java21"), "itzg/minecraft-server:java21")]
    #[case("localhost:5000/lobby", "localhost:5000/lobby", Some("latest"), "localhost:5000/lobby:latest")]
    #[case("localhost:5000/lobby:v2", "localhost:5000/lobby", Some("v2"), "localhost:5000/lobby:v2")]
    #[case("nginx@sha256:abcd", "nginx", None, "nginx@sha256:abcd")]
    fn test_image_ref(
        #[case] input: &str,
        #[case] repository: &str,
        #[case] tag: Option<&str>,
        #[case] display: &str,
    ) {
        let image = ImageRef::parse(input);
        assert_eq!(image.repository(), repository);
        assert_eq!(image.tag(), tag);
        assert_eq!(image.to_string(), display);
    }

    #[rstest]
    #[case("25565", "", "", 25565, "tcp")]
    #[case("25566:25565", "", "25566", 25565, "tcp")]
    #[case("127.0.0.1:25566:25565", "127.0.0.1", "25566", 25565, "tcp")]
    #[case("19132:19132/udp", "", "19132", 19132, "udp")]
    fn test_port_mapping(
        #[case] input: &str,
        #[case] host_ip: &str,
        #[case] host_port: &str,
        #[case] container_port: u16,
        #[case] protocol: &str,
    ) {
        let mapping = PortMapping::parse(input).unwrap();
        assert_eq!(mapping.host_ip, host_ip);
        assert_eq!(mapping.host_port, host_port);
        assert_eq!(mapping.container_port, container_port);
        assert_eq!(mapping.protocol, protocol);
        assert_eq!(mapping.port_key(), format!("{container_port}/{protocol}"));
    }

    #[rstest]
    #[case("abc")]
    #[case("25565:25565/icmp")]
    #[case("a:b:c:d")]
    #[case("x:25565")]
    fn test_port_mapping_rejects(#[case] input: &str) {
        assert!(matches!(PortMapping::parse(input), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_volume_bind() {
        let bind = VolumeBind::parse("/srv/lobby:/data:ro").unwrap();
        assert_eq!(bind.host_path, "/srv/lobby");
        assert_eq!(bind.container_path, "/data");
        assert_eq!(bind.mode.as_deref(), Some("ro"));
        assert_eq!(bind.to_string(), "/srv/lobby:/data:ro");

        assert!(VolumeBind::parse("/srv/lobby").is_err());
        assert!(VolumeBind::parse(":/data").is_err());
    }
}
