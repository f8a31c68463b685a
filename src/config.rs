use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use displaydoc::Display;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PATH: &str = "/etc/muster/config.toml";

const BACKEND_SECTIONS: &[&str] = &["direct", "knownhosts", "puppetdb", "openstack"];

#[derive(Debug, Display, Error)]
pub enum Error {
    /// Unable to read configuration file `{0}`: {1}
    Read(PathBuf, std::io::Error),
    /// Unable to parse configuration file `{0}`: {1}
    Parse(PathBuf, Box<toml::de::Error>),
    /// Empty configuration found in `{0}`.
    Empty(PathBuf),
    /// Missing required parameter `log_file` in the configuration file.
    MissingLogFile,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_file: Option<PathBuf>,
    pub default_backend: Option<String>,
    pub transport: String,
    pub aliases: BTreeMap<String, String>,
    pub direct: DirectConfig,
    pub knownhosts: KnownHostsConfig,
    pub puppetdb: PuppetDbConfig,
    pub openstack: OpenStackConfig,
    pub local: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            default_backend: None,
            transport: "local".to_owned(),
            aliases: BTreeMap::new(),
            direct: DirectConfig::default(),
            knownhosts: KnownHostsConfig::default(),
            puppetdb: PuppetDbConfig::default(),
            openstack: OpenStackConfig::default(),
            local: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let contents =
            std::fs::read_to_string(path).map_err(|err| Error::Read(path.to_owned(), err))?;
        if contents.trim().is_empty() {
            return Err(Error::Empty(path.to_owned()));
        }
        let mut config: Config = toml::from_str(&contents)
            .map_err(|err| Error::Parse(path.to_owned(), Box::new(err)))?;

        if let Some(dir) = path.parent() {
            for backend in BACKEND_SECTIONS {
                let aliases = load_backend_aliases(dir, backend)?;
                config.backend_aliases_mut(backend).extend(aliases);
            }
        }
        Ok(config)
    }

    /// Pre-flight validation of mandatory keys.
    pub fn validate(&self) -> Result<(), Error> {
        if self.log_file.is_none() {
            return Err(Error::MissingLogFile);
        }
        Ok(())
    }

    /// Environment variables the named transport declares for export.
    pub fn transport_environment(&self, name: &str) -> BTreeMap<String, String> {
        match name {
            "local" => self.local.environment.clone(),
            _ => BTreeMap::new(),
        }
    }

    fn backend_aliases_mut(&mut self, backend: &str) -> &mut BTreeMap<String, String> {
        match backend {
            "direct" => &mut self.direct.aliases,
            "knownhosts" => &mut self.knownhosts.aliases,
            "puppetdb" => &mut self.puppetdb.aliases,
            _ => &mut self.openstack.aliases,
        }
    }
}

/// Load `<backend>_aliases.toml` next to the main configuration file, if
/// present.
fn load_backend_aliases(dir: &Path, backend: &str) -> Result<BTreeMap<String, String>, Error> {
    let path = dir.join(format!("{backend}_aliases.toml"));
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let contents = std::fs::read_to_string(&path).map_err(|err| Error::Read(path.clone(), err))?;
    toml::from_str(&contents).map_err(|err| Error::Parse(path, Box::new(err)))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub aliases: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct KnownHostsConfig {
    pub files: Vec<PathBuf>,
    pub aliases: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PuppetDbConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub aliases: BTreeMap<String, String>,
}

impl Default for PuppetDbConfig {
    fn default() -> Self {
        PuppetDbConfig {
            scheme: "https".to_owned(),
            host: "localhost".to_owned(),
            port: 443,
            timeout: Duration::from_secs(30),
            aliases: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub compute_url: String,
    pub username: String,
    pub password: String,
    pub domain_suffix: Option<String>,
    /// Per-API-call timeout ceiling.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub query_params: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, String>,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        OpenStackConfig {
            auth_url: "http://localhost:5000".to_owned(),
            compute_url: "http://localhost:8774/v2.1".to_owned(),
            username: String::new(),
            password: String::new(),
            domain_suffix: None,
            timeout: Duration::from_secs(10),
            query_params: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub environment: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn full_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
log_file = "/var/log/muster/muster.log"
default_backend = "direct"
transport = "local"

[aliases]
group1 = "D{host1 or host2}"

[knownhosts]
files = ["/etc/ssh/ssh_known_hosts"]

[puppetdb]
host = "puppetdb.example.com"
port = 8443
timeout = "10s"

[openstack]
auth_url = "http://keystone.example.com:5000"
domain_suffix = "cloud.example.com"

[local.environment]
SSH_AUTH_SOCK = "/run/ssh-agent.sock"
"#,
        );

        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.default_backend.as_deref(), Some("direct"));
        assert_eq!(config.aliases["group1"], "D{host1 or host2}");
        assert_eq!(config.knownhosts.files.len(), 1);
        assert_eq!(config.puppetdb.host, "puppetdb.example.com");
        assert_eq!(config.puppetdb.port, 8443);
        assert_eq!(config.puppetdb.timeout, Duration::from_secs(10));
        assert_eq!(
            config.openstack.domain_suffix.as_deref(),
            Some("cloud.example.com")
        );
        assert_eq!(
            config.transport_environment("local")["SSH_AUTH_SOCK"],
            "/run/ssh-agent.sock"
        );
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "log_file = \"/tmp/muster.log\"\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport, "local");
        assert_eq!(config.puppetdb.scheme, "https");
        assert_eq!(config.puppetdb.port, 443);
        assert_eq!(config.openstack.timeout, Duration::from_secs(10));
        assert!(config.aliases.is_empty());
    }

    #[test]
    fn sibling_alias_files_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "log_file = \"/tmp/muster.log\"\n");
        std::fs::write(
            dir.path().join("puppetdb_aliases.toml"),
            "webcache = \"R:Class = Role::Cache\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.puppetdb.aliases["webcache"], "R:Class = Role::Cache");
        assert!(config.direct.aliases.is_empty());
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "\n\n");
        assert!(matches!(Config::load(&path), Err(Error::Empty(_))));
    }

    #[test]
    fn missing_file_is_rejected() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/config.toml")),
            Err(Error::Read(..))
        ));
    }

    #[test]
    fn missing_log_file_fails_validation() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::MissingLogFile)));
    }
}
