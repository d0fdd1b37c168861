//! Configuration: a YAML document plus RELIQ_* environment overrides.
//!
//! Two top-level sections: `store` selects and parameterizes the
//! backend, `rpc` (also accepted under its legacy name `drb`)
//! configures the network endpoint and its access-control list.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::disk::DiskStore;
use crate::store::sql::SqlStore;
use crate::store::MessageStore;

pub const DEFAULT_PORT: u16 = 6438;
pub const DEFAULT_CONNECT_COUNT: u32 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default, alias = "drb")]
    pub rpc: RpcSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreSettings {
    Disk {
        #[serde(default = "default_store_path")]
        path: String,
        #[serde(default)]
        fsync: bool,
    },
    Sqlite {
        path: String,
        #[serde(default)]
        prefix: String,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Disk {
            path: default_store_path(),
            fsync: false,
        }
    }
}

impl StoreSettings {
    pub fn open(&self) -> Box<dyn MessageStore> {
        match self {
            StoreSettings::Disk { path, fsync } => Box::new(DiskStore::new(path, *fsync)),
            StoreSettings::Sqlite { path, prefix } => Box::new(SqlStore::new(path, prefix.clone())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whitespace-separated `allow <host>` / `deny <host>` rules.
    #[serde(default)]
    pub acl: Option<String>,
    /// Client-side connect retries before giving up.
    #[serde(default = "default_connect_count")]
    pub connect_count: u32,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            acl: None,
            connect_count: DEFAULT_CONNECT_COUNT,
        }
    }
}

fn default_store_path() -> String {
    "./data/broker".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_count() -> u32 {
    DEFAULT_CONNECT_COUNT
}

impl Settings {
    /// Load from a YAML file (optional) and the environment. With no
    /// explicit path, `reliq.{yml,yaml}` in the working directory is
    /// used when present.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("reliq").required(false)),
        };
        builder
            .add_source(config::Environment::with_prefix("RELIQ").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(yaml: &str) -> Settings {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn disk_store_with_rpc_section() {
        let settings = parse(
            "store:\n  type: disk\n  path: /tmp/q\n  fsync: true\nrpc:\n  port: 7000\n  acl: \"allow 127.0.0.1 deny all\"\n",
        );
        match settings.store {
            StoreSettings::Disk { path, fsync } => {
                assert_eq!(path, "/tmp/q");
                assert!(fsync);
            }
            other => panic!("unexpected store settings: {:?}", other),
        }
        assert_eq!(settings.rpc.port, 7000);
        assert_eq!(settings.rpc.acl.as_deref(), Some("allow 127.0.0.1 deny all"));
        assert_eq!(settings.rpc.connect_count, DEFAULT_CONNECT_COUNT);
    }

    #[test]
    fn legacy_drb_key_still_works() {
        let settings = parse("store:\n  type: sqlite\n  path: broker.db\ndrb:\n  port: 6500\n");
        assert_eq!(settings.rpc.port, 6500);
        match settings.store {
            StoreSettings::Sqlite { path, prefix } => {
                assert_eq!(path, "broker.db");
                assert_eq!(prefix, "");
            }
            other => panic!("unexpected store settings: {:?}", other),
        }
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let settings = parse("{}\n");
        assert_eq!(settings.rpc.port, DEFAULT_PORT);
        assert!(matches!(settings.store, StoreSettings::Disk { .. }));
    }
}
