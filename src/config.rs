use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AutoscanError;
use crate::targets::autoscan::AutoscanPeerConfig;
use crate::targets::emby::EmbyConfig;
use crate::targets::jellyfin::JellyfinConfig;
use crate::targets::plex::PlexConfig;
use crate::triggers::a_train::ATrainConfig;
use crate::triggers::drive::DriveConfig;
use crate::triggers::inotify::InotifyConfig;
use crate::triggers::lidarr::LidarrConfig;
use crate::triggers::manual::ManualConfig;
use crate::triggers::radarr::RadarrConfig;
use crate::triggers::readarr::ReadarrConfig;
use crate::triggers::sonarr::SonarrConfig;
use crate::utils::duration_str;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Auth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Auth {
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default = "default_db_type")]
    pub kind: String,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_db_type() -> String {
    "sqlite".to_owned()
}

fn default_db_host() -> String {
    "localhost".to_owned()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "autoscan".to_owned()
}

fn default_db_username() -> String {
    "postgres".to_owned()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_db_type(),
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            username: default_db_username(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Triggers {
    #[serde(default)]
    pub manual: Option<ManualConfig>,
    #[serde(default)]
    pub a_train: Option<ATrainConfig>,
    #[serde(default)]
    pub bernard: Vec<DriveConfig>,
    #[serde(default)]
    pub inotify: Vec<InotifyConfig>,
    #[serde(default)]
    pub lidarr: Vec<LidarrConfig>,
    #[serde(default)]
    pub radarr: Vec<RadarrConfig>,
    #[serde(default)]
    pub readarr: Vec<ReadarrConfig>,
    #[serde(default)]
    pub sonarr: Vec<SonarrConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Targets {
    #[serde(default)]
    pub autoscan: Vec<AutoscanPeerConfig>,
    #[serde(default)]
    pub emby: Vec<EmbyConfig>,
    #[serde(default)]
    pub jellyfin: Vec<JellyfinConfig>,
    #[serde(default)]
    pub plex: Vec<PlexConfig>,
}

/// Process configuration, merged from the YAML file and `AUTOSCAN__`-prefixed
/// environment variables (double underscore separating nested keys).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct Config {
    pub host: Vec<String>,
    pub port: u16,

    #[serde(deserialize_with = "duration_str::deserialize")]
    pub minimum_age: Duration,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub scan_delay: Duration,
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub scan_stats: Duration,

    pub anchors: Vec<PathBuf>,

    pub authentication: Auth,
    pub database: DatabaseConfig,
    pub triggers: Triggers,
    pub targets: Targets,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: vec![String::new()],
            port: 3030,
            minimum_age: Duration::from_secs(10 * 60),
            scan_delay: Duration::from_secs(5),
            scan_stats: Duration::from_secs(60 * 60),
            anchors: Vec::new(),
            authentication: Auth::default(),
            database: DatabaseConfig::default(),
            triggers: Triggers::default(),
            targets: Targets::default(),
        }
    }
}

impl Config {
    /// Per-trigger and per-target `verbosity` settings, mapped onto module
    /// log-spec overrides.
    pub fn verbosity_overrides(&self) -> Vec<(&'static str, String)> {
        fn add(out: &mut Vec<(&'static str, String)>, module: &'static str, v: &Option<String>) {
            if let Some(verbosity) = v {
                out.push((module, verbosity.clone()));
            }
        }

        let mut overrides = Vec::new();

        if let Some(manual) = &self.triggers.manual {
            add(&mut overrides, "autoscan::triggers::manual", &manual.verbosity);
        }
        if let Some(a_train) = &self.triggers.a_train {
            add(&mut overrides, "autoscan::triggers::a_train", &a_train.verbosity);
        }
        for t in &self.triggers.bernard {
            add(&mut overrides, "autoscan::triggers::drive", &t.verbosity);
        }
        for t in &self.triggers.inotify {
            add(&mut overrides, "autoscan::triggers::inotify", &t.verbosity);
        }
        for t in &self.triggers.lidarr {
            add(&mut overrides, "autoscan::triggers::lidarr", &t.verbosity);
        }
        for t in &self.triggers.radarr {
            add(&mut overrides, "autoscan::triggers::radarr", &t.verbosity);
        }
        for t in &self.triggers.readarr {
            add(&mut overrides, "autoscan::triggers::readarr", &t.verbosity);
        }
        for t in &self.triggers.sonarr {
            add(&mut overrides, "autoscan::triggers::sonarr", &t.verbosity);
        }

        for t in &self.targets.autoscan {
            add(&mut overrides, "autoscan::targets::autoscan", &t.verbosity);
        }
        for t in &self.targets.emby {
            add(&mut overrides, "autoscan::targets::emby", &t.verbosity);
        }
        for t in &self.targets.jellyfin {
            add(&mut overrides, "autoscan::targets::jellyfin", &t.verbosity);
        }
        for t in &self.targets.plex {
            add(&mut overrides, "autoscan::targets::plex", &t.verbosity);
        }

        overrides
    }
}

pub fn load(path: &Path) -> Result<Config, AutoscanError> {
    Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed("AUTOSCAN__").split("__"))
        .extract()
        .map_err(|err| AutoscanError::Config(format!("failed decoding config: {err}")))
}
