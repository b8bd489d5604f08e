//! On-disk representation of a topology file.
//!
//! These types mirror the YAML document one-to-one and carry no validation beyond what `serde` enforces. The loader
//! turns them into the validated model.

use std::{path::PathBuf, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyDocument {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub configs: IndexMap<String, ConfigDocument>,

    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeDocument>>,

    pub services: IndexMap<String, ServiceDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ConfigDocument {
    Path(PathBuf),
    Detailed { path: PathBuf },
}

impl ConfigDocument {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Path(path) | Self::Detailed { path } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeDocument {
    #[serde(default)]
    pub driver: Option<String>,

    #[serde(default)]
    pub labels: IndexMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDocument {
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub build: Option<BuildDocument>,

    #[serde(default)]
    pub command: Option<CommandDocument>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub env: Option<String>,

    #[serde(default)]
    pub environment: IndexMap<String, EnvValue>,

    #[serde(default)]
    pub readiness: Option<ReadinessDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildDocument {
    pub context: PathBuf,

    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub workdir: Option<String>,

    #[serde(default)]
    pub manifest: Option<PathBuf>,

    #[serde(default)]
    pub install: Option<String>,

    #[serde(default)]
    pub prepare: Option<String>,

    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
}

/// A command given either as a single shell string or as an exec-form list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum CommandDocument {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandDocument {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line],
            Self::Exec(argv) => argv,
        }
    }
}

/// Environment values may be written as YAML scalars of any type; they are always passed on as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl EnvValue {
    pub fn into_string(self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessDocument {
    #[serde(default)]
    pub exec: Option<CommandDocument>,

    #[serde(default)]
    pub tcp: Option<u16>,

    #[serde(default)]
    pub interval: Option<HumanDuration>,

    #[serde(default)]
    pub timeout: Option<HumanDuration>,

    #[serde(default)]
    pub retries: Option<u32>,

    #[serde(default)]
    pub start_period: Option<HumanDuration>,
}

/// A duration written like `500ms`, `5s`, or `1m30s`. A bare number is a count of seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(HumanDuration(Duration::from_secs(secs))),
            Raw::Text(s) => parse_duration(&s).map(HumanDuration).map_err(serde::de::Error::custom),
        }
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in '{}'", s));
        }
        let num: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in '{}'", s))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            "" => return Err(format!("missing unit after '{}' in '{}'", num, s)),
            other => return Err(format!("unknown duration unit '{}' in '{}'", other, s)),
        };
    }

    Ok(total)
}
