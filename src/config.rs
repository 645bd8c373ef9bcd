use serde::{Deserialize, Deserializer, Serialize};

/// Process-wide settings handed to [`crate::bridge::Bridge::init_with`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub http: HttpConfig,
    pub ssh: SshConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    #[serde(deserialize_with = "string_or_usize")]
    pub worker_threads: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "git/2.0 (git-bridge)".to_string(),
            worker_threads: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SshConfig {
    #[serde(deserialize_with = "string_or_u16")]
    pub default_port: u16,
    #[serde(deserialize_with = "string_or_usize")]
    pub worker_threads: usize,
    /// Idle session timeout; `None` keeps sessions open until closed.
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            default_port: 22,
            worker_threads: 2,
            inactivity_timeout_secs: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrUSize {
    String(String),
    USize(usize),
}

fn string_or_usize<'deserialize, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'deserialize>,
{
    match StringOrUSize::deserialize(deserializer)? {
        StringOrUSize::String(v) => v.trim().parse().map_err(serde::de::Error::custom),
        StringOrUSize::USize(v) => Ok(v),
    }
}

fn string_or_u16<'deserialize, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'deserialize>,
{
    let v = string_or_usize(deserializer)?;
    u16::try_from(v).map_err(serde::de::Error::custom)
}
