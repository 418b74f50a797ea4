//! `ForwardRule`: immutable after creation (§3).

use crate::error::{DomainError, DomainResult};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardType {
    Local,
    Remote,
    Dynamic,
}

impl FromStr for ForwardType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ForwardType::Local),
            "remote" => Ok(ForwardType::Remote),
            "dynamic" => Ok(ForwardType::Dynamic),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ForwardRule {
    pub name: String,
    pub host: String,
    pub forward_type: ForwardType,
    pub local_port: u16,
    /// Not required for `Dynamic`; defaults to "localhost" for `Local`/`Remote`.
    pub remote_host: Option<String>,
    /// Not required for `Dynamic`.
    pub remote_port: Option<u16>,
    pub auto_connect: bool,
}

impl ForwardRule {
    /// Validate and construct a rule. `name_counter` is used to mint
    /// `forward-N` when `name` is empty; the caller is responsible for
    /// supplying a process-monotonic counter value.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        host: String,
        forward_type: ForwardType,
        local_port: u16,
        remote_host: Option<String>,
        remote_port: Option<u16>,
        auto_connect: bool,
        name_counter: u64,
    ) -> DomainResult<Self> {
        if host.trim().is_empty() {
            return Err(DomainError::InvalidRule("host must not be empty".into()));
        }
        if local_port == 0 {
            return Err(DomainError::InvalidRule(
                "local_port must be in 1..=65535".into(),
            ));
        }

        let (remote_host, remote_port) = match forward_type {
            ForwardType::Dynamic => (remote_host, remote_port),
            ForwardType::Local | ForwardType::Remote => {
                let port = remote_port.ok_or_else(|| {
                    DomainError::InvalidRule("remote_port is required for this forward type".into())
                })?;
                if port == 0 {
                    return Err(DomainError::InvalidRule(
                        "remote_port must be in 1..=65535".into(),
                    ));
                }
                let host = remote_host.filter(|h| !h.is_empty()).unwrap_or_else(|| "localhost".to_string());
                (Some(host), Some(port))
            }
        };

        let name = if name.trim().is_empty() {
            format!("forward-{name_counter}")
        } else {
            name
        };

        Ok(ForwardRule {
            name,
            host,
            forward_type,
            local_port,
            remote_host,
            remote_port,
            auto_connect,
        })
    }
}
