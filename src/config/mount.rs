use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl FromStr for MountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(MountKind::Bind),
            "volume" => Ok(MountKind::Volume),
            "tmpfs" => Ok(MountKind::Tmpfs),
            other => Err(format!("unsupported mount type '{}'", other)),
        }
    }
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// Structured form of a `workspaceMount` string such as
/// `source=${localWorkspaceFolder},target=/workspaces/app,type=bind,consistency=cached`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub kind: MountKind,
    pub consistency: Option<String>,
    pub read_only: bool,
    /// Unrecognized `key=value` pairs, in their original order.
    pub extra: Vec<(String, String)>,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Bind,
            consistency: None,
            read_only: false,
            extra: Vec::new(),
        }
    }
}

impl FromStr for MountSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut source = None;
        let mut target = None;
        let mut kind = MountKind::Bind;
        let mut consistency = None;
        let mut read_only = false;
        let mut extra = Vec::new();

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                // Docker accepts a bare `readonly` flag.
                None if part == "readonly" || part == "ro" => {
                    read_only = true;
                    continue;
                }
                None => return Err(format!("mount option '{}' is not key=value", part)),
            };

            match key {
                "source" | "src" => source = Some(value.to_string()),
                "target" | "dst" | "destination" => target = Some(value.to_string()),
                "type" => kind = value.parse()?,
                "consistency" => consistency = Some(value.to_string()),
                "readonly" | "ro" => read_only = value != "false" && value != "0",
                _ => extra.push((key.to_string(), value.to_string())),
            }
        }

        let target = target
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "mount is missing a target".to_string())?;
        let source = match (source, kind) {
            (Some(source), _) if !source.is_empty() => source,
            // tmpfs mounts have no source.
            (_, MountKind::Tmpfs) => String::new(),
            _ => return Err("mount is missing a source".to_string()),
        };

        Ok(Self {
            source,
            target,
            kind,
            consistency,
            read_only,
            extra,
        })
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.source.is_empty() {
            write!(f, "source={},", self.source)?;
        }
        write!(f, "target={},type={}", self.target, self.kind)?;
        if let Some(consistency) = &self.consistency {
            write!(f, ",consistency={}", consistency)?;
        }
        if self.read_only {
            write!(f, ",readonly")?;
        }
        for (key, value) in &self.extra {
            write!(f, ",{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_workspace_mount() {
        let mount: MountSpec =
            "source=${localWorkspaceFolder},target=/workspaces/mockhouse,type=bind,consistency=cached"
                .parse()
                .unwrap();

        assert_eq!(mount.source, "${localWorkspaceFolder}");
        assert_eq!(mount.target, "/workspaces/mockhouse");
        assert_eq!(mount.kind, MountKind::Bind);
        assert_eq!(mount.consistency.as_deref(), Some("cached"));
        assert!(!mount.read_only);
    }

    #[test]
    fn test_aliases_and_unknown_keys() {
        let mount: MountSpec = "src=/host,dst=/c,type=volume,ro,label=x".parse().unwrap();
        assert_eq!(mount.source, "/host");
        assert_eq!(mount.target, "/c");
        assert_eq!(mount.kind, MountKind::Volume);
        assert!(mount.read_only);
        assert_eq!(mount.extra, vec![("label".to_string(), "x".to_string())]);
        assert_eq!(
            mount.to_string(),
            "source=/host,target=/c,type=volume,readonly,label=x"
        );
    }

    #[test]
    fn test_rejects_incomplete_mounts() {
        assert!("target=/c".parse::<MountSpec>().is_err());
        assert!("source=/h".parse::<MountSpec>().is_err());
        assert!("source=/h,target=/c,type=nfs".parse::<MountSpec>().is_err());
        assert!("source=/h,target".parse::<MountSpec>().is_err());
        assert!("target=/tmp,type=tmpfs".parse::<MountSpec>().is_ok());
    }
}
