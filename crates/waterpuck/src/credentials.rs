//! Stored network credentials: a single `ssid;password` line.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid credentials: {}", path.display()))
    }

    /// Only the first line counts; anything after it is ignored.
    pub fn parse(contents: &str) -> Result<Self> {
        let line = contents.lines().next().unwrap_or_default();
        let line = line.strip_suffix('\r').unwrap_or(line);

        let fields: Vec<&str> = line.split(';').collect();
        let [ssid, password] = fields.as_slice() else {
            bail!(
                "expected 2 ';'-separated fields (ssid;password), found {}",
                fields.len()
            );
        };
        if ssid.is_empty() {
            bail!("ssid is empty");
        }

        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }
}
