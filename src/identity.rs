//! User identity supplied by the Mini App host.
//!
//! The host hands over its init payload once; everything downstream receives
//! the parsed [`HostIdentity`] explicitly instead of reading host globals.

use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub photo_url: Option<String>,
}

impl HostIdentity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            photo_url: None,
        }
    }

    /// Accepts either the raw `initData` query string or the
    /// `initDataUnsafe` JSON object.
    pub fn from_init_data(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        anyhow::ensure!(!raw.is_empty(), "authorization error: empty init data");

        let user = if raw.starts_with('{') {
            let payload: Value =
                serde_json::from_str(raw).context("authorization error: init data is not JSON")?;
            payload
                .get("user")
                .cloned()
                .ok_or_else(|| anyhow!("authorization error: init data has no user"))?
        } else {
            let url = Url::parse(&format!("https://host.invalid/?{raw}"))
                .context("authorization error: malformed init data")?;
            let encoded = url
                .query_pairs()
                .find(|(key, _)| key == "user")
                .map(|(_, value)| value.into_owned())
                .ok_or_else(|| anyhow!("authorization error: init data has no user"))?;
            serde_json::from_str(&encoded).context("authorization error: user field is not JSON")?
        };

        Self::from_user_value(&user)
    }

    fn from_user_value(user: &Value) -> Result<Self> {
        let user_id = user
            .get("id")
            .and_then(|id| id.as_i64().or_else(|| id.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| anyhow!("authorization error: user id missing"))?;

        let text = |key: &str| {
            user.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self {
            user_id,
            username: text("username"),
            first_name: text("first_name"),
            last_name: text("last_name"),
            photo_url: user
                .get("photo_url")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    pub fn display_name(&self) -> String {
        if !self.username.is_empty() {
            format!("@{}", self.username)
        } else if !self.first_name.is_empty() {
            self.first_name.clone()
        } else {
            "anonymous".to_string()
        }
    }
}
