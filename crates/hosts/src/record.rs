//! Persisted code host records.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Lifecycle as observed on the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Unknown,
    Starting,
    Running,
    /// The backing service no longer exists.
    Mia,
}

/// Application-level readiness of the code server inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    Unknown,
    Starting,
    Ready,
    Mia,
}

impl HostState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Mia => "mia",
        }
    }
}

impl AppState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Mia => "mia",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HostState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "mia" => Ok(Self::Mia),
            other => Err(format!("unknown host state: {other}")),
        }
    }
}

impl FromStr for AppState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "mia" => Ok(Self::Mia),
            other => Err(format!("unknown app state: {other}")),
        }
    }
}

/// One user's code host as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub service_id: String,
    pub service_name: String,
    pub user_id: i64,
    pub class_id: Option<i64>,
    pub proto_id: Option<i64>,
    pub container_id: Option<String>,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub state: HostState,
    pub app_state: AppState,
    pub public_url: Option<String>,
    pub password: Option<String>,
    /// Label snapshot of the service at the last sync.
    pub labels: BTreeMap<String, String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_activity_ms: Option<i64>,
}

impl HostRecord {
    #[must_use]
    pub fn is_mia(&self) -> bool {
        self.state == HostState::Mia
    }

    /// Running on the orchestrator and answering probes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == HostState::Running && self.app_state == AppState::Ready
    }

    /// No activity within `idle_ms`. Hosts that never reported activity are
    /// measured from their creation time.
    #[must_use]
    pub fn is_quiescent(&self, now_ms: i64, idle_ms: i64) -> bool {
        let last = self.last_activity_ms.unwrap_or(self.created_at_ms);
        now_ms.saturating_sub(last) >= idle_ms
    }

    /// Published port embedded in `public_url`, if any.
    #[must_use]
    pub fn public_port(&self) -> Option<u16> {
        self.public_url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.port())
    }
}

/// Criteria for listing records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    pub state: Option<HostState>,
    pub app_state: Option<AppState>,
    pub class_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl HostFilter {
    #[must_use]
    pub fn matches(&self, record: &HostRecord) -> bool {
        self.state.is_none_or(|s| record.state == s)
            && self.app_state.is_none_or(|s| record.app_state == s)
            && self.class_id.is_none_or(|c| record.class_id == Some(c))
            && self.user_id.is_none_or(|u| record.user_id == u)
    }
}

#[cfg(test)]
pub(crate) fn sample(service_id: &str, service_name: &str, user_id: i64) -> HostRecord {
    HostRecord {
        service_id: service_id.into(),
        service_name: service_name.into(),
        user_id,
        class_id: None,
        proto_id: None,
        container_id: None,
        node_id: None,
        node_name: None,
        state: HostState::Starting,
        app_state: AppState::Starting,
        public_url: None,
        password: None,
        labels: BTreeMap::new(),
        created_at_ms: 1_000,
        updated_at_ms: 1_000,
        last_activity_ms: None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("http://alice:pw@10.0.0.5:25123/", Some(25123))]
    #[case("https://alice.code.example.org/", None)]
    #[case("not a url", None)]
    fn extracts_public_port(#[case] url: &str, #[case] expected: Option<u16>) {
        let mut record = sample("s1", "alice", 1);
        record.public_url = Some(url.into());
        assert_eq!(record.public_port(), expected);
    }

    #[test]
    fn quiescence_falls_back_to_creation_time() {
        let mut record = sample("s1", "alice", 1);
        assert!(!record.is_quiescent(1_500, 1_000));
        assert!(record.is_quiescent(2_000, 1_000));

        record.last_activity_ms = Some(1_900);
        assert!(!record.is_quiescent(2_000, 1_000));
    }

    #[test]
    fn filter_matches_set_fields_only() {
        let mut record = sample("s1", "alice", 1);
        record.class_id = Some(7);
        assert!(HostFilter::default().matches(&record));
        assert!(
            HostFilter {
                class_id: Some(7),
                state: Some(HostState::Starting),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !HostFilter {
                user_id: Some(2),
                ..Default::default()
            }
            .matches(&record)
        );
    }

    #[test]
    fn states_parse_their_display_form() {
        for s in [
            HostState::Unknown,
            HostState::Starting,
            HostState::Running,
            HostState::Mia,
        ] {
            assert_eq!(s.to_string().parse::<HostState>().unwrap(), s);
        }
        assert!("ready".parse::<HostState>().is_err());
        assert_eq!("ready".parse::<AppState>().unwrap(), AppState::Ready);
    }
}
