//! Semantic checks on a loaded configuration.
//!
//! Parsing already enforces types; this catches values that parse but would
//! make the builder or the poller misbehave at runtime.

use crate::schema::CodehostConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "hosts.reporting_url"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Validate a configuration.
pub fn validate(config: &CodehostConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let hosts = &config.hosts;
    for (path, value) in [
        ("hosts.hostname", &hosts.hostname),
        ("hosts.reporting_url", &hosts.reporting_url),
        ("hosts.network", &hosts.network),
    ] {
        if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
            result.push(Severity::Error, path, "required key is not set");
        }
    }

    for (path, value) in [
        ("hosts.hostname", &hosts.hostname),
        ("hosts.reporting_url", &hosts.reporting_url),
        ("hosts.network", &hosts.network),
        ("hosts.storage_dir", &hosts.storage_dir),
        ("database.url", &config.database.url),
    ] {
        if value.as_deref().is_some_and(|v| v.contains("${")) {
            result.push(
                Severity::Warning,
                path,
                "contains an unresolved ${...} placeholder",
            );
        }
    }

    if let Some(ref url) = hosts.reporting_url
        && !url.trim().is_empty()
        && url::Url::parse(url).is_err()
    {
        result.push(
            Severity::Error,
            "hosts.reporting_url",
            format!("not a valid URL: {url}"),
        );
    }

    if hosts.port_range.is_empty() {
        result.push(
            Severity::Error,
            "hosts.port_range",
            format!(
                "start ({}) is greater than end ({})",
                hosts.port_range.start, hosts.port_range.end
            ),
        );
    } else if hosts.port_range.start < 1024 {
        result.push(
            Severity::Warning,
            "hosts.port_range",
            "range includes privileged ports",
        );
    }

    if hosts.vnc_port == Some(hosts.container_port) {
        result.push(
            Severity::Error,
            "hosts.vnc_port",
            "must differ from hosts.container_port",
        );
    }

    let readiness = &config.readiness;
    if readiness.poll_interval_ms == 0 {
        result.push(
            Severity::Error,
            "readiness.poll_interval_ms",
            "must be greater than zero",
        );
    }
    if !readiness.backoff_factor.is_finite() {
        result.push(
            Severity::Error,
            "readiness.backoff_factor",
            "must be a finite number",
        );
    } else if readiness.backoff_factor < 1.0 {
        result.push(
            Severity::Warning,
            "readiness.backoff_factor",
            "values below 1.0 shrink the poll interval; treated as 1.0",
        );
    }
    if readiness.max_interval_ms < readiness.poll_interval_ms {
        result.push(
            Severity::Warning,
            "readiness.max_interval_ms",
            "smaller than poll_interval_ms; the poll interval is used as the cap",
        );
    }

    if config.reap.idle_minutes == 0 {
        result.push(
            Severity::Warning,
            "reap.idle_minutes",
            "zero makes every host without fresh activity reapable",
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use {super::*, crate::schema::PortRange};

    fn complete() -> CodehostConfig {
        let mut cfg = CodehostConfig::default();
        cfg.hosts.hostname = Some("code.example.org".into());
        cfg.hosts.reporting_url = Some("https://lms.example.org/telem".into());
        cfg.hosts.network = Some("proxy".into());
        cfg
    }

    #[test]
    fn complete_config_is_clean() {
        let result = validate(&complete());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0);
    }

    #[test]
    fn defaults_report_missing_required_keys() {
        let result = validate(&CodehostConfig::default());
        assert_eq!(result.count(Severity::Error), 3);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "hosts.reporting_url")
        );
    }

    #[test]
    fn blank_required_key_is_an_error() {
        let mut cfg = complete();
        cfg.hosts.network = Some("  ".into());
        let result = validate(&cfg);
        assert!(result.has_errors());
    }

    #[test]
    fn bad_reporting_url() {
        let mut cfg = complete();
        cfg.hosts.reporting_url = Some("not a url".into());
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn inverted_port_range() {
        let mut cfg = complete();
        cfg.hosts.port_range = PortRange {
            start: 30_000,
            end: 25_000,
        };
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn unresolved_placeholder_warns() {
        let mut cfg = complete();
        cfg.hosts.network = Some("${SWARM_NET}".into());
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
        assert_eq!(result.diagnostics[0].path, "hosts.network");
    }

    #[test]
    fn non_finite_backoff_is_rejected() {
        let mut cfg = complete();
        cfg.readiness.backoff_factor = f64::INFINITY;
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "readiness.backoff_factor");

        cfg.readiness.backoff_factor = 1e12;
        assert!(!validate(&cfg).has_errors());
    }

    #[test]
    fn zero_poll_interval() {
        let mut cfg = complete();
        cfg.readiness.poll_interval_ms = 0;
        assert!(validate(&cfg).has_errors());
    }
}
