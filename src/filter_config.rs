//! Filter configuration codec.
//!
//! A *filter config* is a small, serializable selector that narrows a
//! database view: a scenario, a set of alternatives, or a synthetic
//! per-execution descriptor. Configs travel in resource metadata (the
//! *filter stack*) and are also embedded into database URLs as percent
//! encoded JSON in a `filter=` query parameter, so external tools see
//! exactly which view a filtered run operated on.
//!
//! The heavyweight database mapping that *applies* these configs lives in an
//! external collaborator; this module only encodes, decodes and compares.

use serde::{Deserialize, Serialize};

pub const SCENARIO_FILTER_TYPE: &str = "scenario_filter";
pub const ALTERNATIVE_FILTER_TYPE: &str = "alternative_filter";
pub const EXECUTION_FILTER_TYPE: &str = "execution_filter";

/// Filter types a connection may expose to the user.
pub const SUPPORTED_FILTER_TYPES: [&str; 2] = [ALTERNATIVE_FILTER_TYPE, SCENARIO_FILTER_TYPE];

/// Query parameter under which configs are appended to URLs.
const FILTER_QUERY_KEY: &str = "filter";

// =============================================================================
// Config types
// =============================================================================

/// Bookkeeping payload of an execution filter: which item ran, under which
/// scenarios, stamped with the engine run's timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDescriptor {
    pub execution_item: String,
    pub scenarios: Vec<String>,
    pub timestamp: String,
}

/// One element of a filter stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FilterConfig {
    #[serde(rename = "scenario_filter")]
    Scenario { scenario: String },
    #[serde(rename = "alternative_filter")]
    Alternatives { alternatives: Vec<String> },
    #[serde(rename = "execution_filter")]
    Execution { execution: ExecutionDescriptor },
}

impl FilterConfig {
    pub fn scenario(name: impl Into<String>) -> Self {
        FilterConfig::Scenario {
            scenario: name.into(),
        }
    }

    pub fn alternatives(names: Vec<String>) -> Self {
        FilterConfig::Alternatives {
            alternatives: names,
        }
    }

    pub fn execution(descriptor: ExecutionDescriptor) -> Self {
        FilterConfig::Execution {
            execution: descriptor,
        }
    }

    pub fn filter_type(&self) -> &'static str {
        match self {
            FilterConfig::Scenario { .. } => SCENARIO_FILTER_TYPE,
            FilterConfig::Alternatives { .. } => ALTERNATIVE_FILTER_TYPE,
            FilterConfig::Execution { .. } => EXECUTION_FILTER_TYPE,
        }
    }

    /// Human readable name of the filter, used when building filter ids.
    /// Execution filters are bookkeeping and have no name.
    pub fn name(&self) -> Option<String> {
        match self {
            FilterConfig::Scenario { scenario } => Some(scenario.clone()),
            FilterConfig::Alternatives { alternatives } => {
                if alternatives.is_empty() {
                    None
                } else {
                    Some(alternatives.join(", "))
                }
            }
            FilterConfig::Execution { .. } => None,
        }
    }

    /// The scenario selected by this config, if it is a scenario filter.
    pub fn scenario_name(&self) -> Option<&str> {
        match self {
            FilterConfig::Scenario { scenario } => Some(scenario.as_str()),
            _ => None,
        }
    }
}

// =============================================================================
// URL embedding
// =============================================================================

/// Appends a filter config to a URL as a query parameter. Existing query
/// parameters (including previously appended configs) are preserved; configs
/// stack in application order.
pub fn append_filter_config(url: &str, config: &FilterConfig) -> String {
    let encoded = match serde_json::to_string(config) {
        Ok(json) => urlencoding::encode(&json).into_owned(),
        Err(_) => return url.to_string(),
    };
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{FILTER_QUERY_KEY}={encoded}")
}

/// Extracts the filter configs embedded in a URL, in application order.
pub fn filter_configs_from_url(url: &str) -> Vec<FilterConfig> {
    let Some((_, query)) = url.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|param| param.strip_prefix(&format!("{FILTER_QUERY_KEY}=")))
        .filter_map(|value| urlencoding::decode(value).ok())
        .filter_map(|json| serde_json::from_str(&json).ok())
        .collect()
}

/// Removes every embedded filter config from a URL, leaving other query
/// parameters untouched.
pub fn clear_filter_configs(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let retained: Vec<&str> = query
        .split('&')
        .filter(|param| !param.starts_with(&format!("{FILTER_QUERY_KEY}=")))
        .collect();
    if retained.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, retained.join("&"))
    }
}

// =============================================================================
// URL normalisation
// =============================================================================

/// The parts of a URL that matter for resource identity: scheme, host, port
/// and path. Credentials and the query string are deliberately ignored.
#[derive(Debug, PartialEq, Eq)]
struct NormalizedUrl {
    scheme: String,
    host: String,
    port: Option<String>,
    path: String,
}

fn normalize_url(url: &str) -> NormalizedUrl {
    let without_query = url.split_once('?').map(|(b, _)| b).unwrap_or(url);
    let (scheme, rest) = without_query
        .split_once("://")
        .unwrap_or(("", without_query));
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{p}")),
        None => (rest, String::new()),
    };
    // Strip credentials from the authority.
    let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => (h, Some(p.to_string())),
        _ => (host_port, None),
    };
    NormalizedUrl {
        scheme: scheme.to_ascii_lowercase(),
        host: host.to_ascii_lowercase(),
        port,
        path,
    }
}

/// Compares two URLs for equality under normalisation: case-insensitive
/// scheme and host, credentials and query stripped.
pub fn urls_equal(left: &str, right: &str) -> bool {
    normalize_url(left) == normalize_url(right)
}

/// Returns the scheme of a URL, or an empty string when there is none.
pub fn url_scheme(url: &str) -> &str {
    url.split_once("://").map(|(s, _)| s).unwrap_or("")
}

/// Returns the local filesystem path of a `file://` style URL, or the path
/// component of any other URL.
pub fn url_path(url: &str) -> String {
    let without_query = url.split_once('?').map(|(b, _)| b).unwrap_or(url);
    match without_query.split_once("://") {
        Some((_, rest)) => match rest.split_once('/') {
            Some((_, p)) => {
                let decoded = urlencoding::decode(p).map(|c| c.into_owned());
                format!("/{}", decoded.unwrap_or_else(|_| p.to_string()))
            }
            None => String::new(),
        },
        None => without_query.to_string(),
    }
}
