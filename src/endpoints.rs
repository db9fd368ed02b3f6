use crate::Error;

/// US ingestion endpoint
pub const US_INGESTION_ENDPOINT: &str = "https://us.i.posthog.com";

/// EU ingestion endpoint
pub const EU_INGESTION_ENDPOINT: &str = "https://eu.i.posthog.com";

/// Default host (US by default)
pub const DEFAULT_HOST: &str = US_INGESTION_ENDPOINT;

/// API endpoints for different operations
#[derive(Debug, Clone, Copy)]
pub enum Endpoint {
    /// Batched event ingestion
    Batch,
    /// Remote flag decisions
    Flags,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Batch => "/batch",
            Endpoint::Flags => "/flags?v=2",
        }
    }
}

/// Resolves the configured host into the URLs the client talks to.
///
/// Accepts either a bare host (`https://us.posthog.com`) or a full
/// endpoint URL left over from older configurations; app/us/eu hosts
/// are aliased to their ingestion counterparts.
#[derive(Debug, Clone)]
pub struct EndpointManager {
    base_host: String,
}

impl EndpointManager {
    pub fn new(host: Option<&str>) -> Result<Self, Error> {
        let base_host = match host {
            Some(h) => Self::determine_server_host(&normalize_host(h)?),
            None => DEFAULT_HOST.to_string(),
        };
        Ok(Self { base_host })
    }

    /// Map the well-known app hosts onto their ingestion endpoints.
    fn determine_server_host(host: &str) -> String {
        match host.trim_end_matches('/') {
            "https://app.posthog.com" | "https://us.posthog.com" => {
                US_INGESTION_ENDPOINT.to_string()
            }
            "https://eu.posthog.com" => EU_INGESTION_ENDPOINT.to_string(),
            _ => host.to_string(),
        }
    }

    pub fn base_host(&self) -> &str {
        &self.base_host
    }

    pub fn build_url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}{}",
            self.base_host.trim_end_matches('/'),
            endpoint.path()
        )
    }

    /// Definition-polling URL; the project token rides in the query
    /// string, the personal API key in the Authorization header.
    pub fn local_evaluation_url(&self, token: &str) -> String {
        format!(
            "{}/api/feature_flag/local_evaluation/?token={}&send_cohorts",
            self.base_host.trim_end_matches('/'),
            token
        )
    }
}

/// Strip any path from a configured host, keeping scheme://host[:port].
fn normalize_host(host: &str) -> Result<String, Error> {
    let host = host.trim();

    if !host.starts_with("http://") && !host.starts_with("https://") {
        return Err(Error::Config(
            "host must start with http:// or https://".to_string(),
        ));
    }

    let url = host
        .parse::<url::Url>()
        .map_err(|e| Error::Config(format!("invalid host URL: {e}")))?;

    let host_str = url
        .host_str()
        .ok_or_else(|| Error::Config("host URL is missing a host".to_string()))?;
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();

    Ok(format!("{}://{}{}", url.scheme(), host_str, port))
}
