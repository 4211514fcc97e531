use std::env::VarError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

/// Default verification endpoint of the challenge provider.
pub const DEFAULT_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Default byte budget of the captured request store.
pub const DEFAULT_PENDING_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Default root of the template override tree.
pub const DEFAULT_TEMPLATE_PATH: &str = "/var/local/tps/templates";

/// Configuration for the gate.
#[derive(Clone)]
pub struct GateConfig {
    /// Listen address for the HTTP server.
    pub bind_addr: SocketAddr,

    /// Public key the challenge widget is rendered with.
    pub site_key: String,

    /// Server-side secret sent to the verification authority.
    pub secret_key: String,

    /// HMAC secret for session tokens.
    pub jwt_signing_key: String,

    /// Upstream application every admitted request goes to.
    pub proxy_target: Url,

    /// Postgres URL for the audit sink. Audit records only go to the log
    /// when unset.
    pub database_url: Option<String>,

    /// Root of the per-host template override tree.
    pub template_path: PathBuf,

    /// Verification authority endpoint.
    pub verify_url: Url,

    /// Timeout for the verification call.
    pub verify_timeout: Duration,

    /// Upstream connect timeout and longest wait between upstream reads.
    pub upstream_timeout: Duration,

    /// How long a captured request waits for its challenge to be solved.
    pub pending_ttl: Duration,

    /// Interval of the background sweep of expired captured requests.
    pub pending_sweep_interval: Duration,

    /// Approximate bytes all captured requests may occupy together.
    pub pending_max_bytes: u64,

    /// Largest body of a request held for a challenge. Passthrough bodies
    /// are streamed and not limited.
    pub max_body_size: usize,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    pub trust_forwarded_headers: bool,

    /// Paths forwarded without gating. A trailing `*` makes the entry a prefix.
    pub exempt_paths: Vec<String>,
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field("bind_addr", &self.bind_addr)
            .field("site_key", &self.site_key)
            .field("secret_key", &"<redacted>")
            .field("jwt_signing_key", &"<redacted>")
            .field("proxy_target", &self.proxy_target.as_str())
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("template_path", &self.template_path)
            .field("verify_url", &self.verify_url.as_str())
            .field("verify_timeout", &self.verify_timeout)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("pending_ttl", &self.pending_ttl)
            .field("pending_sweep_interval", &self.pending_sweep_interval)
            .field("pending_max_bytes", &self.pending_max_bytes)
            .field("max_body_size", &self.max_body_size)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("exempt_paths", &self.exempt_paths)
            .finish()
    }
}

impl GateConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// This allows tests to supply variables without mutating process-global
    /// environment state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let required = |key: &str, missing: &mut Vec<String>| match reader(key) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => {
                missing.push(key.to_string());
                String::new()
            }
        };

        let mut missing = Vec::new();
        let bind_addr = required("BIND_ADDR", &mut missing);
        let secret_key = required("TURNSTILE_SECRET_KEY", &mut missing);
        let site_key = required("TURNSTILE_SITE_KEY", &mut missing);
        let jwt_signing_key = required("JWT_SIGNING_KEY", &mut missing);
        let proxy_target = required("PROXY_TARGET", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing));
        }

        let bind_addr = bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDR".into(), e.to_string()))?;

        let proxy_target = parse_http_url("PROXY_TARGET", &proxy_target)?;

        let verify_url = parse_http_url(
            "TURNSTILE_VERIFY_URL",
            &reader("TURNSTILE_VERIFY_URL").unwrap_or_else(|_| DEFAULT_VERIFY_URL.to_string()),
        )?;

        let database_url = reader("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let template_path = reader("TEMPLATE_PATH")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TEMPLATE_PATH.to_string());
        let template_path = absolute_path(&template_path)
            .map_err(|e| ConfigError::InvalidValue("TEMPLATE_PATH".into(), e.to_string()))?;

        let verify_timeout = Duration::from_secs(parse_number(&reader, "VERIFY_TIMEOUT_SECS", 10)?);
        let upstream_timeout =
            Duration::from_secs(parse_number(&reader, "UPSTREAM_TIMEOUT_SECS", 30)?);
        let pending_ttl = Duration::from_secs(parse_number(&reader, "PENDING_TTL_SECS", 300)?);
        let pending_sweep_interval =
            Duration::from_secs(parse_number(&reader, "PENDING_SWEEP_SECS", 600)?);
        let pending_max_bytes =
            parse_number(&reader, "PENDING_MAX_BYTES", DEFAULT_PENDING_MAX_BYTES)?;
        let max_body_size = parse_number(&reader, "MAX_BODY_SIZE_BYTES", 10 * 1024 * 1024)?;

        let trust_forwarded_headers = reader("TRUST_FORWARDED_HEADERS")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .map_err(|e| {
                ConfigError::InvalidValue("TRUST_FORWARDED_HEADERS".into(), e.to_string())
            })?;

        let exempt_paths = reader("EXEMPT_PATHS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            site_key,
            secret_key,
            jwt_signing_key,
            proxy_target,
            database_url,
            template_path,
            verify_url,
            verify_timeout,
            upstream_timeout,
            pending_ttl,
            pending_sweep_interval,
            pending_max_bytes,
            max_body_size,
            trust_forwarded_headers,
            exempt_paths,
        })
    }

    /// Check if a path bypasses the gate.
    pub fn is_exempt_path(&self, path: &str) -> bool {
        for exempt in &self.exempt_paths {
            if let Some(prefix) = exempt.strip_suffix('*') {
                if path.starts_with(prefix) {
                    return true;
                }
            } else if path == exempt {
                return true;
            }
        }
        false
    }
}

fn absolute_path(raw: &str) -> std::io::Result<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn parse_http_url(var: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidValue(var.into(), e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue(
            var.into(),
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidValue(var.into(), "missing host".into()));
    }
    Ok(url)
}

fn parse_number<F, T>(reader: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match reader(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(var.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingVars(Vec<String>),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
