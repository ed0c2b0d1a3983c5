use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwks_url: String,
    pub supabase_jwt_issuer: String,
    pub supabase_jwt_audience: String,
    pub jwks_cache_ttl: Duration,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub admin_rate_limit_per_window: u32,
    pub extraction_rate_limit_per_window: u32,
    /// How long an edit session without a presence socket survives without activity
    pub edit_session_lease: Duration,
    pub record_backend: RecordBackendConfig,
    pub xero: Option<XeroRuntimeConfig>,
    pub vision: Option<VisionRuntimeConfig>,
}

/// Where record snapshots for edit checks are read and written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBackendConfig {
    /// PostgREST on the Supabase project, with the caller's token
    Supabase,
    /// Local libSQL file, for development without a hosted project
    Local { path: PathBuf },
}

#[derive(Clone, PartialEq, Eq)]
pub struct XeroRuntimeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Origins (`scheme://host[:port]`) the OAuth callback may send the browser back to
    pub allowed_redirect_origins: Vec<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct VisionRuntimeConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

impl fmt::Debug for XeroRuntimeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("XeroRuntimeConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("allowed_redirect_origins", &self.allowed_redirect_origins)
            .finish()
    }
}

impl fmt::Debug for VisionRuntimeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("VisionRuntimeConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("supabase_url", &self.supabase_url)
            .field("supabase_anon_key", &self.supabase_anon_key)
            .field("supabase_service_role_key", &"[REDACTED]")
            .field("supabase_jwks_url", &self.supabase_jwks_url)
            .field("supabase_jwt_issuer", &self.supabase_jwt_issuer)
            .field("supabase_jwt_audience", &self.supabase_jwt_audience)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "admin_rate_limit_per_window",
                &self.admin_rate_limit_per_window,
            )
            .field(
                "extraction_rate_limit_per_window",
                &self.extraction_rate_limit_per_window,
            )
            .field("edit_session_lease", &self.edit_session_lease)
            .field("record_backend", &self.record_backend)
            .field("xero", &self.xero)
            .field("vision", &self.vision)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "LARDER_API_BIND_ADDR", "127.0.0.1:8080");

        let supabase_url = required_trimmed(&lookup, "SUPABASE_URL")?;
        let supabase_anon_key = required_trimmed(&lookup, "SUPABASE_ANON_KEY")?;
        let supabase_service_role_key = required_trimmed(&lookup, "SUPABASE_SERVICE_ROLE_KEY")?;
        if !is_http_url(&supabase_url) {
            return Err(ConfigError::Invalid(
                "SUPABASE_URL must start with http:// or https://".to_string(),
            ));
        }
        let supabase_url = trim_trailing(&supabase_url).to_string();

        let default_jwks = format!("{supabase_url}/auth/v1/.well-known/jwks.json");
        let supabase_jwks_url = value_or_default(&lookup, "SUPABASE_JWKS_URL", &default_jwks);
        if !is_http_url(&supabase_jwks_url) {
            return Err(ConfigError::Invalid(
                "SUPABASE_JWKS_URL must start with http:// or https://".to_string(),
            ));
        }

        let default_issuer = format!("{supabase_url}/auth/v1");
        let supabase_jwt_issuer = value_or_default(&lookup, "SUPABASE_JWT_ISSUER", &default_issuer);
        let supabase_jwt_audience =
            value_or_default(&lookup, "SUPABASE_JWT_AUDIENCE", "authenticated");

        let jwks_cache_ttl_secs =
            bounded_u64(&lookup, "SUPABASE_JWKS_CACHE_TTL_SECS", "300", 30, 86_400)?;
        let auth_clock_skew_secs = bounded_u64(&lookup, "AUTH_CLOCK_SKEW_SECS", "60", 0, 300)?;
        let rate_limit_window_secs =
            bounded_u64(&lookup, "RATE_LIMIT_WINDOW_SECS", "60", 10, 3_600)?;
        let admin_rate_limit_per_window =
            bounded_u32(&lookup, "ADMIN_RATE_LIMIT_PER_WINDOW", "30", 1, 1_000)?;
        let extraction_rate_limit_per_window =
            bounded_u32(&lookup, "EXTRACTION_RATE_LIMIT_PER_WINDOW", "10", 1, 500)?;
        let edit_session_lease_secs =
            bounded_u64(&lookup, "EDIT_SESSION_LEASE_SECS", "120", 30, 86_400)?;

        let record_backend = parse_record_backend(&lookup)?;
        let xero = parse_xero_config(&lookup)?;
        let vision = parse_vision_config(&lookup)?;

        Ok(Self {
            bind_addr,
            supabase_url,
            supabase_anon_key,
            supabase_service_role_key,
            supabase_jwks_url,
            supabase_jwt_issuer,
            supabase_jwt_audience,
            jwks_cache_ttl: Duration::from_secs(jwks_cache_ttl_secs),
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            admin_rate_limit_per_window,
            extraction_rate_limit_per_window,
            edit_session_lease: Duration::from_secs(edit_session_lease_secs),
            record_backend,
            xero,
            vision,
        })
    }
}

fn parse_record_backend(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RecordBackendConfig, ConfigError> {
    match value_or_default(&lookup, "RECORD_BACKEND", "supabase")
        .to_ascii_lowercase()
        .as_str()
    {
        "supabase" => Ok(RecordBackendConfig::Supabase),
        "local" => {
            let path = value_or_default(&lookup, "LOCAL_RECORDS_DB_PATH", "data/records.db");
            Ok(RecordBackendConfig::Local {
                path: PathBuf::from(path),
            })
        }
        other => Err(ConfigError::Invalid(format!(
            "RECORD_BACKEND must be `supabase` or `local`, got `{other}`"
        ))),
    }
}

fn parse_xero_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<XeroRuntimeConfig>, ConfigError> {
    let client_id = optional_trimmed(&lookup, "XERO_CLIENT_ID");
    let client_secret = optional_trimmed(&lookup, "XERO_CLIENT_SECRET");
    let redirect_uri = optional_trimmed(&lookup, "XERO_REDIRECT_URI");
    let allowed_origins = optional_trimmed(&lookup, "XERO_ALLOWED_REDIRECT_ORIGINS");

    if client_id.is_none()
        && client_secret.is_none()
        && redirect_uri.is_none()
        && allowed_origins.is_none()
    {
        return Ok(None);
    }

    let client_id = client_id.ok_or(ConfigError::MissingVar("XERO_CLIENT_ID"))?;
    let client_secret = client_secret.ok_or(ConfigError::MissingVar("XERO_CLIENT_SECRET"))?;
    let redirect_uri = redirect_uri.ok_or(ConfigError::MissingVar("XERO_REDIRECT_URI"))?;
    if !is_http_url(&redirect_uri) {
        return Err(ConfigError::Invalid(
            "XERO_REDIRECT_URI must start with http:// or https://".to_string(),
        ));
    }

    let allowed_origins = allowed_origins.ok_or(ConfigError::MissingVar(
        "XERO_ALLOWED_REDIRECT_ORIGINS",
    ))?;
    let allowed_redirect_origins = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            url_origin(origin).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "XERO_ALLOWED_REDIRECT_ORIGINS entry `{origin}` is not an http(s) origin"
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(XeroRuntimeConfig {
        client_id,
        client_secret,
        redirect_uri,
        allowed_redirect_origins,
    }))
}

fn parse_vision_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<VisionRuntimeConfig>, ConfigError> {
    let Some(api_key) = optional_trimmed(&lookup, "VISION_API_KEY") else {
        return Ok(None);
    };
    let api_url = value_or_default(
        &lookup,
        "VISION_API_URL",
        "https://api.openai.com/v1/chat/completions",
    );
    if !is_http_url(&api_url) {
        return Err(ConfigError::Invalid(
            "VISION_API_URL must start with http:// or https://".to_string(),
        ));
    }
    let model = value_or_default(&lookup, "VISION_MODEL", "gpt-4o");

    Ok(Some(VisionRuntimeConfig {
        api_url,
        api_key,
        model,
    }))
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = value_or_default(lookup, name, default)
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]")))?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn bounded_u32(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    min: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    let value = bounded_u64(lookup, name, default, u64::from(min), u64::from(max))?;
    u32::try_from(value).map_err(|_| ConfigError::Invalid(format!("{name} is out of range")))
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    larder_core::util::normalize_text_option(lookup(name))
}

fn is_http_url(value: &str) -> bool {
    larder_core::util::is_http_url(value)
}

/// `scheme://host[:port]` of an http(s) URL
pub fn url_origin(value: &str) -> Option<String> {
    let url = url::Url::parse(value).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
impl AppConfig {
    /// Minimal configuration with a local record backend in memory.
    pub(crate) fn for_tests() -> Self {
        let mut map = HashMap::new();
        map.insert("SUPABASE_URL", "https://project.supabase.co");
        map.insert("SUPABASE_ANON_KEY", "public-anon-key");
        map.insert("SUPABASE_SERVICE_ROLE_KEY", "service-role-key");
        map.insert("RECORD_BACKEND", "local");
        map.insert("LOCAL_RECORDS_DB_PATH", ":memory:");
        Self::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .expect("test configuration is valid")
    }
}
