use crate::billing::cost_explorer::REGION;
use crate::error::AppError;
use crate::models::MetricKind;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::Region;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use std::path::PathBuf;
use tracing::debug;
use url::Url;

pub const DEFAULT_PREFIX: &str = "aws-ce";
const STATIC_PROVIDER: &str = "command-line flags";

/// Settings resolved once at startup. Nothing reads these lazily or rewrites
/// them afterwards.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub prefix: String,
    pub metric: MetricKind,
    pub resolve_names: bool,
    pub forecast: bool,
    pub tempfile: PathBuf,
    pub endpoint: Url,
}

/// Where credentials were requested from on the command line.
#[derive(Debug, Clone, Default)]
pub struct CredentialFlags {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub profile: Option<String>,
}

pub fn resolve_prefix(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => DEFAULT_PREFIX.to_string(),
    }
}

/// Explicit path wins, then `$MACKEREL_PLUGIN_WORKDIR`, then the OS temp dir.
pub fn resolve_tempfile(
    explicit: Option<&str>,
    prefix: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    let dir = lookup("MACKEREL_PLUGIN_WORKDIR")
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("mackerel-plugin-{prefix}"))
}

pub fn parse_endpoint(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::ConnectionSetup(format!("invalid endpoint '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::ConnectionSetup(format!(
            "unsupported endpoint scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// The `--access-key-id`/`--secret-access-key` pair, if one was given.
pub fn static_credentials(flags: &CredentialFlags) -> Result<Option<Credentials>, AppError> {
    match (
        non_empty(flags.access_key_id.as_ref()),
        non_empty(flags.secret_access_key.as_ref()),
    ) {
        (Some(access_key_id), Some(secret_access_key)) => Ok(Some(Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            STATIC_PROVIDER,
        ))),
        (None, None) => Ok(None),
        _ => Err(AppError::ConnectionSetup(
            "--access-key-id and --secret-access-key must be given together".into(),
        )),
    }
}

/// Static flags win. Otherwise the AWS default chain runs: environment,
/// shared config and credentials files (profile from `--profile`, then
/// `AWS_PROFILE`), web identity, ECS container and EC2 instance metadata.
pub async fn load_credentials(flags: &CredentialFlags) -> Result<Credentials, AppError> {
    if let Some(credentials) = static_credentials(flags)? {
        return Ok(credentials);
    }

    let mut chain = DefaultCredentialsChain::builder().region(Region::new(REGION));
    if let Some(profile) = non_empty(flags.profile.as_ref()) {
        chain = chain.profile_name(profile);
    }
    let chain = chain.build().await;

    let credentials = chain
        .provide_credentials()
        .await
        .map_err(|e| AppError::ConnectionSetup(format!("no usable AWS credentials: {e}")))?;
    debug!(credentials = ?credentials, "resolved AWS credentials");
    Ok(credentials)
}
