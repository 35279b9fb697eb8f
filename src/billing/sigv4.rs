//! SigV4 headers for single-shot JSON requests, signed by `aws-sigv4`.

use crate::error::AppError;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use chrono::{DateTime, Utc};
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct RequestSigner {
    identity: Identity,
    region: String,
    service: String,
}

impl RequestSigner {
    pub fn new(
        credentials: Credentials,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            identity: Identity::from(credentials),
            region: region.into(),
            service: service.into(),
        }
    }

    /// Headers to attach to the outgoing request: `x-amz-date`, the optional
    /// session token, and `authorization`. `headers` are signed as given.
    pub fn signed_headers(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        at: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, AppError> {
        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&self.identity)
            .region(&self.region)
            .name(&self.service)
            .time(SystemTime::from(at))
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| AppError::ConnectionSetup(format!("signing parameters: {e}")))?
            .into();

        let request = SignableRequest::new(
            method,
            url,
            headers.iter().copied(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| AppError::ConnectionSetup(format!("unsignable request: {e}")))?;

        let (instructions, _signature) = sign(request, &params)
            .map_err(|e| AppError::ConnectionSetup(format!("request signing: {e}")))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}
