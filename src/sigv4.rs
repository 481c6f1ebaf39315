//! SigV4 signing of outgoing Bedrock requests through `aws-sigv4`.

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::SystemTime;

/// RFC 3986 unreserved characters stay as-is, everything else is `%XX`.
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encodes one path segment, e.g. a model id containing `:`.
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, URI_ENCODE).to_string()
}

#[derive(Debug, thiserror::Error)]
#[error("failed to sign request: {0}")]
pub struct SigningError(String);

/// The parts of an outgoing request that go into its signature.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub payload: &'a [u8],
}

/// Signs a request and returns the headers to add to it: `authorization`,
/// `x-amz-date` and, for temporary credentials, `x-amz-security-token`.
pub fn sign_headers(
    credentials: &Credentials,
    region: &str,
    service: &str,
    request: &OutgoingRequest<'_>,
    now: SystemTime,
) -> Result<Vec<(String, String)>, SigningError> {
    let identity = credentials.clone().into();
    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(service)
        .time(now)
        .settings(SigningSettings::default())
        .build()
        .map_err(|err| SigningError(err.to_string()))?
        .into();
    let signable = SignableRequest::new(
        request.method,
        request.url,
        request.headers.iter().copied(),
        SignableBody::Bytes(request.payload),
    )
    .map_err(|err| SigningError(err.to_string()))?;
    let (instructions, _signature) = sign(signable, &params)
        .map_err(|err| SigningError(err.to_string()))?
        .into_parts();
    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}
