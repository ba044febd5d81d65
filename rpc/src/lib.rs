// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Shared gRPC plumbing: channel construction, static request headers, and retry.

use std::collections::BTreeMap;
use std::str::FromStr;

use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

pub mod retry;

pub mod tls {
    /// TLS parameters for remote stores and executors.
    #[derive(Clone, Default)]
    pub struct Config {
        /// PEM bundle overriding the system roots, if set.
        pub root_ca_certs: Option<Vec<u8>>,
    }
}

/// The service type produced by `layered_service`: a `Channel` with static headers attached
/// to every request.
pub type LayeredService = InterceptedService<Channel, SetRequestHeaders>;

#[derive(Clone)]
pub struct SetRequestHeaders {
    headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl Interceptor for SetRequestHeaders {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        for (key, value) in &self.headers {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Creates a channel to the given address, lazily connected so that construction cannot block.
///
/// `grpc://` and `http://` addresses are plaintext; `grpcs://` and `https://` use TLS with
/// either the system roots or the roots in `tls_config`.
pub async fn create_channel(
    addr: &str,
    tls_config: Option<&tls::Config>,
) -> Result<Channel, String> {
    let (uri_text, use_tls) = match addr.split_once("://") {
        Some(("grpc", rest)) => (format!("http://{rest}"), false),
        Some(("grpcs", rest)) => (format!("https://{rest}"), true),
        Some(("http", _)) => (addr.to_owned(), false),
        Some(("https", _)) => (addr.to_owned(), true),
        _ => return Err(format!("Unsupported address scheme: {addr}")),
    };

    let mut endpoint = Endpoint::from_shared(uri_text)
        .map_err(|err| format!("Failed to create endpoint for {addr}: {err}"))?;

    if use_tls {
        let mut client_tls_config = ClientTlsConfig::new().with_native_roots();
        if let Some(root_ca_certs) = tls_config.and_then(|c| c.root_ca_certs.as_ref()) {
            client_tls_config =
                client_tls_config.ca_certificate(Certificate::from_pem(root_ca_certs));
        }
        endpoint = endpoint
            .tls_config(client_tls_config)
            .map_err(|err| format!("Failed to configure TLS for {addr}: {err}"))?;
    }

    Ok(endpoint.connect_lazy())
}

/// Wraps a channel so that the given headers are attached to every outgoing request.
pub fn layered_service(
    channel: Channel,
    headers: &BTreeMap<String, String>,
) -> Result<LayeredService, String> {
    let headers = headers
        .iter()
        .map(|(key, value)| {
            let key = AsciiMetadataKey::from_str(key)
                .map_err(|err| format!("Header name {key:?} was not valid: {err}"))?;
            let value = AsciiMetadataValue::try_from(value.as_str())
                .map_err(|err| format!("Header value {value:?} was not valid: {err}"))?;
            Ok((key, value))
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(InterceptedService::new(
        channel,
        SetRequestHeaders { headers },
    ))
}

/// Renders an `x-gantry-*` style header map carrying a bearer token, the corpus convention for
/// authenticated remote stores.
pub fn headers_with_bearer_token(
    mut headers: BTreeMap<String, String>,
    token: Option<&str>,
) -> BTreeMap<String, String> {
    if let Some(token) = token {
        headers.insert("authorization".to_owned(), format!("Bearer {}", token.trim()));
    }
    headers
}

/// Converts a tonic Status into a human-readable error message, preserving the code.
pub fn status_to_str(status: &tonic::Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn channel_schemes() {
        for ok in ["grpc://127.0.0.1:0", "grpcs://127.0.0.1:0", "http://x", "https://x"] {
            assert!(super::create_channel(ok, None).await.is_ok(), "{ok}");
        }
        assert!(super::create_channel("ftp://x", None).await.is_err());
    }

    #[tokio::test]
    async fn invalid_headers_are_rejected() {
        let channel = super::create_channel("grpc://127.0.0.1:0", None).await.unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("bad header name".to_owned(), "value".to_owned());
        assert!(super::layered_service(channel, &headers).is_err());
    }

    #[test]
    fn bearer_token_is_attached() {
        let headers = super::headers_with_bearer_token(BTreeMap::new(), Some("tok\n"));
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
    }
}
