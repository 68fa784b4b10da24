// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport to the attestation proxy.
//!
//! One JSON request is POSTed and one JSON response is expected:
//!
//! ```text
//! request  { launch_measurement, nonce, secret_guid, secret_type, keyset, policy }
//! response { nonce, secret, cert_chain, signature }
//! ```
//!
//! Binary fields are standard base64. `cert_chain` is a list of SEV format
//! certificates, signer first.

use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_derive::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::utils::error::{LaunchError, Result};
use crate::utils::error_chain;

/// Request sent to the attestation proxy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub launch_measurement: String,
    pub nonce: String,
    pub secret_guid: String,
    pub secret_type: String,
    pub keyset: String,
    pub policy: u32,
}

/// Response of the attestation proxy. The secret is wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub nonce: String,
    pub secret: String,
    pub cert_chain: Vec<String>,
    pub signature: String,
}

impl Drop for AttestationResponse {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl fmt::Debug for AttestationResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AttestationResponse")
            .field("nonce", &self.nonce)
            .field("secret", &"<redacted>")
            .field("cert_chain", &self.cert_chain.len())
            .field("signature", &self.signature)
            .finish()
    }
}

/// A way to reach the attestation proxy.
pub trait ProxyClient: Send + Sync {
    /// Send `request` to `url` and wait at most `timeout` for the response.
    fn exchange(
        &self,
        url: &str,
        request: &AttestationRequest,
        timeout: Duration,
    ) -> Result<AttestationResponse>;
}

/// HTTP(S) transport built on the blocking reqwest client.
#[derive(Debug, Default)]
pub struct HttpProxyClient;

impl HttpProxyClient {
    pub fn new() -> Self {
        HttpProxyClient
    }
}

fn network_error(url: &str, reason: String) -> LaunchError {
    LaunchError::AttestationNetworkError {
        url: url.to_string(),
        reason,
    }
}

impl ProxyClient for HttpProxyClient {
    fn exchange(
        &self,
        url: &str,
        request: &AttestationRequest,
        timeout: Duration,
    ) -> Result<AttestationResponse> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| network_error(url, error_chain(&e)))?;

        let response = client
            .post(url)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    network_error(url, format!("timed out after {:?}", timeout))
                } else {
                    network_error(url, error_chain(&e))
                }
            })?
            .error_for_status()
            .map_err(|e| network_error(url, error_chain(&e)))?;

        let body = Zeroizing::new(
            response
                .bytes()
                .map_err(|e| network_error(url, error_chain(&e)))?
                .to_vec(),
        );
        serde_json::from_slice(&body).map_err(|e| {
            LaunchError::AttestationProtocolError(format!("malformed proxy response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn request() -> AttestationRequest {
        AttestationRequest {
            launch_measurement: base64::encode([1u8; 32]),
            nonce: base64::encode([2u8; 16]),
            secret_guid: "e6f5a162-d67f-4750-a67c-5d065f2a9910".to_string(),
            secret_type: "bundle".to_string(),
            keyset: "KEYSET-1".to_string(),
            policy: 0,
        }
    }

    // Serve one HTTP request with the given status line and body, returning
    // the request body that was received.
    fn serve_once(status: &'static str, body: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/attest", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(len) = lower.strip_prefix("content-length:") {
                    content_length = len.trim().parse().unwrap();
                }
            }
            let mut request = vec![0u8; content_length];
            reader.read_exact(&mut request).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
            String::from_utf8(request).unwrap()
        });
        (url, handle)
    }

    #[test]
    fn test_http_exchange() {
        let response = AttestationResponse {
            nonce: base64::encode([2u8; 16]),
            secret: base64::encode(b"secret"),
            cert_chain: vec![base64::encode([1u8; 0x824])],
            signature: base64::encode([3u8; 64]),
        };
        let (url, server) = serve_once("200 OK", serde_json::to_string(&response).unwrap());

        let got = HttpProxyClient::new()
            .exchange(&url, &request(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(got, response);
        assert!(!format!("{:?}", got).contains(&response.secret));

        let sent: AttestationRequest = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent, request());
    }

    #[test]
    fn test_http_exchange_non_2xx() {
        let (url, server) = serve_once("503 Service Unavailable", "{}".to_string());
        match HttpProxyClient::new().exchange(&url, &request(), Duration::from_secs(10)) {
            Err(LaunchError::AttestationNetworkError { url: got, reason }) => {
                assert_eq!(got, url);
                assert!(reason.contains("503"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_http_exchange_malformed_body() {
        let (url, server) = serve_once("200 OK", "{\"nonce\": 1}".to_string());
        assert!(matches!(
            HttpProxyClient::new().exchange(&url, &request(), Duration::from_secs(10)),
            Err(LaunchError::AttestationProtocolError(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_http_exchange_timeout() {
        // accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/attest", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        match HttpProxyClient::new().exchange(&url, &request(), Duration::from_millis(200)) {
            Err(LaunchError::AttestationNetworkError { reason, .. }) => {
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_http_exchange_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/attest", listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(
            HttpProxyClient::new().exchange(&url, &request(), Duration::from_secs(5)),
            Err(LaunchError::AttestationNetworkError { .. })
        ));
    }
}
