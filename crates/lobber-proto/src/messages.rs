//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP headers as carried on the wire: name -> ordered list of values.
pub type Headers = HashMap<String, Vec<String>>;

/// An HTTP request forwarded through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    /// Request path including the query string.
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// An HTTP response returned by the tunnel client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Response {
    /// Build a plain-text response produced by the relay itself, used to
    /// complete a waiter when the remote never will.
    pub fn synthetic(id: &str, status_code: u16, message: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), vec!["text/plain".to_string()]);
        Self {
            id: id.to_string(),
            status_code,
            headers,
            body: message.as_bytes().to_vec(),
        }
    }
}

/// Opaque body bytes travel as base64 strings since JSON has no bytes type.
/// A missing or null field decodes as an empty body.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
