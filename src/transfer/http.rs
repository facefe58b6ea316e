//! HTTP-level transfer configuration: method, body encoding, headers, auth
//!
//! Header names are case-folded to lower case on insertion. Mapping bodies
//! are encoded according to the transfer's `Content-Type`: JSON by default,
//! bracket-nested form encoding for `application/x-www-form-urlencoded`, and
//! a configuration error for anything else.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{VolleyError, VolleyResult};
use crate::transfer::{RequestOptions, Transfer};

/// HTTP methods the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    /// Parse a method name; anything but GET or POST is rejected
    pub fn parse(name: &str) -> VolleyResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(VolleyError::UnsupportedMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        }
    }
}

impl std::str::FromStr for Method {
    type Err = VolleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::parse(s)
    }
}

impl Transfer {
    /// The transfer's HTTP method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Replace the transfer's method
    pub fn set_method(&mut self, method: Method) -> &mut Self {
        self.method = method;
        self
    }

    /// Set a raw request body
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    /// The configured request body
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Encode a mapping as the request body, driven by the content type
    ///
    /// With no content type (or a JSON one) the mapping is JSON-encoded and
    /// `Content-Type: application/json` is installed when absent. A
    /// form-urlencoded content type produces bracket-nested form pairs. Any
    /// other content type is a configuration error.
    pub fn set_mapping_body(&mut self, mapping: &Value) -> VolleyResult<&mut Self> {
        let content_type = self
            .header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase());

        match content_type.as_deref() {
            None => {
                self.body = Some(serde_json::to_vec(mapping)?);
                self.set_header("content-type", "application/json");
            }
            Some("application/json") | Some("text/json") => {
                self.body = Some(serde_json::to_vec(mapping)?);
            }
            Some("application/x-www-form-urlencoded") => {
                let Value::Object(map) = mapping else {
                    return Err(VolleyError::config(
                        "form-urlencoded body requires a JSON object",
                    ));
                };
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in map {
                    append_form_pair(&mut serializer, key, value);
                }
                self.body = Some(serializer.finish().into_bytes());
            }
            Some(other) => {
                return Err(VolleyError::UnsupportedContentType(other.to_string()));
            }
        }
        Ok(self)
    }

    /// Look up a header by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Set a header; an empty value removes it
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        let name = name.to_ascii_lowercase();
        if value.is_empty() {
            self.headers.remove(&name);
        } else {
            self.headers.insert(name, value.to_string());
        }
        self.mirror_headers_to_chain();
        self
    }

    /// Remove a header by name
    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(&name.to_ascii_lowercase());
        self.mirror_headers_to_chain();
        self
    }

    /// The header table (lower-cased names)
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Install `Content-Type`; an empty value removes it
    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.set_header("content-type", content_type)
    }

    /// Configure basic authentication
    pub fn set_basic_auth(&mut self, user: &str, password: &str) -> &mut Self {
        self.options.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    /// Configure a bearer token
    pub fn set_bearer_token(&mut self, token: &str) -> &mut Self {
        self.options.bearer_token = Some(token.to_string());
        self
    }

    /// Keep an attached predecessor's headers in sync with this transfer's
    ///
    /// The automatic MCP initialization chain derives its transfers from the
    /// main transfer at scheduling time, but a predecessor attached earlier
    /// by hand still observes later header edits.
    fn mirror_headers_to_chain(&mut self) {
        let headers = self.headers.clone();
        if let Some(before) = self.before.as_mut() {
            before.headers = headers;
        }
    }
}

/// Flatten one mapping entry into form pairs with bracketed nesting
fn append_form_pair(
    serializer: &mut url::form_urlencoded::Serializer<'_, String>,
    key: &str,
    value: &Value,
) {
    match value {
        Value::Object(map) => {
            for (child_key, child) in map {
                append_form_pair(serializer, &format!("{}[{}]", key, child_key), child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                append_form_pair(serializer, &format!("{}[{}]", key, index), child);
            }
        }
        Value::Null => {
            serializer.append_pair(key, "");
        }
        Value::String(text) => {
            serializer.append_pair(key, text);
        }
        other => {
            serializer.append_pair(key, &other.to_string());
        }
    }
}

/// Reusable defaults for building transfers
///
/// Holds options, headers, and a method applied to every built transfer;
/// `build(url)` yields a fresh, independent [`Transfer`].
#[derive(Debug, Clone, Default)]
pub struct TransferBuilder {
    method: Method,
    headers: BTreeMap<String, String>,
    options: RequestOptions,
}

impl TransferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default method for built transfers
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Default header for built transfers; an empty value removes it
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if value.is_empty() {
            self.headers.remove(&name);
        } else {
            self.headers.insert(name, value.to_string());
        }
        self
    }

    /// Default connection timeout
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.connect_timeout = Some(timeout);
        self
    }

    /// Default total timeout
    pub fn total_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.options.total_timeout = Some(timeout);
        self
    }

    /// Default redirect policy
    pub fn follow_redirects(mut self, follow: bool, max_redirects: usize) -> Self {
        self.options.follow_redirects = follow;
        self.options.max_redirects = max_redirects;
        self
    }

    /// Default basic-auth credentials
    pub fn basic_auth(mut self, user: &str, password: &str) -> Self {
        self.options.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    /// Default bearer token
    pub fn bearer_token(mut self, token: &str) -> Self {
        self.options.bearer_token = Some(token.to_string());
        self
    }

    /// Deliver status >= 400 through the error hook on built transfers
    pub fn fail_on_error(mut self, fail: bool) -> Self {
        self.options.fail_on_error = fail;
        self
    }

    /// Default user agent
    pub fn user_agent(mut self, agent: &str) -> Self {
        self.options.user_agent = Some(agent.to_string());
        self
    }

    /// Arbitrary option access for settings without a dedicated setter
    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    /// Build a fresh transfer carrying the configured defaults
    pub fn build(&self, url: &str) -> VolleyResult<Transfer> {
        let mut transfer = Transfer::with_method(url, self.method)?;
        transfer.headers = self.headers.clone();
        transfer.options = self.options.clone();
        Ok(transfer)
    }
}
