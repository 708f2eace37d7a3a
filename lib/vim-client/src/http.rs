// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP transport to the management server's JSON gateway.
//!
//! Method calls are POSTed as `{target, method, args}` envelopes to
//! `<base>/<type>/<id>/<method>`; property reads are GETs of
//! `<base>/<type>/<id>/properties/<path>`. Status codes are reported back
//! untouched so that [`crate::ResilientInvoker`] can decide about replays.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use slog::{debug, o, Logger};
use vim_types::ManagedObjectReference;

use crate::transport::{MethodInfo, PropertyInfo, Response, Transport};
use crate::{Error, Fault};

/// API namespace requested from the server.
pub const DEFAULT_API_VERSION: &str = "vim.version.version8";

const VERSION_HEADER: &str = "vim-version";

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    version: String,
    audit: Option<Mutex<Box<dyn Write + Send>>>,
    log: Logger,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        client: reqwest::Client,
        log: Logger,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let log = log.new(o!(
            "component" => "vim-http",
            "base" => base_url.clone(),
        ));
        Self {
            base_url,
            client,
            version: DEFAULT_API_VERSION.to_string(),
            audit: None,
            log,
        }
    }

    /// Records every request and response to `writer`.
    pub fn with_audit_log(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.audit = Some(Mutex::new(writer));
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn object_url(&self, target: &ManagedObjectReference) -> String {
        format!("{}/{}/{}", self.base_url, target.type_name(), target.value())
    }

    fn method_url(
        &self,
        target: &ManagedObjectReference,
        method: &MethodInfo,
    ) -> String {
        format!("{}/{}", self.object_url(target), method.wsdl_name())
    }

    fn property_url(
        &self,
        target: &ManagedObjectReference,
        property: &PropertyInfo,
    ) -> String {
        format!("{}/properties/{}", self.object_url(target), property.path())
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&self.version) {
            headers.insert(VERSION_HEADER, v);
        }
        headers
    }

    fn audit(&self, entry: String) -> Result<(), Error> {
        if let Some(writer) = &self.audit {
            // A poisoned lock only means another writer panicked mid-entry.
            let mut writer =
                writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            writer.write_all(entry.as_bytes())?;
            writer.flush()?;
        }
        Ok(())
    }

    async fn exchange(
        &self,
        request: reqwest::RequestBuilder,
        method: &str,
        url: String,
        body: Option<&[u8]>,
    ) -> Result<Response, Error> {
        let headers = self.headers();
        self.audit(format_request(method, &url, &headers, body))?;
        debug!(self.log, "request"; "method" => method, "url" => &url);

        let response = request
            .headers(headers)
            .send()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| Error::Http { url: url.clone(), source })?;
        self.audit(format_response(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            &response_headers,
            &bytes,
        ))?;
        debug!(self.log, "response";
            "url" => &url,
            "status" => status.as_u16(),
        );

        Ok(Response::new(status.as_u16(), decode_payload(&bytes)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke_method(
        &self,
        target: &ManagedObjectReference,
        method: &MethodInfo,
        args: &Value,
    ) -> Result<Response, Error> {
        let url = self.method_url(target, method);
        let body = serde_json::to_vec(&json!({
            "target": target,
            "method": method.wsdl_name(),
            "args": args,
        }))?;
        let request = self.client.post(&url).body(body.clone());
        self.exchange(request, "POST", url, Some(&body)).await
    }

    async fn invoke_property(
        &self,
        target: &ManagedObjectReference,
        property: &PropertyInfo,
    ) -> Result<Value, Error> {
        let url = self.property_url(target, property);
        let request = self.client.get(&url);
        let response = self.exchange(request, "GET", url, None).await?;
        if response.is_success() {
            Ok(response.payload)
        } else {
            Err(Fault::from_payload(response.payload).into())
        }
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

/// Empty bodies decode to null; bodies that are not JSON are kept as text so
/// that they still end up in the resulting fault.
fn decode_payload(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(bytes).into_owned())
    })
}

fn format_headers(out: &mut String, headers: &HeaderMap) {
    if headers.is_empty() {
        out.push_str("None\n");
    }
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("<binary>");
        out.push_str(&format!("{name}: {value}\n"));
    }
}

fn format_body(out: &mut String, body: &[u8]) {
    match std::str::from_utf8(body) {
        Ok(text) => {
            out.push_str(text);
            out.push('\n');
        }
        Err(_) => out.push_str("BODY IS BINARY DATA\n"),
    }
}

fn format_request(
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> String {
    let mut out = String::from("= Request\n\n");
    out.push_str(&format!("{method} {url}\n\n"));
    out.push_str(&format!("Date: {}\n", chrono::Utc::now().to_rfc2822()));
    out.push_str("Request Headers:\n");
    format_headers(&mut out, headers);
    if let Some(body) = body {
        out.push_str("Request Body:\n");
        format_body(&mut out, body);
    }
    out
}

fn format_response(
    status: u16,
    reason: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> String {
    let mut out = String::from("= Response\n\n");
    out.push_str(&format!("Status: {status} {reason}\n"));
    out.push_str("Response Headers:\n");
    format_headers(&mut out, headers);
    if !body.is_empty() {
        out.push_str("Response Body:\n");
        format_body(&mut out, body);
    }
    out
}
