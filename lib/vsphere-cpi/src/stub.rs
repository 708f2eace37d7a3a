// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds a connected API client from configuration.

use std::fs::OpenOptions;

use slog::{info, Logger};
use vim_client::{HttpTransport, ResilientInvoker};
use vsphere_cpi_config::{Config, VcenterConfig};

use crate::client::VimApiClient;
use crate::Error;

fn base_url(config: &VcenterConfig) -> String {
    format!("https://{}/sdk", config.host)
}

/// An HTTP transport to the configured server. Without a CA bundle, server
/// certificates are accepted unverified.
pub fn create_transport(
    config: &VcenterConfig,
    log: &Logger,
) -> Result<HttpTransport, Error> {
    let builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout());
    let builder = match &config.ca_cert_file {
        Some(path) => {
            let pem = std::fs::read(path)?;
            builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?)
        }
        None => builder.danger_accept_invalid_certs(true),
    };

    let mut transport =
        HttpTransport::new(base_url(config), builder.build()?, log.clone());
    if let Some(path) = &config.http_log {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        transport = transport.with_audit_log(Box::new(file));
    }
    Ok(transport)
}

pub fn create_invoker(
    config: &VcenterConfig,
    log: &Logger,
) -> Result<ResilientInvoker<HttpTransport>, Error> {
    Ok(ResilientInvoker::new(create_transport(config, log)?, log.clone()))
}

pub async fn connect(
    config: &Config,
    log: &Logger,
) -> Result<VimApiClient<HttpTransport>, Error> {
    info!(log, "connecting to vcenter"; "host" => &config.vcenter.host);
    VimApiClient::connect(create_invoker(&config.vcenter, log)?, log).await
}
