// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides `HttpStore`, the remote metadata store speaking the server's
//! HTTP shape: `GET /{gun}/_trust/tuf/<file>` for metadata and keys, one
//! multipart `POST` for atomic multi-metadata upload.

use crate::error::{self, Result};
use crate::schema::key::Key;
use crate::store::{MetadataStore, RemoteStore};
use log::{debug, trace};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::StatusCode;
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// A remote metadata store over HTTP.
///
/// All requests carry the configured timeout as their deadline; the engine
/// performs no retries of its own.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: Url,
    gun: String,
}

impl HttpStore {
    /// A store for `gun` on the server at `base_url`, with default
    /// timeouts.
    pub fn new(base_url: &str, gun: &str) -> Result<Self> {
        Self::with_timeout(base_url, gun, Duration::from_secs(30))
    }

    /// A store with a caller-chosen per-request deadline.
    pub fn with_timeout(base_url: &str, gun: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context(error::UrlParseSnafu { url: base_url })?;
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context(error::TransportSnafu {
                url: base_url.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            gun: gun.to_owned(),
        })
    }

    /// The URL of a file under this GUN's trust collection.
    fn url_for(&self, file: &str) -> Result<Url> {
        let path = format!(
            "{}/{}/_trust/tuf/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.gun,
            file
        );
        Url::parse(&path).context(error::UrlParseSnafu { url: path.clone() })
    }

    /// Maps a response's status onto the store error kinds: 404 means the
    /// server answered and has no such metadata, anything else non-2xx is
    /// the server being unavailable.
    fn check_status(response: Response, role: &str) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return error::MetaNotFoundSnafu { role }.fail();
        }
        ensure!(
            status.is_success(),
            error::ServerUnavailableSnafu {
                code: status.as_u16(),
            }
        );
        Ok(response)
    }

    fn fetch(&self, file: &str, role: &str, max_size: u64) -> Result<Vec<u8>> {
        let url = self.url_for(file)?;
        trace!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .context(error::TransportSnafu {
                url: url.to_string(),
            })?;
        let response = Self::check_status(response, role)?;
        let body = response.bytes().context(error::TransportSnafu {
            url: url.to_string(),
        })?;
        ensure!(
            body.len() as u64 <= max_size,
            error::MaxSizeExceededSnafu {
                max_size,
                specifier: "remote metadata",
            }
        );
        Ok(body.to_vec())
    }
}

impl MetadataStore for HttpStore {
    fn get_meta(&self, role: &str, max_size: u64) -> Result<Vec<u8>> {
        self.fetch(&format!("{role}.json"), role, max_size)
    }

    fn set_meta(&self, role: &str, data: &[u8]) -> Result<()> {
        self.set_multi_meta(&HashMap::from([(role.to_owned(), data.to_vec())]))
    }

    /// One multipart POST carrying every updated role; the server validates
    /// and installs the set atomically.
    fn set_multi_meta(&self, metas: &HashMap<String, Vec<u8>>) -> Result<()> {
        let url = self.url_for("")?;
        let mut form = Form::new();
        for (role, data) in metas {
            debug!("uploading {} ({} bytes)", role, data.len());
            let part = Part::bytes(data.clone())
                .file_name(format!("{role}.json"))
                .mime_str("application/json")
                .context(error::TransportSnafu {
                    url: url.to_string(),
                })?;
            form = form.part("files", part);
        }
        let response = self
            .client
            .post(url.clone())
            .multipart(form)
            .send()
            .context(error::TransportSnafu {
                url: url.to_string(),
            })?;
        Self::check_status(response, "multi-metadata upload")?;
        Ok(())
    }
}

impl RemoteStore for HttpStore {
    fn get_key(&self, role: &str) -> Result<Key> {
        let body = self.fetch(&format!("{role}.key"), role, 64 * 1024)?;
        serde_json::from_slice(&body).context(error::ParseMetadataSnafu {
            role: format!("{role} key"),
        })
    }

    fn get_meta_by_checksum(&self, role: &str, sha256_hex: &str, max_size: u64) -> Result<Vec<u8>> {
        self.fetch(&format!("{role}.{sha256_hex}.json"), role, max_size)
    }
}
