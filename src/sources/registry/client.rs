//! Blocking HTTP client for the component registry API.
//!
//! Endpoints used:
//!
//! ```text
//! GET {registry}/api/components/{ns}/{name}                    component + versions
//! GET {registry}/api/components/{ns}/{name}/versions/{version} one version
//! GET {download_url}                                           archive
//! GET {checksums_url}                                          CHECKSUMS.json
//! ```
//!
//! Relative download URLs are resolved against the storage URL.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::core::dependency::RuleSpec;
use crate::core::name;
use crate::sources::registry::archive::{ArchiveError, ArchiveKind};
use crate::util::errors::ErrorKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RETRIES: u32 = 1;
const BACKOFF: Duration = Duration::from_millis(500);
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("namespace `{namespace}` was not found at {endpoint}")]
    NamespaceNotFound { namespace: String, endpoint: String },

    #[error("component `{name}` was not found at {endpoint}")]
    ComponentNotFound { name: String, endpoint: String },

    #[error("version {version} of component `{name}` was not found at {endpoint}")]
    VersionNotFound {
        name: String,
        version: String,
        endpoint: String,
    },

    #[error("response from {endpoint} is too large")]
    ContentTooLarge { endpoint: String },

    #[error("cannot connect to {endpoint}")]
    NetworkConnectionError {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {endpoint} failed with HTTP {status}{}", fmt_message(.message))]
    Http {
        endpoint: String,
        status: u16,
        message: Option<String>,
    },

    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("invalid registry URL `{url}`")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("download from {endpoint} was interrupted")]
    Interrupted {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write download from {endpoint}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

fn fmt_message(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NamespaceNotFound { .. }
            | RegistryError::ComponentNotFound { .. }
            | RegistryError::VersionNotFound { .. } => ErrorKind::NotFound,
            RegistryError::Http { status: 404, .. } => ErrorKind::NotFound,
            RegistryError::InvalidUrl { .. } => ErrorKind::UserInput,
            RegistryError::Io { .. } => ErrorKind::Environment,
            RegistryError::Archive(e) => e.kind(),
            RegistryError::ContentTooLarge { .. }
            | RegistryError::NetworkConnectionError { .. }
            | RegistryError::Interrupted { .. }
            | RegistryError::Http { .. }
            | RegistryError::InvalidResponse { .. } => ErrorKind::Network,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            RegistryError::NetworkConnectionError { .. } => true,
            RegistryError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Error body returned by the registry.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
    #[serde(default)]
    messages: Vec<String>,
}

/// `GET /api/components/{ns}/{name}`
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentResponse {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub versions: Vec<VersionResponse>,
}

/// One version as reported by the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    #[serde(default)]
    pub component_hash: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyResponse>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, alias = "url")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub checksums_url: Option<String>,
    #[serde(default)]
    pub min_component_manager_version: Option<String>,
    #[serde(default)]
    pub yanked: bool,
}

/// A dependency of a registry version.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyResponse {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "any_spec")]
    pub spec: String,
    /// `service` (registry) or `idf`
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub registry_url: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub matches: Vec<RuleSpec>,
    #[serde(default)]
    pub pre_release: Option<bool>,
    #[serde(default)]
    pub is_public: bool,
}

fn any_spec() -> String {
    "*".to_string()
}

/// Client bound to one registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    api_url: Url,
    storage_url: Url,
    token: Option<String>,
    http: Client,
}

impl RegistryClient {
    /// `registry_url` is the public registry URL (ending in `/`).
    pub fn new(
        registry_url: &str,
        storage_url: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self, RegistryError> {
        let parse = |raw: &str| {
            let with_slash = if raw.ends_with('/') {
                raw.to_string()
            } else {
                format!("{}/", raw)
            };
            Url::parse(&with_slash).map_err(|source| RegistryError::InvalidUrl {
                url: raw.to_string(),
                source,
            })
        };

        let base = parse(registry_url)?;
        let api_url = base.join("api/").map_err(|source| RegistryError::InvalidUrl {
            url: registry_url.to_string(),
            source,
        })?;
        let storage_url = match storage_url {
            Some(url) => parse(url)?,
            None => base,
        };

        let http = Client::builder()
            .user_agent(concat!("idf-component-manager/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()
            .map_err(|source| RegistryError::NetworkConnectionError {
                endpoint: api_url.to_string(),
                source,
            })?;

        Ok(RegistryClient {
            api_url,
            storage_url,
            token: token.map(str::to_string),
            http,
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// Every version of `name` (`ns/name`).
    pub fn component(&self, full_name: &str) -> Result<ComponentResponse, RegistryError> {
        let endpoint = self.component_endpoint(full_name, None)?;
        tracing::debug!("GET {}", endpoint);
        let response = self.get(&endpoint, |code, messages| {
            not_found_error(code, messages, full_name, None, &endpoint)
        })?;
        parse_json(response, &endpoint)
    }

    /// Metadata of one version, including where to download it.
    pub fn version(&self, full_name: &str, version: &str) -> Result<VersionResponse, RegistryError> {
        let endpoint = self.component_endpoint(full_name, Some(version))?;
        tracing::debug!("GET {}", endpoint);
        let response = self.get(&endpoint, |code, messages| {
            not_found_error(code, messages, full_name, Some(version), &endpoint)
        })?;
        parse_json(response, &endpoint)
    }

    /// Stream the archive at `url` into `dir`. Returns the written file
    /// and its archive kind.
    pub fn download_archive(&self, url: &str, dir: &Path) -> Result<(PathBuf, ArchiveKind), RegistryError> {
        let endpoint = self.resolve_url(url)?;
        tracing::info!("downloading {}", endpoint);

        let response = self.get(&endpoint, |_, _| None)?;

        let kind = match ArchiveKind::from_name(endpoint.path()) {
            Some(kind) => kind,
            None => {
                let disposition = response
                    .headers()
                    .get(CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(disposition_filename)
                    .unwrap_or_else(|| endpoint.path().to_string());
                ArchiveKind::detect(&disposition)?
            }
        };

        let target = dir.join(format!("archive{}", kind.extension()));
        stream_to_file(response, &target, endpoint.as_str())?;
        Ok((target, kind))
    }

    /// Download `CHECKSUMS.json` as text.
    pub fn download_checksums(&self, url: &str) -> Result<String, RegistryError> {
        let endpoint = self.resolve_url(url)?;
        tracing::debug!("GET {}", endpoint);
        let response = self.get(&endpoint, |_, _| None)?;
        response
            .text()
            .map_err(|source| RegistryError::NetworkConnectionError {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    fn component_endpoint(&self, full_name: &str, version: Option<&str>) -> Result<Url, RegistryError> {
        let (namespace, component) = name::split(full_name);
        let mut path = format!(
            "components/{}/{}",
            namespace.unwrap_or(crate::util::config::DEFAULT_NAMESPACE),
            component
        );
        if let Some(version) = version {
            path.push_str("/versions/");
            path.push_str(version);
        }
        self.api_url
            .join(&path)
            .map_err(|source| RegistryError::InvalidUrl { url: path, source })
    }

    fn resolve_url(&self, url: &str) -> Result<Url, RegistryError> {
        self.storage_url
            .join(url)
            .map_err(|source| RegistryError::InvalidUrl {
                url: url.to_string(),
                source,
            })
    }

    /// GET with one retry on connection errors and server errors.
    ///
    /// `typed` maps a registry error code to a typed error.
    fn get<F>(&self, endpoint: &Url, typed: F) -> Result<Response, RegistryError>
    where
        F: Fn(&str, &[String]) -> Option<RegistryError>,
    {
        let mut attempt = 0;
        loop {
            match self.try_get(endpoint, &typed) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < RETRIES => {
                    let delay = BACKOFF * 2u32.pow(attempt);
                    tracing::debug!("{}; retrying in {}ms", err, delay.as_millis());
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_get<F>(&self, endpoint: &Url, typed: &F) -> Result<Response, RegistryError>
    where
        F: Fn(&str, &[String]) -> Option<RegistryError>,
    {
        let mut request = self.http.get(endpoint.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|source| RegistryError::NetworkConnectionError {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(RegistryError::ContentTooLarge {
                endpoint: endpoint.to_string(),
            });
        }

        let body = response.text().unwrap_or_default();
        let api_error = serde_json::from_str::<ApiErrorBody>(&body).ok();
        if let Some(api_error) = &api_error {
            if api_error.error == "ContentTooLarge" {
                return Err(RegistryError::ContentTooLarge {
                    endpoint: endpoint.to_string(),
                });
            }
            if let Some(err) = typed(&api_error.error, &api_error.messages) {
                return Err(err);
            }
        }

        Err(RegistryError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message: api_error.map(|e| {
                if e.messages.is_empty() {
                    e.error
                } else {
                    e.messages.join("; ")
                }
            }),
        })
    }
}

fn not_found_error(
    code: &str,
    _messages: &[String],
    full_name: &str,
    version: Option<&str>,
    endpoint: &Url,
) -> Option<RegistryError> {
    let endpoint = endpoint.to_string();
    match code {
        "NamespaceNotFound" => Some(RegistryError::NamespaceNotFound {
            namespace: name::split(full_name).0.unwrap_or_default().to_string(),
            endpoint,
        }),
        "ComponentNotFound" => Some(RegistryError::ComponentNotFound {
            name: full_name.to_string(),
            endpoint,
        }),
        "VersionNotFound" => Some(RegistryError::VersionNotFound {
            name: full_name.to_string(),
            version: version.unwrap_or_default().to_string(),
            endpoint,
        }),
        _ => None,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(response: Response, endpoint: &Url) -> Result<T, RegistryError> {
    let body = response
        .text()
        .map_err(|source| RegistryError::NetworkConnectionError {
            endpoint: endpoint.to_string(),
            source,
        })?;
    serde_json::from_str(&body).map_err(|e| RegistryError::InvalidResponse {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

/// Copy the body in fixed-size chunks to a sibling temp file, then rename.
///
/// Read failures come from the connection and are network errors; write
/// failures are local.
fn stream_to_file(mut body: impl Read, target: &Path, endpoint: &str) -> Result<(), RegistryError> {
    let io_err = |source| RegistryError::Io {
        endpoint: endpoint.to_string(),
        source,
    };

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match body.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(RegistryError::Interrupted {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
        };
        if n == 0 {
            break;
        }
        tmp.write_all(&buf[..n]).map_err(io_err)?;
        total += n as u64;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(target).map_err(|e| io_err(e.error))?;

    tracing::debug!("downloaded {} bytes from {}", total, endpoint);
    Ok(())
}

/// `attachment; filename="cmp.tgz"` → `cmp.tgz`
fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Yields `data`, then fails the way a stalled connection does.
    struct StalledBody {
        data: &'static [u8],
    }

    impl Read for StalledBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "operation timed out",
                ));
            }
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_stalled_body_is_network_error() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("archive.tgz");

        let err = stream_to_file(
            StalledBody { data: b"partial" },
            &target,
            "http://registry.test/cmp.tgz",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Interrupted { .. }), "{}", err);
        assert!(err.to_string().contains("http://registry.test/cmp.tgz"));
        assert_eq!(crate::util::errors::classify(&err.into()), ErrorKind::Network);
        assert!(!target.exists());
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename("attachment; filename=\"cmp_1.0.0.tgz\""),
            Some("cmp_1.0.0.tgz".to_string())
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn test_component_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/components/ex/cmp")
                .header("authorization", "Bearer secret");
            then.status(200).json_body(json!({
                "name": "cmp",
                "namespace": "ex",
                "versions": [
                    {"version": "1.0.0", "component_hash": "ab", "targets": ["esp32"],
                     "dependencies": [{"name": "dep", "namespace": "ex", "spec": "^2.0"}]}
                ]
            }));
        });

        let client = RegistryClient::new(&server.url("/"), None, Some("secret")).unwrap();
        let component = client.component("ex/cmp").unwrap();
        mock.assert();
        assert_eq!(component.versions.len(), 1);
        assert_eq!(component.versions[0].dependencies[0].spec, "^2.0");
        assert_eq!(component.versions[0].targets, vec!["esp32"]);
    }

    #[test]
    fn test_typed_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/components/ex/missing");
            then.status(404)
                .json_body(json!({"error": "ComponentNotFound", "messages": ["no such component"]}));
        });

        let client = RegistryClient::new(&server.url("/"), None, None).unwrap();
        let err = client.component("ex/missing").unwrap_err();
        assert!(matches!(err, RegistryError::ComponentNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/api/components/ex/missing"));
    }

    #[test]
    fn test_server_error_is_retried_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/components/ex/cmp");
            then.status(503);
        });

        let client = RegistryClient::new(&server.url("/"), None, None).unwrap();
        let err = client.component("ex/cmp").unwrap_err();
        assert_eq!(mock.hits(), 2);
        assert!(matches!(err, RegistryError::Http { status: 503, .. }));
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_download_relative_url_against_storage() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/files/cmp.tgz");
            then.status(200).body("payload");
        });

        let client = RegistryClient::new(
            "https://registry.invalid/",
            Some(&server.url("/files/")),
            None,
        )
        .unwrap();
        let tmp = TempDir::new().unwrap();
        let (path, kind) = client.download_archive("cmp.tgz", tmp.path()).unwrap();
        assert_eq!(kind, ArchiveKind::TarGz);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "payload");
    }

    #[test]
    fn test_archive_kind_from_content_disposition() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/download/42");
            then.status(200)
                .header("content-disposition", "attachment; filename=\"cmp.zip\"")
                .body("zip");
        });

        let client = RegistryClient::new(&server.url("/"), None, None).unwrap();
        let tmp = TempDir::new().unwrap();
        let (_, kind) = client
            .download_archive(&server.url("/download/42"), tmp.path())
            .unwrap();
        assert_eq!(kind, ArchiveKind::Zip);
    }
}
