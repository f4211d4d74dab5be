//! WebDAV remote store
//!
//! Uses plain HTTP verbs against the configured endpoint with basic auth:
//! `PROPFIND` for listing and existence checks, `PUT`/`GET` for transfers,
//! `DELETE` and `MKCOL`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{join_remote, normalize_remote, RemoteConnector, RemoteEntry, RemoteStore};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

/// One `<response>` element of a multistatus body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResource {
    pub href: String,
    pub size: Option<u64>,
    pub is_collection: bool,
    pub last_modified: Option<String>,
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Length,
    Modified,
}

/// Parse a PROPFIND multistatus body
///
/// Namespace prefixes vary between servers, so elements are matched on their
/// local name only.
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavResource>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavResource::default()),
                b"href" => field = Some(Field::Href),
                b"getcontentlength" => field = Some(Field::Length),
                b"getlastmodified" => field = Some(Field::Modified),
                b"collection" => {
                    if let Some(resource) = current.as_mut() {
                        resource.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(resource) = current.as_mut() {
                        resource.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(resource), Some(field)) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| {
                            Error::RemoteTransfer(format!("Malformed PROPFIND response: {}", e))
                        })?
                        .into_owned();
                    match field {
                        Field::Href => {
                            if resource.href.is_empty() {
                                resource.href = text;
                            }
                        }
                        Field::Length => resource.size = text.trim().parse().ok(),
                        Field::Modified => resource.last_modified = Some(text),
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(resource) = current.take() {
                        resources.push(resource);
                    }
                }
                b"href" | b"getcontentlength" | b"getlastmodified" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::RemoteTransfer(format!(
                    "Malformed PROPFIND response: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(resources)
}

/// Decoded path portion of an href, which may be a full URL or an absolute path
fn href_path(href: &str) -> String {
    let raw = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}

fn dav_method(name: &'static str) -> Result<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| Error::RemoteTransfer(format!("Invalid HTTP method {}: {}", name, e)))
}

/// WebDAV-backed remote store
pub struct WebDavStore {
    http_client: Client,
    base_url: Url,
    user: String,
    password: String,
}

impl WebDavStore {
    /// Create a store for the given remote configuration
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        Self::with_client(Client::new(), config)
    }

    /// Create a store sharing an existing HTTP client
    pub fn with_client(http_client: Client, config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(config.url.trim()).map_err(|e| {
            Error::Config(format!("Invalid WebDAV URL {}: {}", config.url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "WebDAV URL cannot be used as a base: {}",
                config.url
            )));
        }

        Ok(Self {
            http_client,
            base_url,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Resolve a remote path against the endpoint
    fn url_for(&self, path: &str, directory: bool) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::Config(format!("WebDAV URL cannot be a base: {}", self.base_url))
            })?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
            if directory {
                segments.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| Error::RemoteTransfer(format!("{} failed: {}", what, e)))
    }

    async fn propfind(&self, path: &str, depth: &str) -> Result<Response> {
        let url = self.url_for(path, true)?;
        let builder = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        self.send(builder, &format!("PROPFIND {}", path)).await
    }
}

fn unexpected(what: &str, status: StatusCode) -> Error {
    Error::RemoteTransfer(format!("{} returned HTTP {}", what, status))
}

#[async_trait]
impl RemoteStore for WebDavStore {
    fn name(&self) -> &str {
        "webdav"
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let response = self.propfind(dir, "1").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(unexpected(&format!("PROPFIND {}", dir), status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::RemoteTransfer(format!("Failed to read listing: {}", e)))?;

        let own_path = href_path(self.url_for(dir, true)?.as_str());
        let own_path = own_path.trim_end_matches('/');

        let mut entries = Vec::new();
        for resource in parse_multistatus(&body)? {
            let path = href_path(&resource.href);
            let path = path.trim_end_matches('/');
            if path == own_path {
                continue;
            }
            let name = match path.rsplit('/').next() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };
            entries.push(RemoteEntry {
                path: join_remote(dir, &name),
                name,
                size: resource.size.unwrap_or(0),
                is_directory: resource.is_collection,
                last_modified: resource.last_modified,
            });
        }

        debug!("Listed {} entries under {}", entries.len(), dir);
        Ok(entries)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let read_failed = |e: std::io::Error| {
            Error::RemoteTransfer(format!("Failed to read {}: {}", local.display(), e))
        };
        let file = tokio::fs::File::open(local).await.map_err(read_failed)?;
        let size = file.metadata().await.map_err(read_failed)?.len();

        // Streamed from disk; the archive never sits in memory
        let body = Body::wrap_stream(ReaderStream::new(file));
        let url = self.url_for(remote, false)?;
        let what = format!("PUT {}", remote);
        let request = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, size)
            .body(body);
        let response = self.send(request, &what).await?;
        if !response.status().is_success() {
            return Err(unexpected(&what, response.status()));
        }

        info!("Uploaded {} ({} bytes)", normalize_remote(remote), size);
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let url = self.url_for(remote, false)?;
        let what = format!("GET {}", remote);
        let mut response = self.send(self.request(Method::GET, url), &what).await?;
        if !response.status().is_success() {
            return Err(unexpected(&what, response.status()));
        }

        let mut file = tokio::fs::File::create(local).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::RemoteTransfer(format!("{} interrupted: {}", what, e)))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!("Downloaded {} ({} bytes)", remote, written);
        Ok(())
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        let url = self.url_for(remote, false)?;
        let what = format!("DELETE {}", remote);
        let response = self.send(self.request(Method::DELETE, url), &what).await?;
        if !response.status().is_success() {
            return Err(unexpected(&what, response.status()));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.propfind(path, "0").await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected(&format!("PROPFIND {}", path), status)),
        }
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        let url = self.url_for(dir, true)?;
        let what = format!("MKCOL {}", dir);
        let response = self
            .send(self.request(dav_method("MKCOL")?, url), &what)
            .await?;
        match response.status() {
            // 405 means the collection is already there
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status if status.is_success() => {
                info!("Created remote directory {}", dir);
                Ok(())
            }
            status => Err(unexpected(&what, status)),
        }
    }
}

/// Connector producing `WebDavStore`s that share one HTTP client
#[derive(Clone, Default)]
pub struct WebDavConnector {
    http_client: Client,
}

impl WebDavConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteConnector for WebDavConnector {
    fn connect(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(WebDavStore::with_client(
            self.http_client.clone(),
            config,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method as AxumMethod, StatusCode as AxumStatus, Uri};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::Router;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:s="http://sabredav.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/me/vw/</d:href>
    <d:propstat>
      <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/me/vw/vw_backup_20240115_143022.tar.gz.enc</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>2048</d:getcontentlength>
        <d:getlastmodified>Mon, 15 Jan 2024 06:30:25 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <D:response xmlns:D="DAV:">
    <D:href>/remote.php/dav/files/me/vw/with%20space.txt</D:href>
    <D:propstat>
      <D:prop><D:resourcetype/></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</d:multistatus>"#;

    fn remote_config(url: &str) -> RemoteConfig {
        RemoteConfig {
            url: url.to_string(),
            user: "user".to_string(),
            password: "secret".to_string(),
            directory: "/vw".to_string(),
        }
    }

    #[test]
    fn test_parse_multistatus() {
        let resources = parse_multistatus(SAMPLE).unwrap();
        assert_eq!(resources.len(), 3);

        assert!(resources[0].is_collection);
        assert_eq!(resources[0].size, None);

        assert_eq!(
            resources[1].href,
            "/remote.php/dav/files/me/vw/vw_backup_20240115_143022.tar.gz.enc"
        );
        assert_eq!(resources[1].size, Some(2048));
        assert!(!resources[1].is_collection);
        assert_eq!(
            resources[1].last_modified.as_deref(),
            Some("Mon, 15 Jan 2024 06:30:25 GMT")
        );

        // No content length reported
        assert_eq!(resources[2].size, None);
    }

    #[test]
    fn test_parse_multistatus_malformed() {
        assert!(parse_multistatus("<d:multistatus><d:response></d:oops>").is_err());
    }

    #[test]
    fn test_href_path_decodes() {
        assert_eq!(href_path("/dav/with%20space.txt"), "/dav/with space.txt");
        assert_eq!(href_path("https://host/dav/a%2Bb"), "/dav/a+b");
    }

    #[test]
    fn test_url_for_keeps_base_path() {
        let store = WebDavStore::new(&remote_config("https://host/remote.php/dav/")).unwrap();
        assert_eq!(
            store.url_for("/vw/a b.tar.gz", false).unwrap().as_str(),
            "https://host/remote.php/dav/vw/a%20b.tar.gz"
        );
        assert_eq!(
            store.url_for("vw", true).unwrap().as_str(),
            "https://host/remote.php/dav/vw/"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(WebDavStore::new(&remote_config("not a url")).is_err());
    }

    // ========== Mock WebDAV server ==========

    #[derive(Default)]
    struct DavState {
        files: BTreeMap<String, Vec<u8>>,
        dirs: BTreeSet<String>,
        /// Content-Length header of each PUT
        put_lengths: BTreeMap<String, Option<u64>>,
    }

    type Shared = Arc<Mutex<DavState>>;

    const MOUNT: &str = "/dav";

    fn key_for(uri: &Uri) -> String {
        let path = percent_decode_str(uri.path()).decode_utf8_lossy().into_owned();
        let path = path.strip_prefix(MOUNT).unwrap_or(&path).to_string();
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn response_xml(href: &str, size: Option<usize>, collection: bool) -> String {
        let resourcetype = if collection {
            "<d:resourcetype><d:collection/></d:resourcetype>".to_string()
        } else {
            "<d:resourcetype/>".to_string()
        };
        let length = size
            .map(|s| format!("<d:getcontentlength>{}</d:getcontentlength>", s))
            .unwrap_or_default();
        format!(
            "<d:response><d:href>{}{}</d:href><d:propstat><d:prop>{}{}</d:prop>\
             <d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
            MOUNT, href, resourcetype, length
        )
    }

    async fn handle(
        State(state): State<Shared>,
        method: AxumMethod,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        let key = key_for(&uri);
        let mut state = state.lock().unwrap();
        match method.as_str() {
            "PUT" => {
                let length = headers
                    .get("Content-Length")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                state.put_lengths.insert(key.clone(), length);
                state.files.insert(key, body.to_vec());
                AxumStatus::CREATED.into_response()
            }
            "GET" => match state.files.get(&key) {
                Some(data) => data.clone().into_response(),
                None => AxumStatus::NOT_FOUND.into_response(),
            },
            "DELETE" => match state.files.remove(&key) {
                Some(_) => AxumStatus::NO_CONTENT.into_response(),
                None => AxumStatus::NOT_FOUND.into_response(),
            },
            "MKCOL" => {
                if state.dirs.insert(key) {
                    AxumStatus::CREATED.into_response()
                } else {
                    AxumStatus::METHOD_NOT_ALLOWED.into_response()
                }
            }
            "PROPFIND" => {
                let is_dir = key == "/" || state.dirs.contains(&key);
                if !is_dir && !state.files.contains_key(&key) {
                    return AxumStatus::NOT_FOUND.into_response();
                }
                let depth = headers
                    .get("Depth")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("1");

                let mut xml = String::from(r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:">"#);
                let own = if key == "/" { "/".to_string() } else { format!("{}/", key) };
                xml.push_str(&response_xml(&own, None, is_dir));
                if depth == "1" && is_dir {
                    let prefix = if key == "/" { "/".to_string() } else { format!("{}/", key) };
                    for (path, data) in &state.files {
                        if let Some(rest) = path.strip_prefix(&prefix) {
                            if !rest.contains('/') {
                                let href = path.replace(' ', "%20");
                                xml.push_str(&response_xml(&href, Some(data.len()), false));
                            }
                        }
                    }
                }
                xml.push_str("</d:multistatus>");
                (AxumStatus::MULTI_STATUS, xml).into_response()
            }
            _ => AxumStatus::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    struct MockDavServer {
        addr: SocketAddr,
        state: Shared,
        shutdown_tx: Option<oneshot::Sender<()>>,
    }

    impl MockDavServer {
        async fn start() -> Self {
            let state: Shared = Arc::default();
            let app = Router::new().fallback(handle).with_state(state.clone());

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (shutdown_tx, shutdown_rx) = oneshot::channel();

            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        shutdown_rx.await.ok();
                    })
                    .await
                    .unwrap();
            });

            Self {
                addr,
                state,
                shutdown_tx: Some(shutdown_tx),
            }
        }

        fn url(&self) -> String {
            format!("http://{}{}", self.addr, MOUNT)
        }
    }

    impl Drop for MockDavServer {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_against_mock_server() {
        let server = MockDavServer::start().await;
        let store = WebDavStore::new(&remote_config(&server.url())).unwrap();
        let dir = TempDir::new().unwrap();

        assert!(!store.exists("/vw").await.unwrap());
        store.mkdir("/vw").await.unwrap();
        assert!(store.exists("/vw").await.unwrap());
        // Already exists is not an error
        store.mkdir("/vw").await.unwrap();

        let local = dir.path().join("upload.tar.gz");
        std::fs::write(&local, b"archive bytes").unwrap();
        store
            .upload(&local, "/vw/vw_backup_20240115_143022.tar.gz")
            .await
            .unwrap();

        let entries = store.list("/vw").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "vw_backup_20240115_143022.tar.gz");
        assert_eq!(entries[0].path, "/vw/vw_backup_20240115_143022.tar.gz");
        assert_eq!(entries[0].size, 13);
        assert!(!entries[0].is_directory);

        let fetched = dir.path().join("fetched.tar.gz");
        store.download(&entries[0].path, &fetched).await.unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"archive bytes");

        store.remove(&entries[0].path).await.unwrap();
        assert!(store.list("/vw").await.unwrap().is_empty());
        assert!(server.state.lock().unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn test_download_missing_is_transfer_error() {
        let server = MockDavServer::start().await;
        let store = WebDavStore::new(&remote_config(&server.url())).unwrap();
        let dir = TempDir::new().unwrap();

        let err = store
            .download("/vw/missing.tar.gz", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteTransfer(_)));
    }

    #[tokio::test]
    async fn test_list_decodes_names() {
        let server = MockDavServer::start().await;
        let store = WebDavStore::new(&remote_config(&server.url())).unwrap();
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("f");
        std::fs::write(&local, b"1").unwrap();

        store.upload(&local, "/with space.txt").await.unwrap();
        let entries = store.list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "with space.txt");
        assert_eq!(entries[0].path, "/with space.txt");
    }

    #[tokio::test]
    async fn test_upload_streams_file_with_length() {
        let server = MockDavServer::start().await;
        let store = WebDavStore::new(&remote_config(&server.url())).unwrap();
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("big.tar.gz");
        let data: Vec<u8> = (0..1_500_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&local, &data).unwrap();

        store.upload(&local, "/big.tar.gz").await.unwrap();

        let state = server.state.lock().unwrap();
        assert_eq!(state.files.get("/big.tar.gz"), Some(&data));
        assert_eq!(state.put_lengths.get("/big.tar.gz"), Some(&Some(1_500_000)));
    }

    #[tokio::test]
    async fn test_upload_missing_local_file_fails() {
        let store = WebDavStore::new(&remote_config("http://127.0.0.1:9/dav")).unwrap();
        let err = store
            .upload(Path::new("/nonexistent/vaultkeep.tar.gz"), "/x.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteTransfer(_)));
    }
}
