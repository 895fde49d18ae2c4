use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Certificate, Client, Identity, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::codec::BlockIndex;
use crate::session::{
    DirectoryListing, EncodedName, ListFilter, LoginInfo, NameElement, ObjectId, ObjectUpload,
    StoreConnector, StoreSession,
};

const SESSION_HEADER: &str = "X-Coffer-Session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("store returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no session is logged in")]
    NotLoggedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    StorageFull,
    Transient,
    Permanent,
}

impl StoreError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            StoreError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Whether the connection should be abandoned rather than the current entry skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.classification(),
            Some(ApiErrorClass::NotFound | ApiErrorClass::StorageFull | ApiErrorClass::Permanent)
        )
    }

    pub fn is_storage_full(&self) -> bool {
        self.classification() == Some(ApiErrorClass::StorageFull)
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if matches!(
        status,
        StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE
    ) {
        ApiErrorClass::StorageFull
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS | StatusCode::CONFLICT
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Where the store lives and the certificates used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub host: String,
    pub port: u16,
    pub ca_certificate: PathBuf,
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
    pub timeout: Duration,
}

/// Opens mutually authenticated HTTPS sessions to the store.
#[derive(Clone)]
pub struct TlsConnector {
    http: Client,
    base_url: Url,
}

impl TlsConnector {
    pub fn new(settings: &TlsSettings) -> Result<Self, StoreError> {
        let ca = std::fs::read(&settings.ca_certificate)?;
        let mut identity_pem = std::fs::read(&settings.client_certificate)?;
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&std::fs::read(&settings.client_key)?);

        let ca = Certificate::from_pem(&ca).map_err(|err| StoreError::Tls(err.to_string()))?;
        let identity =
            Identity::from_pem(&identity_pem).map_err(|err| StoreError::Tls(err.to_string()))?;
        let http = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| StoreError::Tls(err.to_string()))?;
        let base_url = Url::parse(&format!("https://{}:{}/", settings.host, settings.port))?;
        Ok(Self { http, base_url })
    }
}

impl StoreConnector for TlsConnector {
    type Session = StoreClient;

    async fn connect(&self) -> Result<StoreClient, StoreError> {
        tracing::debug!(url = %self.base_url, "opening store session");
        Ok(StoreClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            session: Mutex::new(None),
        })
    }
}

/// HTTP client for one store session.
pub struct StoreClient {
    http: Client,
    base_url: Url,
    session: Mutex<Option<String>>,
}

impl StoreClient {
    pub fn with_base_url(base_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            session: Mutex::new(None),
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.session_token().is_some()
    }

    fn session_token(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_session_token(&self, token: Option<String>) {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        Ok(self.base_url.join(path)?)
    }

    fn authed(&self, request: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        let token = self.session_token().ok_or(StoreError::NotLoggedIn)?;
        Ok(request.header(SESSION_HEADER, token))
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Api { status, body })
        }
    }
}

#[derive(Deserialize)]
struct VersionResponse {
    version: u32,
}

#[derive(Serialize)]
struct LoginRequest {
    account: u32,
    mode: &'static str,
}

#[derive(Deserialize)]
struct LoginResponse {
    session: String,
    #[serde(flatten)]
    info: LoginInfo,
}

#[derive(Serialize)]
struct MarkerRequest {
    marker: i64,
}

#[derive(Serialize)]
struct CreateDirectoryRequest<'a> {
    name: &'a EncodedName,
    #[serde(with = "crate::b64")]
    attributes: &'a [u8],
    attributes_mod_time: i64,
}

#[derive(Serialize)]
struct DirectoryAttributesRequest<'a> {
    #[serde(with = "crate::b64")]
    attributes: &'a [u8],
    attributes_mod_time: i64,
}

#[derive(Serialize)]
struct MoveRequest<'a> {
    from: ObjectId,
    to: ObjectId,
    name: &'a EncodedName,
}

#[derive(Deserialize)]
struct IdResponse {
    id: ObjectId,
}

#[derive(Deserialize)]
struct NameResponse {
    elements: Vec<NameElement>,
}

impl StoreSession for StoreClient {
    async fn server_version(&self) -> Result<u32, StoreError> {
        let url = self.endpoint("/v1/version")?;
        let response = self.http.get(url).send().await?;
        let payload: VersionResponse = Self::handle_response(response).await?;
        Ok(payload.version)
    }

    async fn login(&self, account: u32, read_write: bool) -> Result<LoginInfo, StoreError> {
        let url = self.endpoint("/v1/sessions")?;
        let body = LoginRequest {
            account,
            mode: if read_write { "read-write" } else { "read-only" },
        };
        let response = self.http.post(url).json(&body).send().await?;
        let payload: LoginResponse = Self::handle_response(response).await?;
        self.set_session_token(Some(payload.session));
        Ok(payload.info)
    }

    async fn set_client_store_marker(&self, marker: i64) -> Result<(), StoreError> {
        let url = self.endpoint("/v1/sessions/current/marker")?;
        let request = self.authed(self.http.put(url))?;
        let response = request.json(&MarkerRequest { marker }).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<(), StoreError> {
        let url = self.endpoint("/v1/sessions/current")?;
        let request = self.authed(self.http.delete(url))?;
        let response = request.send().await?;
        self.set_session_token(None);
        Self::check_status(response).await?;
        Ok(())
    }

    async fn list_directory(
        &self,
        id: ObjectId,
        filter: ListFilter,
    ) -> Result<DirectoryListing, StoreError> {
        let mut url = self.endpoint(&format!("/v1/directories/{}", id.0))?;
        url.query_pairs_mut()
            .append_pair("include_deleted", bool_param(filter.include_deleted))
            .append_pair("include_old", bool_param(filter.include_old_versions));
        let response = self.authed(self.http.get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn create_directory(
        &self,
        parent: ObjectId,
        name: &EncodedName,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<ObjectId, StoreError> {
        let url = self.endpoint(&format!("/v1/directories/{}/entries", parent.0))?;
        let body = CreateDirectoryRequest {
            name,
            attributes,
            attributes_mod_time,
        };
        let response = self.authed(self.http.post(url))?.json(&body).send().await?;
        let payload: IdResponse = Self::handle_response(response).await?;
        Ok(payload.id)
    }

    async fn change_directory_attributes(
        &self,
        id: ObjectId,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/directories/{}/attributes", id.0))?;
        let body = DirectoryAttributesRequest {
            attributes,
            attributes_mod_time,
        };
        let response = self.authed(self.http.put(url))?.json(&body).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn put_object(&self, upload: ObjectUpload<'_>) -> Result<ObjectId, StoreError> {
        let mut url = self.endpoint(&format!(
            "/v1/directories/{}/files/{}",
            upload.directory.0,
            upload.name.as_path_segment()
        ))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("mod_time", &upload.mod_time.to_string())
                .append_pair("attributes_hash", &upload.attributes_hash.to_string())
                .append_pair("size", &upload.size.to_string());
            if let Some(base) = upload.diff_from {
                query.append_pair("diff_from", &base.0.to_string());
            }
        }
        let response = self
            .authed(self.http.put(url))?
            .header("Content-Type", "application/octet-stream")
            .body(upload.body)
            .send()
            .await?;
        let payload: IdResponse = Self::handle_response(response).await?;

        let index_url = self.endpoint(&format!("/v1/objects/{}/blocks", payload.id.0))?;
        let response = self
            .authed(self.http.put(index_url))?
            .json(upload.block_index)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(payload.id)
    }

    async fn get_object(&self, id: ObjectId) -> Result<Vec<u8>, StoreError> {
        let url = self.endpoint(&format!("/v1/objects/{}", id.0))?;
        let response = self.authed(self.http.get(url))?.send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_block_index(&self, id: ObjectId) -> Result<BlockIndex, StoreError> {
        let url = self.endpoint(&format!("/v1/objects/{}/blocks", id.0))?;
        let response = self.authed(self.http.get(url))?.send().await?;
        Self::handle_response(response).await
    }

    async fn move_object(
        &self,
        id: ObjectId,
        from_directory: ObjectId,
        to_directory: ObjectId,
        new_name: &EncodedName,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/objects/{}/move", id.0))?;
        let body = MoveRequest {
            from: from_directory,
            to: to_directory,
            name: new_name,
        };
        let response = self.authed(self.http.post(url))?.json(&body).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_file(&self, directory: ObjectId, name: &EncodedName) -> Result<(), StoreError> {
        let url = self.endpoint(&format!(
            "/v1/directories/{}/files/{}",
            directory.0,
            name.as_path_segment()
        ))?;
        let response = self.authed(self.http.delete(url))?.send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_directory(&self, id: ObjectId) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/directories/{}", id.0))?;
        let response = self.authed(self.http.delete(url))?.send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn undelete_directory(&self, id: ObjectId) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/directories/{}/undelete", id.0))?;
        let response = self.authed(self.http.post(url))?.send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn get_object_name(
        &self,
        id: ObjectId,
        containing_directory: ObjectId,
    ) -> Result<Vec<NameElement>, StoreError> {
        let mut url = self.endpoint(&format!("/v1/objects/{}/name", id.0))?;
        url.query_pairs_mut()
            .append_pair("containing", &containing_directory.0.to_string());
        let response = self.authed(self.http.get(url))?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let payload: NameResponse = Self::handle_response(response).await?;
        Ok(payload.elements)
    }
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: StatusCode) -> StoreError {
        StoreError::Api {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn storage_full_and_missing_objects_are_not_fatal() {
        assert!(!api(StatusCode::INSUFFICIENT_STORAGE).is_fatal());
        assert!(api(StatusCode::INSUFFICIENT_STORAGE).is_storage_full());
        assert!(!api(StatusCode::NOT_FOUND).is_fatal());
        assert!(!api(StatusCode::BAD_REQUEST).is_fatal());
    }

    #[test]
    fn auth_and_server_failures_are_fatal() {
        assert!(api(StatusCode::UNAUTHORIZED).is_fatal());
        assert!(api(StatusCode::SERVICE_UNAVAILABLE).is_fatal());
        assert!(StoreError::NotLoggedIn.is_fatal());
        assert_eq!(
            api(StatusCode::FORBIDDEN).classification(),
            Some(ApiErrorClass::Auth)
        );
    }

    #[test]
    fn requests_without_session_are_refused() {
        let client = StoreClient::with_base_url("http://127.0.0.1:9").unwrap();
        assert!(!client.is_logged_in());
        let err = client.authed(client.http.get("http://127.0.0.1:9/"));
        assert!(matches!(err, Err(StoreError::NotLoggedIn)));
    }
}
