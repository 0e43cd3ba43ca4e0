//! HTTP implementation of the client adapter on top of reqwest
//!
//! Requests are authenticated with a superuser JWT signed with the
//! deployment's JWT secret and, when TLS is enabled, verified against the
//! deployment's CA.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::{
    ArangoError, ArangoResult, BackupClient, BackupMeta, ClientFactory, CreateBackupRequest,
    MemberClient, TransferProgress, TransferTarget,
};
use crate::crd::{ArangoDeployment, ServerGroup};
use crate::resources::common::{deployment_dns_name, member_dns_name};

/// Port every arangod member listens on
pub const ARANGOD_PORT: u16 = 8529;

/// Key of the JWT secret value inside its secret
pub const SECRET_KEY_TOKEN: &str = "token";

/// Key of the CA certificate inside the CA secret
pub const SECRET_KEY_CA_CERT: &str = "ca.crt";

/// Creates HTTP clients for deployments
#[derive(Clone)]
pub struct HttpClientFactory {
    client: Client,
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn connection(&self, deployment: &ArangoDeployment) -> ArangoResult<Arc<Connection>> {
        let name = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let mut builder = reqwest::Client::builder().timeout(self.timeout);

        let scheme = match deployment.spec.tls_ca_secret_name(&name) {
            Some(ca_secret) => {
                let pem = secret_value(&secrets, &ca_secret, SECRET_KEY_CA_CERT).await?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| ArangoError::MissingCredentials(e.to_string()))?;
                builder = builder.add_root_certificate(cert);
                "https"
            }
            None => "http",
        };

        let token = match deployment.spec.jwt_secret_name(&name) {
            Some(jwt_secret) => {
                let secret = secret_value(&secrets, &jwt_secret, SECRET_KEY_TOKEN).await?;
                Some(sign_jwt(&secret)?)
            }
            None => None,
        };

        let http = builder
            .build()
            .map_err(|e| ArangoError::Connection(e.to_string()))?;

        Ok(Arc::new(Connection {
            http,
            scheme,
            deployment: name,
            namespace,
            token,
            secrets,
        }))
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn member_client(
        &self,
        deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn MemberClient>> {
        let connection: Arc<dyn MemberClient> = self.connection(deployment).await?;
        Ok(connection)
    }

    async fn backup_client(
        &self,
        deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn BackupClient>> {
        let connection: Arc<dyn BackupClient> = self.connection(deployment).await?;
        Ok(connection)
    }
}

/// Read one key of a secret, mapping absence to missing credentials
async fn secret_value(secrets: &Api<Secret>, name: &str, key: &str) -> ArangoResult<Vec<u8>> {
    let secret = secrets.get_opt(name).await.map_err(|e| match e {
        kube::Error::Api(resp) => ArangoError::Response {
            code: resp.code,
            error_num: 0,
            message: resp.message,
        },
        other => ArangoError::Connection(other.to_string()),
    })?;
    let secret =
        secret.ok_or_else(|| ArangoError::MissingCredentials(format!("secret {} not found", name)))?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .ok_or_else(|| {
            ArangoError::MissingCredentials(format!("secret {} has no key {}", name, key))
        })
}

/// Claims of the superuser token arangod accepts
#[derive(Debug, Serialize, Deserialize)]
struct SuperuserClaims {
    iss: String,
    server_id: String,
}

/// Sign a superuser JWT the way arangod expects it
pub fn sign_jwt(secret: &[u8]) -> ArangoResult<String> {
    let claims = SuperuserClaims {
        iss: "arangodb".to_string(),
        server_id: "arango-operator".to_string(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| ArangoError::MissingCredentials(format!("signing JWT: {}", e)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_num: i64,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
struct ResultBody<T> {
    result: T,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BackupEntry {
    id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    datetime: String,
    #[serde(default)]
    size_in_bytes: Option<u64>,
    #[serde(default, rename = "nrDBServers")]
    nr_db_servers: Option<u32>,
    #[serde(default)]
    potentially_inconsistent: bool,
}

impl From<BackupEntry> for BackupMeta {
    fn from(e: BackupEntry) -> Self {
        BackupMeta {
            id: e.id,
            version: e.version,
            datetime: e.datetime,
            size_in_bytes: e.size_in_bytes,
            number_of_dbservers: e.nr_db_servers,
            potentially_inconsistent: e.potentially_inconsistent,
        }
    }
}

#[derive(Deserialize, Default)]
struct BackupList {
    #[serde(default)]
    list: BTreeMap<String, BackupEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferStarted {
    #[serde(alias = "uploadId", alias = "downloadId")]
    job_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ServerTransfer {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    progress: Option<TransferCount>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct TransferCount {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    done: u64,
}

#[derive(Deserialize, Default)]
struct TransferStatus {
    #[serde(default, rename = "DBServers")]
    db_servers: BTreeMap<String, ServerTransfer>,
}

/// Summarise per db-server job states into one progress value
fn summarize_transfer(job_id: &str, status: TransferStatus) -> TransferProgress {
    let mut total = 0u64;
    let mut done = 0u64;
    let mut completed = true;
    for (server, transfer) in status.db_servers {
        match transfer.status.as_str() {
            "FAILED" | "CANCELLED" => {
                return TransferProgress::Failed {
                    message: format!(
                        "job {} failed on {}: {}",
                        job_id,
                        server,
                        transfer.error.unwrap_or_default()
                    ),
                };
            }
            "COMPLETED" => {}
            _ => completed = false,
        }
        if let Some(p) = transfer.progress {
            total += p.total;
            done += p.done;
        }
    }
    if completed {
        return TransferProgress::Completed;
    }
    let percent = if total == 0 {
        0
    } else {
        ((done * 100) / total).min(100) as u8
    };
    TransferProgress::Running { percent }
}

struct Connection {
    http: reqwest::Client,
    scheme: &'static str,
    deployment: String,
    namespace: String,
    token: Option<String>,
    secrets: Api<Secret>,
}

impl Connection {
    fn cluster_url(&self, path: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme,
            deployment_dns_name(&self.deployment, &self.namespace),
            ARANGOD_PORT,
            path
        )
    }

    fn member_url(&self, group: ServerGroup, member_id: &str, path: &str) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme,
            member_dns_name(&self.deployment, &self.namespace, group, member_id),
            ARANGOD_PORT,
            path
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> ArangoResult<T> {
        debug!(%method, %url, "ArangoDB request");
        let mut request = self.http.request(method, &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let parsed: Option<ErrorBody> = serde_json::from_slice(&bytes).ok();
            return Err(ArangoError::Response {
                code: status.as_u16(),
                error_num: parsed.as_ref().map(|p| p.error_num).unwrap_or(0),
                message: parsed
                    .map(|p| p.error_message)
                    .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned()),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ArangoError::InvalidResponse(e.to_string()))
    }

    async fn list_backups(&self, id: Option<&str>) -> ArangoResult<BackupList> {
        let body = match id {
            Some(id) => json!({ "id": id }),
            None => json!({}),
        };
        let result: ResultBody<BackupList> = self
            .call(Method::POST, self.cluster_url("/_admin/backup/list"), Some(body))
            .await?;
        Ok(result.result)
    }

    async fn transfer_config(&self, target: &TransferTarget) -> ArangoResult<Value> {
        let Some(secret_name) = &target.credentials_secret_name else {
            return Ok(json!({}));
        };
        let raw = secret_value(&self.secrets, secret_name, SECRET_KEY_TOKEN).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            ArangoError::MissingCredentials(format!(
                "secret {} does not hold a JSON repository config: {}",
                secret_name, e
            ))
        })
    }

    async fn transfer_progress(
        &self,
        path: &str,
        key: &str,
        job_id: &str,
    ) -> ArangoResult<TransferProgress> {
        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), Value::String(job_id.to_string()));
        let result: ResultBody<TransferStatus> = self
            .call(Method::POST, self.cluster_url(path), Some(Value::Object(body)))
            .await?;
        Ok(summarize_transfer(job_id, result.result))
    }
}

#[async_trait]
impl MemberClient for Connection {
    async fn clean_out_server(&self, member_id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/cluster/cleanOutServer"),
                Some(json!({ "server": member_id })),
            )
            .await?;
        Ok(())
    }

    async fn is_cleaned_out(&self, member_id: &str) -> ArangoResult<bool> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct NumberOfServers {
            #[serde(default)]
            cleaned_servers: Vec<String>,
        }
        let result: NumberOfServers = self
            .call(
                Method::GET,
                self.cluster_url("/_admin/cluster/numberOfServers"),
                None,
            )
            .await?;
        Ok(result.cleaned_servers.iter().any(|s| s == member_id))
    }

    async fn shutdown_member(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::DELETE,
                self.member_url(group, member_id, "/_admin/shutdown"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn remove_server(&self, member_id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/cluster/removeServer"),
                Some(Value::String(member_id.to_string())),
            )
            .await?;
        Ok(())
    }

    async fn refresh_jwt(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                self.member_url(group, member_id, "/_admin/server/jwt"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn refresh_tls(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                self.member_url(group, member_id, "/_admin/server/tls"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_user_password(&self, user: &str, password: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::PATCH,
                self.cluster_url(&format!("/_api/user/{}", user)),
                Some(json!({ "passwd": password })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupClient for Connection {
    async fn get_backup(&self, id: &str) -> ArangoResult<BackupMeta> {
        let mut list = self.list_backups(Some(id)).await?;
        list.list
            .remove(id)
            .map(BackupMeta::from)
            .ok_or_else(|| ArangoError::Response {
                code: 404,
                error_num: super::error::ERROR_HOT_BACKUP_NOT_FOUND,
                message: format!("backup {} not found", id),
            })
    }

    async fn find_backup(&self, label: &str) -> ArangoResult<Option<BackupMeta>> {
        let suffix = format!("_{}", label);
        let list = self.list_backups(None).await?;
        Ok(list
            .list
            .into_values()
            .find(|b| b.id.ends_with(&suffix))
            .map(BackupMeta::from))
    }

    async fn create_backup(&self, request: &CreateBackupRequest) -> ArangoResult<BackupMeta> {
        let mut body = json!({
            "label": request.label,
            "allowInconsistent": request.allow_inconsistent,
        });
        if let Some(timeout) = request.timeout {
            body["timeout"] = json!(timeout);
        }
        let result: ResultBody<BackupEntry> = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/backup/create"),
                Some(body),
            )
            .await?;
        let created = result.result;
        // The create response omits the version, the listing has it
        match self.get_backup(&created.id).await {
            Ok(meta) => Ok(meta),
            Err(_) => Ok(created.into()),
        }
    }

    async fn upload_backup(&self, id: &str, target: &TransferTarget) -> ArangoResult<String> {
        let config = self.transfer_config(target).await?;
        let result: ResultBody<TransferStarted> = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/backup/upload"),
                Some(json!({
                    "id": id,
                    "remoteRepository": target.repository_url,
                    "config": config,
                })),
            )
            .await?;
        Ok(result.result.job_id)
    }

    async fn download_backup(&self, id: &str, source: &TransferTarget) -> ArangoResult<String> {
        let config = self.transfer_config(source).await?;
        let result: ResultBody<TransferStarted> = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/backup/download"),
                Some(json!({
                    "id": id,
                    "remoteRepository": source.repository_url,
                    "config": config,
                })),
            )
            .await?;
        Ok(result.result.job_id)
    }

    async fn upload_progress(&self, job_id: &str) -> ArangoResult<TransferProgress> {
        self.transfer_progress("/_admin/backup/upload", "uploadId", job_id)
            .await
    }

    async fn download_progress(&self, job_id: &str) -> ArangoResult<TransferProgress> {
        self.transfer_progress("/_admin/backup/download", "downloadId", job_id)
            .await
    }

    async fn delete_backup(&self, id: &str) -> ArangoResult<()> {
        let _: Value = self
            .call(
                Method::POST,
                self.cluster_url("/_admin/backup/delete"),
                Some(json!({ "id": id })),
            )
            .await?;
        Ok(())
    }
}
