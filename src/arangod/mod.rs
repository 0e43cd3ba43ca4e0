//! Client adapter for the administrative API of a running ArangoDB deployment
//!
//! The reconcilers only talk to ArangoDB through the [`MemberClient`] and
//! [`BackupClient`] traits. [`ClientFactory`] builds them for a deployment so
//! tests can substitute in-memory fakes.

pub mod error;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::crd::{ArangoDeployment, ServerGroup};

pub use error::ArangoError;
pub use http::HttpClientFactory;

pub type ArangoResult<T> = std::result::Result<T, ArangoError>;

/// Metadata of a hot backup as reported by the database
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackupMeta {
    pub id: String,
    pub version: String,
    /// RFC3339 creation time
    pub datetime: String,
    pub size_in_bytes: Option<u64>,
    pub number_of_dbservers: Option<u32>,
    pub potentially_inconsistent: bool,
}

/// Parameters of a hot backup creation
#[derive(Clone, Debug, PartialEq)]
pub struct CreateBackupRequest {
    /// Label derived from the backup object; identical retries reuse it
    pub label: String,
    pub timeout: Option<f64>,
    pub allow_inconsistent: bool,
}

/// Remote repository a backup is copied to or from
#[derive(Clone, Debug, PartialEq)]
pub struct TransferTarget {
    pub repository_url: String,
    pub credentials_secret_name: Option<String>,
}

/// State of an asynchronous upload or download job
#[derive(Clone, Debug, PartialEq)]
pub enum TransferProgress {
    Running { percent: u8 },
    Completed,
    Failed { message: String },
}

/// Cluster administration calls used by the plan executor
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Ask the cluster to move all shards off a db-server
    async fn clean_out_server(&self, member_id: &str) -> ArangoResult<()>;

    async fn is_cleaned_out(&self, member_id: &str) -> ArangoResult<bool>;

    /// Gracefully stop a member process
    async fn shutdown_member(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()>;

    /// Remove a server from the cluster health records
    async fn remove_server(&self, member_id: &str) -> ArangoResult<()>;

    /// Make a member reload its JWT secrets from disk
    async fn refresh_jwt(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()>;

    /// Make a member reload its TLS keyfile from disk
    async fn refresh_tls(&self, group: ServerGroup, member_id: &str) -> ArangoResult<()>;

    async fn set_user_password(&self, user: &str, password: &str) -> ArangoResult<()>;
}

/// Hot backup calls used by the backup state machine
#[async_trait]
pub trait BackupClient: Send + Sync {
    async fn get_backup(&self, id: &str) -> ArangoResult<BackupMeta>;

    /// Look up a backup created with the given label
    async fn find_backup(&self, label: &str) -> ArangoResult<Option<BackupMeta>>;

    async fn create_backup(&self, request: &CreateBackupRequest) -> ArangoResult<BackupMeta>;

    /// Start copying a backup to a remote repository, returns the job id
    async fn upload_backup(&self, id: &str, target: &TransferTarget) -> ArangoResult<String>;

    /// Start fetching a backup from a remote repository, returns the job id
    async fn download_backup(&self, id: &str, source: &TransferTarget) -> ArangoResult<String>;

    async fn upload_progress(&self, job_id: &str) -> ArangoResult<TransferProgress>;

    async fn download_progress(&self, job_id: &str) -> ArangoResult<TransferProgress>;

    async fn delete_backup(&self, id: &str) -> ArangoResult<()>;
}

/// Builds clients bound to one deployment
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn member_client(
        &self,
        deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn MemberClient>>;

    async fn backup_client(
        &self,
        deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn BackupClient>>;
}
