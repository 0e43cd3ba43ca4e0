use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::arangod::http::SECRET_KEY_TOKEN;
use crate::crd::ArangoDeployment;
use crate::resources::common::{owner_reference, standard_labels};

/// Length of generated JWT secrets
const JWT_SECRET_LENGTH: usize = 64;

/// Key of the password inside a user password secret
pub const SECRET_KEY_PASSWORD: &str = "password";

/// Generate a random token
fn generate_token(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdef0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate the JWT secret of a deployment that has none yet
pub fn generate_jwt_secret(deployment: &ArangoDeployment, name: &str) -> Secret {
    let deployment_name = deployment.name_any();

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: deployment.namespace(),
            labels: Some(standard_labels(&deployment_name)),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            SECRET_KEY_TOKEN.to_string(),
            generate_token(JWT_SECRET_LENGTH),
        )])),
        ..Default::default()
    }
}

/// SHA-256 over all keys and values of a secret, in key order
pub fn hash_secret(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(&value.0);
            hasher.update([0u8]);
        }
    }
    hex::encode(hasher.finalize())
}

/// Read a value of a secret as UTF-8
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}
