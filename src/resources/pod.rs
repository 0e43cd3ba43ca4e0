//! Member pod generation
//!
//! Every member runs in its own pod so the operator controls exactly which
//! member restarts, rotates or leaves. The pod carries a hash of the inputs
//! that shape it; a differing hash is what triggers a rotation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::arangod::http::{ARANGOD_PORT, SECRET_KEY_TOKEN};
use crate::controller::features::Feature;
use crate::crd::{
    ArangoDeployment, DeploymentMode, DeploymentSpec, DeploymentStatus, Environment, ImageInfo,
    MemberStatus, ResourceList, ServerGroup, StorageEngine,
};
use crate::resources::common::{
    ANNOTATION_TEMPLATE_HASH, LABEL_DEPLOYMENT, LABEL_ROLE, member_dns_name, member_labels,
    member_pod_name, member_tls_secret_name, owner_reference,
};
use crate::resources::pvc::member_claim_name;

const DATA_PATH: &str = "/data";
const JWT_FOLDER_PATH: &str = "/secrets/cluster/jwt";
const TLS_KEYFILE_PATH: &str = "/secrets/tls";
const TLS_KEYFILE_KEY: &str = "tls.keyfile";
const JWT_ENV: &str = "ARANGOD_JWT_SECRET";

/// Key of the member TLS secret holding certificate and private key
pub const SECRET_KEY_TLS_KEYFILE: &str = TLS_KEYFILE_KEY;

/// How arangod receives the cluster JWT secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JwtMode {
    Disabled,
    /// Plain argument from an environment variable
    Env,
    /// Single keyfile
    Keyfile,
    /// Folder with active and passive secrets, reloadable at runtime
    Folder,
}

fn jwt_mode(spec: &DeploymentSpec, image: &ImageInfo) -> JwtMode {
    if !spec.is_authenticated() {
        JwtMode::Disabled
    } else if Feature::JwtRotation.supported_by(image) {
        JwtMode::Folder
    } else if Feature::JwtSecretKeyfile.supported_by(image) {
        JwtMode::Keyfile
    } else {
        JwtMode::Env
    }
}

fn scheme(deployment: &ArangoDeployment) -> &'static str {
    if deployment.spec.is_secure() {
        "ssl"
    } else {
        "tcp"
    }
}

/// Command line of the arangod process of a member
fn arangod_args(
    deployment: &ArangoDeployment,
    status: &DeploymentStatus,
    group: ServerGroup,
    member: &MemberStatus,
    image: &ImageInfo,
) -> Vec<String> {
    let name = deployment.name_any();
    let ns = deployment.namespace().unwrap_or_default();
    let spec = &deployment.spec;
    let scheme = scheme(deployment);
    let endpoint_of = |g: ServerGroup, id: &str| {
        format!(
            "{}://{}:{}",
            scheme,
            member_dns_name(&name, &ns, g, id),
            ARANGOD_PORT
        )
    };

    let mut args = vec![
        format!("--server.endpoint={}://[::]:{}", scheme, ARANGOD_PORT),
        format!("--database.directory={}", DATA_PATH),
        "--log.output=+".to_string(),
    ];

    let engine = match spec.storage_engine() {
        StorageEngine::RocksDB => "rocksdb",
        StorageEngine::MmFiles => "mmfiles",
    };
    args.push(format!("--server.storage-engine={}", engine));

    match jwt_mode(spec, image) {
        JwtMode::Disabled => args.push("--server.authentication=false".to_string()),
        JwtMode::Env => {
            args.push("--server.authentication=true".to_string());
            args.push(format!("--server.jwt-secret=$({})", JWT_ENV));
        }
        JwtMode::Keyfile => {
            args.push("--server.authentication=true".to_string());
            args.push(format!(
                "--server.jwt-secret-keyfile={}/{}",
                JWT_FOLDER_PATH, SECRET_KEY_TOKEN
            ));
        }
        JwtMode::Folder => {
            args.push("--server.authentication=true".to_string());
            args.push(format!("--server.jwt-secret-folder={}", JWT_FOLDER_PATH));
        }
    }

    if spec.is_secure() {
        args.push(format!(
            "--ssl.keyfile={}/{}",
            TLS_KEYFILE_PATH, TLS_KEYFILE_KEY
        ));
        args.push("--ssl.ecdh-curve=".to_string());
    }

    let agents: Vec<String> = status
        .members
        .group(ServerGroup::Agents)
        .iter()
        .filter(|a| a.id != member.id)
        .map(|a| endpoint_of(ServerGroup::Agents, &a.id))
        .collect();

    match group {
        ServerGroup::Agents => {
            args.push("--agency.activate=true".to_string());
            args.push(format!(
                "--agency.size={}",
                spec.group_count(ServerGroup::Agents)
            ));
            args.push("--agency.supervision=true".to_string());
            args.push("--agency.disaster-recovery-id=".to_string() + &member.id);
            args.push(format!(
                "--agency.my-address={}",
                endpoint_of(group, &member.id)
            ));
            for endpoint in &agents {
                args.push(format!("--agency.endpoint={}", endpoint));
            }
        }
        ServerGroup::Single => {
            if spec.mode() == DeploymentMode::ActiveFailover {
                args.push("--replication.automatic-failover=true".to_string());
                args.push("--cluster.my-role=SINGLE".to_string());
                args.push(format!(
                    "--cluster.my-address={}",
                    endpoint_of(group, &member.id)
                ));
                for endpoint in &agents {
                    args.push(format!("--cluster.agency-endpoint={}", endpoint));
                }
            }
        }
        ServerGroup::DbServers | ServerGroup::Coordinators => {
            let role = if group == ServerGroup::DbServers {
                "PRIMARY"
            } else {
                "COORDINATOR"
            };
            args.push(format!("--cluster.my-role={}", role));
            args.push(format!(
                "--cluster.my-address={}",
                endpoint_of(group, &member.id)
            ));
            for endpoint in &agents {
                args.push(format!("--cluster.agency-endpoint={}", endpoint));
            }
        }
        ServerGroup::SyncMasters | ServerGroup::SyncWorkers => {
            for endpoint in &agents {
                args.push(format!("--cluster.agency-endpoint={}", endpoint));
            }
        }
    }

    args.extend(spec.group_spec(group).args.iter().cloned());
    args
}

fn server_command(group: ServerGroup) -> Vec<String> {
    if !group.is_arangosync() {
        return vec!["/usr/sbin/arangod".to_string()];
    }
    let kind = if group == ServerGroup::SyncMasters {
        "master"
    } else {
        "worker"
    };
    vec![
        "/usr/sbin/arangosync".to_string(),
        "run".to_string(),
        kind.to_string(),
    ]
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Spread members of one group across nodes; required in Production
fn anti_affinity(deployment_name: &str, group: ServerGroup, environment: Environment) -> Affinity {
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: LABEL_DEPLOYMENT.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![deployment_name.to_string()]),
                },
                LabelSelectorRequirement {
                    key: LABEL_ROLE.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![group.role().to_string()]),
                },
            ]),
            ..Default::default()
        }),
        topology_key: "kubernetes.io/hostname".to_string(),
        ..Default::default()
    };

    let pod_anti_affinity = match environment {
        Environment::Production => PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term]),
            ..Default::default()
        },
        Environment::Development => PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: term,
                },
            ]),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(pod_anti_affinity),
        ..Default::default()
    }
}

/// Hash of everything that shapes a member pod except its peers
///
/// Peers are left out so adding an agent does not rotate every other member.
pub fn template_hash(
    spec: &DeploymentSpec,
    group: ServerGroup,
    member: &MemberStatus,
    image: &ImageInfo,
) -> String {
    let group_spec = spec.group_spec(group);
    let inputs = json!({
        "image": image.image,
        "pullPolicy": spec.image_pull_policy,
        "mode": spec.mode(),
        "environment": spec.environment(),
        "storageEngine": spec.storage_engine(),
        "jwt": format!("{:?}", jwt_mode(spec, image)),
        "tls": spec.is_secure(),
        "args": group_spec.args,
        "resources": group_spec.resources,
        "memoryOverride": group_spec.override_detected_total_memory,
        "sidecars": member.side_car_specs,
    });

    let mut hasher = Sha256::new();
    hasher.update(inputs.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate the pod of a member
pub fn build_member_pod(
    deployment: &ArangoDeployment,
    status: &DeploymentStatus,
    group: ServerGroup,
    member: &MemberStatus,
    image: &ImageInfo,
) -> Pod {
    let name = deployment.name_any();
    let spec = &deployment.spec;
    let group_spec = spec.group_spec(group);
    let pod_name = member
        .pod_name
        .clone()
        .unwrap_or_else(|| member_pod_name(&name, group, &member.id));

    let mut env = Vec::new();
    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();

    if group.has_volume() {
        volumes.push(Volume {
            name: "arangod-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: member_claim_name(&name, group, member),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "arangod-data".to_string(),
            mount_path: DATA_PATH.to_string(),
            ..Default::default()
        });
    }

    if let Some(jwt_secret) = spec.jwt_secret_name(&name) {
        match jwt_mode(spec, image) {
            JwtMode::Env => env.push(EnvVar {
                name: JWT_ENV.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: jwt_secret,
                        key: SECRET_KEY_TOKEN.to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            JwtMode::Keyfile | JwtMode::Folder => {
                volumes.push(Volume {
                    name: "cluster-jwt".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(jwt_secret),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                volume_mounts.push(VolumeMount {
                    name: "cluster-jwt".to_string(),
                    mount_path: JWT_FOLDER_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
            JwtMode::Disabled => {}
        }
    }

    if spec.is_secure() {
        volumes.push(Volume {
            name: "tls-keyfile".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(member_tls_secret_name(&name, group, &member.id)),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "tls-keyfile".to_string(),
            mount_path: TLS_KEYFILE_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if group_spec.override_detected_total_memory.unwrap_or(false) {
        if let Some(memory) = group_spec
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.memory.clone())
        {
            env.push(EnvVar {
                name: "ARANGODB_OVERRIDE_DETECTED_TOTAL_MEMORY".to_string(),
                value: Some(memory),
                ..Default::default()
            });
        }
    }

    // arangod answers unauthenticated HTTP with 401, so probes only check the port
    let probe = |initial_delay: i32, failure_threshold: i32| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(ARANGOD_PORT as i32),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let container = Container {
        name: "server".to_string(),
        image: Some(image.image.clone()),
        image_pull_policy: spec.image_pull_policy.clone(),
        command: Some(server_command(group)),
        args: Some(arangod_args(deployment, status, group, member, image)),
        ports: Some(vec![ContainerPort {
            container_port: ARANGOD_PORT as i32,
            name: Some("server".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        resources: group_spec.resources.as_ref().map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        }),
        readiness_probe: Some(probe(2, 3)),
        liveness_probe: Some(probe(30, 6)),
        ..Default::default()
    };

    let mut containers = vec![container];
    for (sidecar, sidecar_image) in &member.side_car_specs {
        containers.push(Container {
            name: sidecar.clone(),
            image: Some(sidecar_image.clone()),
            ..Default::default()
        });
    }

    let annotations = BTreeMap::from([(
        ANNOTATION_TEMPLATE_HASH.to_string(),
        template_hash(spec, group, member, image),
    )]);

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: deployment.namespace(),
            labels: Some(member_labels(&name, group, &member.id)),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(pod_name),
            subdomain: Some(crate::resources::common::internal_service_name(&name)),
            containers,
            volumes: (!volumes.is_empty()).then_some(volumes),
            affinity: Some(anti_affinity(&name, group, spec.environment())),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(if group == ServerGroup::DbServers {
                3600
            } else {
                60
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
