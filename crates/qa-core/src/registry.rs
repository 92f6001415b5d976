//! Provider registry.
//!
//! Every piece of provider-specific knowledge the harness needs (API bases,
//! required request fields, error shapes, synthetic polling responses, the
//! live create/delete cycle) lives in one `ProviderSpec` entry. Adding a
//! provider means adding one entry to `PROVIDERS`.

use serde_json::{json, Value};
use std::time::Duration;

/// One real create + delete cycle run by the fixture recorder.
pub struct LiveCycle {
    pub create_path: &'static str,
    pub create_body: fn(&str) -> Value,
    /// JSON pointer to the new resource id inside the create response.
    pub id_pointer: &'static str,
    pub delete_path: fn(&str) -> String,
    pub settle: Duration,
}

pub struct ProviderSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub credential_env: &'static str,
    pub base_url_prefixes: &'static [&'static str],
    /// Canonical endpoint for SSH key registration/listing.
    pub ssh_key_path: &'static str,
    /// Canonical endpoint that creates a server.
    pub create_path: &'static str,
    pub required_post_fields: &'static [(&'static str, &'static [&'static str])],
    pub error_shape: fn(&Value) -> bool,
    pub synthetic_active: fn(&str) -> Value,
    pub synthetic_create: fn() -> Value,
    /// Read-only endpoints the recorder snapshots: (fixture name, path).
    pub read_endpoints: &'static [(&'static str, &'static str)],
    pub live_cycle: Option<LiveCycle>,
    pub env_defaults: &'static [(&'static str, &'static str)],
    pub server_name_env: &'static str,
    pub cli_token_command: Option<&'static [&'static str]>,
}

impl ProviderSpec {
    /// Strip a registered API base from `url`, returning the remainder (may be empty).
    pub fn strip_base<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.base_url_prefixes
            .iter()
            .find_map(|prefix| url.strip_prefix(prefix))
            .filter(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
    }

    pub fn primary_base(&self) -> &'static str {
        self.base_url_prefixes[0]
    }

    pub fn required_fields(&self, endpoint: &str) -> &'static [&'static str] {
        self.required_post_fields
            .iter()
            .find(|(path, _)| *path == endpoint)
            .map(|(_, fields)| *fields)
            .unwrap_or(&[])
    }

    /// POST targets that create a billable or persistent resource.
    pub fn is_resource_collection(&self, endpoint: &str) -> bool {
        endpoint == self.create_path || endpoint == self.ssh_key_path
    }

    pub fn is_error_response(&self, value: &Value) -> bool {
        (self.error_shape)(value)
    }

    /// Relative path of the shell library wrapping this provider's API.
    pub fn api_lib_path(&self) -> String {
        format!("{}/lib/common.sh", self.id)
    }
}

pub fn providers() -> &'static [ProviderSpec] {
    PROVIDERS
}

pub fn provider(id: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.id == id)
}

pub fn provider_for_url(url: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.strip_base(url).is_some())
}

/// Numeric ids stay numbers in synthetic payloads; anything else is a string.
fn id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

const MOCK_IP: &str = "192.0.2.10";

static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        id: "hetzner",
        display_name: "Hetzner Cloud",
        credential_env: "HCLOUD_TOKEN",
        base_url_prefixes: &["https://api.hetzner.cloud/v1"],
        ssh_key_path: "/ssh_keys",
        create_path: "/servers",
        required_post_fields: &[
            ("/servers", &["name", "server_type", "image"]),
            ("/ssh_keys", &["name", "public_key"]),
        ],
        error_shape: |v| v.get("error").is_some_and(Value::is_object),
        synthetic_active: |id| {
            json!({"server": {"id": id_value(id), "name": "qa-server", "status": "running",
                "public_net": {"ipv4": {"ip": MOCK_IP}}}})
        },
        synthetic_create: || {
            json!({"server": {"id": 424242, "name": "qa-server", "status": "initializing",
                "public_net": {"ipv4": {"ip": MOCK_IP}}},
                "action": {"id": 1, "command": "create_server", "status": "running"}})
        },
        read_endpoints: &[
            ("ssh_keys", "/ssh_keys"),
            ("server_types", "/server_types"),
            ("locations", "/locations"),
            ("servers", "/servers"),
        ],
        live_cycle: Some(LiveCycle {
            create_path: "/servers",
            create_body: |name| {
                json!({"name": name, "server_type": "cx22", "image": "ubuntu-24.04",
                    "location": "fsn1", "start_after_create": false})
            },
            id_pointer: "/server/id",
            delete_path: |id| format!("/servers/{}", id),
            settle: Duration::from_secs(5),
        }),
        env_defaults: &[("HETZNER_SERVER_TYPE", "cx22"), ("HETZNER_LOCATION", "fsn1")],
        server_name_env: "HETZNER_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "digitalocean",
        display_name: "DigitalOcean",
        credential_env: "DO_API_TOKEN",
        base_url_prefixes: &["https://api.digitalocean.com/v2"],
        ssh_key_path: "/account/keys",
        create_path: "/droplets",
        required_post_fields: &[
            ("/droplets", &["name", "region", "size", "image"]),
            ("/account/keys", &["name", "public_key"]),
        ],
        error_shape: |v| v.get("id").is_some_and(Value::is_string) && v.get("message").is_some(),
        synthetic_active: |id| {
            json!({"droplet": {"id": id_value(id), "name": "qa-server", "status": "active",
                "networks": {"v4": [{"ip_address": MOCK_IP, "type": "public"}]}}})
        },
        synthetic_create: || {
            json!({"droplet": {"id": 424242, "name": "qa-server", "status": "new",
                "networks": {"v4": []}}})
        },
        read_endpoints: &[
            ("account_keys", "/account/keys"),
            ("regions", "/regions"),
            ("sizes", "/sizes"),
            ("droplets", "/droplets"),
        ],
        live_cycle: Some(LiveCycle {
            create_path: "/droplets",
            create_body: |name| {
                json!({"name": name, "region": "nyc3", "size": "s-1vcpu-512mb-10gb",
                    "image": "ubuntu-24-04-x64"})
            },
            id_pointer: "/droplet/id",
            delete_path: |id| format!("/droplets/{}", id),
            settle: Duration::from_secs(10),
        }),
        env_defaults: &[("DO_REGION", "nyc3"), ("DO_DROPLET_SIZE", "s-2vcpu-2gb")],
        server_name_env: "DO_DROPLET_NAME",
        cli_token_command: Some(&["doctl", "auth", "token"]),
    },
    ProviderSpec {
        id: "vultr",
        display_name: "Vultr",
        credential_env: "VULTR_API_KEY",
        base_url_prefixes: &["https://api.vultr.com/v2"],
        ssh_key_path: "/ssh-keys",
        create_path: "/instances",
        required_post_fields: &[
            ("/instances", &["region", "plan", "os_id"]),
            ("/ssh-keys", &["name", "ssh_key"]),
        ],
        error_shape: |v| v.get("error").is_some_and(Value::is_string),
        synthetic_active: |id| {
            json!({"instance": {"id": id, "label": "qa-server", "status": "active",
                "power_status": "running", "server_status": "ok", "main_ip": MOCK_IP}})
        },
        synthetic_create: || {
            json!({"instance": {"id": "cb676a46-66fd-4dfb-b839-443f2e6c0b60",
                "label": "qa-server", "status": "pending", "main_ip": "0.0.0.0"}})
        },
        read_endpoints: &[
            ("ssh_keys", "/ssh-keys"),
            ("regions", "/regions"),
            ("plans", "/plans"),
            ("instances", "/instances"),
        ],
        live_cycle: Some(LiveCycle {
            create_path: "/instances",
            create_body: |name| {
                json!({"region": "ewr", "plan": "vc2-1c-1gb", "os_id": 2284, "label": name})
            },
            id_pointer: "/instance/id",
            delete_path: |id| format!("/instances/{}", id),
            settle: Duration::from_secs(10),
        }),
        env_defaults: &[("VULTR_REGION", "ewr"), ("VULTR_PLAN", "vc2-2c-4gb")],
        server_name_env: "VULTR_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "linode",
        display_name: "Linode",
        credential_env: "LINODE_API_TOKEN",
        base_url_prefixes: &["https://api.linode.com/v4"],
        ssh_key_path: "/profile/sshkeys",
        create_path: "/linode/instances",
        required_post_fields: &[
            ("/linode/instances", &["region", "type", "image", "root_pass"]),
            ("/profile/sshkeys", &["label", "ssh_key"]),
        ],
        error_shape: |v| v.get("errors").is_some_and(Value::is_array),
        synthetic_active: |id| {
            json!({"id": id_value(id), "label": "qa-server", "status": "running",
                "ipv4": [MOCK_IP]})
        },
        synthetic_create: || {
            json!({"id": 424242, "label": "qa-server", "status": "provisioning",
                "ipv4": [MOCK_IP]})
        },
        read_endpoints: &[
            ("profile_sshkeys", "/profile/sshkeys"),
            ("regions", "/regions"),
            ("linode_types", "/linode/types"),
            ("linode_instances", "/linode/instances"),
        ],
        live_cycle: Some(LiveCycle {
            create_path: "/linode/instances",
            create_body: |name| {
                json!({"region": "us-east", "type": "g6-nanode-1", "image": "linode/ubuntu24.04",
                    "label": name, "root_pass": "Qa-Record-Only-0000!", "booted": false})
            },
            id_pointer: "/id",
            delete_path: |id| format!("/linode/instances/{}", id),
            settle: Duration::from_secs(10),
        }),
        env_defaults: &[("LINODE_REGION", "us-east"), ("LINODE_TYPE", "g6-standard-2")],
        server_name_env: "LINODE_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "lambda",
        display_name: "Lambda Cloud",
        credential_env: "LAMBDA_API_KEY",
        base_url_prefixes: &["https://cloud.lambdalabs.com/api/v1", "https://cloud.lambda.ai/api/v1"],
        ssh_key_path: "/ssh-keys",
        create_path: "/instance-operations/launch",
        required_post_fields: &[
            ("/instance-operations/launch", &["region_name", "instance_type_name", "ssh_key_names"]),
            ("/ssh-keys", &["name"]),
        ],
        error_shape: |v| v.get("error").is_some_and(Value::is_object),
        synthetic_active: |id| {
            json!({"data": {"id": id, "name": "qa-server", "status": "active", "ip": MOCK_IP}})
        },
        synthetic_create: || json!({"data": {"instance_ids": ["0920582c7ff041399e34823a0be62549"]}}),
        read_endpoints: &[
            ("ssh_keys", "/ssh-keys"),
            ("instance_types", "/instance-types"),
            ("instances", "/instances"),
        ],
        live_cycle: None,
        env_defaults: &[("LAMBDA_REGION", "us-east-1"), ("LAMBDA_INSTANCE_TYPE", "gpu_1x_a10")],
        server_name_env: "LAMBDA_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "civo",
        display_name: "Civo",
        credential_env: "CIVO_API_TOKEN",
        base_url_prefixes: &["https://api.civo.com/v2"],
        ssh_key_path: "/sshkeys",
        create_path: "/instances",
        required_post_fields: &[
            ("/instances", &["hostname", "size", "template_id"]),
            ("/sshkeys", &["name", "public_key"]),
        ],
        error_shape: |v| v.get("code").is_some() && v.get("reason").is_some(),
        synthetic_active: |id| {
            json!({"id": id, "hostname": "qa-server", "status": "ACTIVE", "public_ip": MOCK_IP})
        },
        synthetic_create: || {
            json!({"id": "b2d3f1c4-5e6f-4c1a-9a55-3c9e6a8f2d11", "hostname": "qa-server",
                "status": "BUILDING"})
        },
        read_endpoints: &[
            ("sshkeys", "/sshkeys"),
            ("sizes", "/sizes"),
            ("disk_images", "/disk_images"),
            ("instances", "/instances"),
        ],
        live_cycle: Some(LiveCycle {
            create_path: "/instances",
            create_body: |name| {
                json!({"hostname": name, "size": "g3.xsmall", "template_id": "ubuntu-jammy",
                    "region": "LON1"})
            },
            id_pointer: "/id",
            delete_path: |id| format!("/instances/{}", id),
            settle: Duration::from_secs(10),
        }),
        env_defaults: &[("CIVO_REGION", "LON1"), ("CIVO_SIZE", "g3.small")],
        server_name_env: "CIVO_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "binarylane",
        display_name: "BinaryLane",
        credential_env: "BINARYLANE_API_TOKEN",
        base_url_prefixes: &["https://api.binarylane.com.au/v2"],
        ssh_key_path: "/account/keys",
        create_path: "/servers",
        required_post_fields: &[
            ("/servers", &["name", "size", "image", "region"]),
            ("/account/keys", &["name", "public_key"]),
        ],
        error_shape: |v| v.get("title").is_some() && v.get("status").is_some_and(Value::is_number),
        synthetic_active: |id| {
            json!({"server": {"id": id_value(id), "name": "qa-server", "status": "active",
                "networks": {"v4": [{"ip_address": MOCK_IP, "type": "public"}]}}})
        },
        synthetic_create: || json!({"server": {"id": 424242, "name": "qa-server", "status": "new"}}),
        read_endpoints: &[
            ("account_keys", "/account/keys"),
            ("sizes", "/sizes"),
            ("regions", "/regions"),
            ("servers", "/servers"),
        ],
        live_cycle: None,
        env_defaults: &[("BINARYLANE_REGION", "syd"), ("BINARYLANE_SIZE", "std-2vcpu")],
        server_name_env: "BINARYLANE_SERVER_NAME",
        cli_token_command: None,
    },
    ProviderSpec {
        id: "genesiscloud",
        display_name: "Genesis Cloud",
        credential_env: "GENESIS_API_KEY",
        base_url_prefixes: &["https://api.genesiscloud.com/compute/v1"],
        ssh_key_path: "/ssh-keys",
        create_path: "/instances",
        required_post_fields: &[
            ("/instances", &["name", "hostname", "type", "image", "ssh_keys"]),
            ("/ssh-keys", &["name", "value"]),
        ],
        error_shape: |v| v.get("code").is_some() && v.get("message").is_some(),
        synthetic_active: |id| {
            json!({"instance": {"id": id, "name": "qa-server", "status": "active",
                "public_ip": MOCK_IP}})
        },
        synthetic_create: || {
            json!({"instance": {"id": "6b1e6f0c-3d2a-4f6a-8e0c-1f2e3d4c5b6a", "status": "enqueued"}})
        },
        read_endpoints: &[
            ("ssh_keys", "/ssh-keys"),
            ("instances", "/instances"),
            ("images", "/images"),
        ],
        live_cycle: None,
        env_defaults: &[
            ("GENESIS_REGION", "ARC-IS-HAF-1"),
            ("GENESIS_INSTANCE_TYPE", "vcpu-2_memory-4g"),
        ],
        server_name_env: "GENESIS_SERVER_NAME",
        cli_token_command: None,
    },
];
