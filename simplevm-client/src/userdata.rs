//! Boot userdata assembly.
//!
//! cloud-init executes the blob as a shell script, so the order of the parts
//! is load-bearing: unlock the login user first, then authorized keys, then
//! volume mounts, then the metadata token, then any caller-supplied extra
//! script. Substitution into the script templates is literal.

use crate::proto::VolumePath;

const UNLOCK_USER_SCRIPT: &str = include_str!("../scripts/unlock_user.sh");
const ADD_KEYS_SCRIPT: &str = include_str!("../scripts/add_keys_to_authorized.sh");
const MOUNT_SCRIPT: &str = include_str!("../scripts/mount.sh");
const METADATA_TOKEN_SCRIPT: &str = include_str!("../scripts/metadata_token.sh");

#[derive(Debug, Default)]
pub struct UserdataParams<'a> {
    pub additional_keys: &'a [String],
    pub new_volumes: &'a [VolumePath],
    pub attach_volumes: &'a [VolumePath],
    pub metadata_token: Option<&'a str>,
    pub metadata_endpoint: Option<&'a str>,
    pub additional_script: Option<&'a str>,
}

fn bash_array_quoted<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::from("(");
    for item in items {
        out.push('"');
        out.push_str(item);
        out.push_str("\" ");
    }
    out.push(')');
    out
}

fn bash_array<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::from("(");
    for item in items {
        out.push_str(item);
        out.push(' ');
    }
    out.push(')');
    out
}

/// The guest sees attached volumes under /dev/disk/by-id as `virtio-` plus
/// the first 20 characters of the volume id.
fn device_id(volume_id: &str) -> String {
    format!("virtio-{}", volume_id.chars().take(20).collect::<String>())
}

fn add_keys_script(keys: &[String]) -> String {
    ADD_KEYS_SCRIPT.replace(
        "KEYS_TO_ADD",
        &bash_array_quoted(keys.iter().map(String::as_str)),
    )
}

fn mount_script(new_volumes: &[VolumePath], attach_volumes: &[VolumePath]) -> String {
    let ids_new: Vec<String> = new_volumes.iter().map(|v| device_id(&v.openstack_id)).collect();
    let ids_attach: Vec<String> =
        attach_volumes.iter().map(|v| device_id(&v.openstack_id)).collect();
    MOUNT_SCRIPT
        .replace(
            "VOLUME_IDS_NEW",
            &bash_array(ids_new.iter().map(String::as_str)),
        )
        .replace(
            "VOLUME_PATHS_NEW",
            &bash_array(new_volumes.iter().map(|v| v.path.as_str())),
        )
        .replace(
            "VOLUME_IDS_ATTACH",
            &bash_array(ids_attach.iter().map(String::as_str)),
        )
        .replace(
            "VOLUME_PATHS_ATTACH",
            &bash_array(attach_volumes.iter().map(|v| v.path.as_str())),
        )
}

fn metadata_script(token: &str, endpoint: &str) -> String {
    METADATA_TOKEN_SCRIPT
        .replace("METADATA_TOKEN", token)
        .replace("METADATA_ENDPOINT", endpoint)
}

pub fn compose_userdata(params: &UserdataParams<'_>) -> Vec<u8> {
    let mut parts = vec![UNLOCK_USER_SCRIPT.to_string()];

    if !params.additional_keys.is_empty() {
        parts.push(add_keys_script(params.additional_keys));
    }
    if !params.new_volumes.is_empty() || !params.attach_volumes.is_empty() {
        parts.push(mount_script(params.new_volumes, params.attach_volumes));
    }
    if let (Some(token), Some(endpoint)) = (params.metadata_token, params.metadata_endpoint) {
        parts.push(metadata_script(token, endpoint));
    }
    if let Some(extra) = params.additional_script {
        if !extra.is_empty() {
            parts.push(extra.to_string());
        }
    }

    parts.join("\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(id: &str, path: &str) -> VolumePath {
        VolumePath {
            openstack_id: id.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_empty_params_yield_only_unlock_stub() {
        let blob = compose_userdata(&UserdataParams::default());
        let text = String::from_utf8(blob).unwrap();
        assert_eq!(text, UNLOCK_USER_SCRIPT);
        assert!(!text.contains("authorized_keys"));
        assert!(!text.contains("mkfs"));
    }

    #[test]
    fn test_assembly_order_is_fixed() {
        let keys = vec!["ssh-rsa AAA".to_string()];
        let new_volumes = vec![volume("0123456789abcdef0123xxxx", "/vol/data")];
        let params = UserdataParams {
            additional_keys: &keys,
            new_volumes: &new_volumes,
            metadata_token: Some("token-1"),
            metadata_endpoint: Some("https://metadata:8444"),
            additional_script: Some("echo done"),
            ..Default::default()
        };
        let text = String::from_utf8(compose_userdata(&params)).unwrap();

        let unlock = text.find("usermod -U ubuntu").unwrap();
        let keys_at = text.find("authorized_keys").unwrap();
        let mount_at = text.find("mkfs.ext4").unwrap();
        let token_at = text.find("metadata_token").unwrap();
        let extra_at = text.find("echo done").unwrap();
        assert!(unlock < keys_at && keys_at < mount_at && mount_at < token_at);
        assert!(token_at < extra_at);
    }

    #[test]
    fn test_key_substitution_is_literal() {
        let keys = vec!["ssh-rsa AAA user@host".to_string(), "ssh-ed25519 BBB".to_string()];
        let params = UserdataParams {
            additional_keys: &keys,
            ..Default::default()
        };
        let text = String::from_utf8(compose_userdata(&params)).unwrap();
        assert!(text.contains(r#"("ssh-rsa AAA user@host" "ssh-ed25519 BBB" )"#));
        assert!(!text.contains("KEYS_TO_ADD"));
    }

    #[test]
    fn test_device_ids_truncated_to_20_chars() {
        let new_volumes = vec![volume("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee", "/vol/new")];
        let attach_volumes = vec![volume("short-id", "/vol/old")];
        let params = UserdataParams {
            new_volumes: &new_volumes,
            attach_volumes: &attach_volumes,
            ..Default::default()
        };
        let text = String::from_utf8(compose_userdata(&params)).unwrap();
        assert!(text.contains("virtio-aaaaaaaa-bbbb-cccc-d"));
        assert!(text.contains("virtio-short-id"));
        assert!(text.contains("(/vol/new )"));
        assert!(text.contains("(/vol/old )"));
    }

    #[test]
    fn test_metadata_needs_both_token_and_endpoint() {
        let params = UserdataParams {
            metadata_token: Some("token-1"),
            ..Default::default()
        };
        let text = String::from_utf8(compose_userdata(&params)).unwrap();
        assert!(!text.contains("token-1"));
    }
}
