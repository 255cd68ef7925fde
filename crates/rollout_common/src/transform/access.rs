//! Allowed operations and SSH access edits.

use crate::error::{Result, RolloutError};
use crate::host_config::{AllowedOperation, HostConfiguration};

/// Set the lifecycle operations the engine may perform.
pub fn restrict_operations(current: &HostConfiguration, ops: &[AllowedOperation]) -> HostConfiguration {
    let mut next = current.clone();
    let mut ops = ops.to_vec();
    ops.dedup();
    next.allowed_operations = Some(ops);
    next
}

/// Append a public key to the named user's authorized keys.
pub fn add_ssh_key(current: &HostConfiguration, user: &str, public_key: &str) -> Result<HostConfiguration> {
    let key = public_key.trim();
    if key.is_empty() {
        return Err(RolloutError::Config("public key must not be empty".to_string()));
    }

    let mut next = current.clone();
    let entry = next
        .os
        .as_mut()
        .and_then(|os| os.users.as_mut())
        .and_then(|users| users.iter_mut().find(|u| u.name == user))
        .ok_or_else(|| {
            RolloutError::TransformPrecondition(format!("user '{}' is not defined", user))
        })?;

    let keys = entry.ssh_public_keys.get_or_insert_with(Vec::new);
    if !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"
os:
  users:
    - name: testing-user
      sshPublicKeys:
        - ssh-ed25519 AAAA first
"#;

    #[test]
    fn test_restrict_operations() {
        let out = restrict_operations(&HostConfiguration::default(), &[AllowedOperation::Stage]);
        assert_eq!(out.allowed_operations, Some(vec![AllowedOperation::Stage]));
        assert!(out.to_yaml().unwrap().contains("allowedOperations:\n- stage"));
    }

    #[test]
    fn test_add_ssh_key_appends_once() {
        let hc = HostConfiguration::parse(USERS).unwrap();
        let out = add_ssh_key(&hc, "testing-user", "ssh-rsa BBBB second\n").unwrap();
        let out = add_ssh_key(&out, "testing-user", "ssh-rsa BBBB second").unwrap();
        let keys = out.user("testing-user").unwrap().ssh_public_keys.clone().unwrap();
        assert_eq!(keys, vec!["ssh-ed25519 AAAA first", "ssh-rsa BBBB second"]);
    }

    #[test]
    fn test_add_ssh_key_unknown_user() {
        let hc = HostConfiguration::parse(USERS).unwrap();
        let err = add_ssh_key(&hc, "root", "ssh-rsa CCCC").unwrap_err();
        assert!(matches!(err, RolloutError::TransformPrecondition(_)));
    }
}
