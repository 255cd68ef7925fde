//! Forced rollback health checks
//!
//! Two checks that always fail during an A/B update, making the engine roll
//! back to the previous volume after finalize.

use crate::host_config::{HealthCheck, HostConfiguration};
use tracing::info;

pub const SCRIPT_ROLLBACK_CHECK: &str = "invoke-rollback-from-script";
pub const SYSTEMD_ROLLBACK_CHECK: &str = "check-non-existent-service-to-invoke-rollback";

const RUN_ON_AB_UPDATE: &str = "ab-update";

fn rollback_checks() -> [HealthCheck; 2] {
    [
        HealthCheck {
            name: SCRIPT_ROLLBACK_CHECK.to_string(),
            content: Some("exit 1".to_string()),
            run_on: Some(vec![RUN_ON_AB_UPDATE.to_string()]),
            ..Default::default()
        },
        HealthCheck {
            name: SYSTEMD_ROLLBACK_CHECK.to_string(),
            run_on: Some(vec![RUN_ON_AB_UPDATE.to_string()]),
            systemd_services: Some(vec![
                "non-existent-service1".to_string(),
                "non-existent-service2".to_string(),
            ]),
            timeout_seconds: Some(30),
            ..Default::default()
        },
    ]
}

fn is_rollback_check(check: &HealthCheck) -> bool {
    check.name == SCRIPT_ROLLBACK_CHECK || check.name == SYSTEMD_ROLLBACK_CHECK
}

/// Add (`enabled`) or remove the failing rollback checks. Other checks are
/// kept in order.
pub fn configure_forced_rollback(current: &HostConfiguration, enabled: bool) -> HostConfiguration {
    let mut next = current.clone();

    if enabled {
        let checks = next
            .health
            .get_or_insert_with(Default::default)
            .checks
            .get_or_insert_with(Vec::new);
        checks.retain(|c| !is_rollback_check(c));
        checks.extend(rollback_checks());
        info!("Injected forced rollback health checks");
    } else if let Some(checks) = next.health.as_mut().and_then(|h| h.checks.as_mut()) {
        let before = checks.len();
        checks.retain(|c| !is_rollback_check(c));
        if checks.len() != before {
            info!(removed = before - checks.len(), "Removed forced rollback health checks");
        }
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_CHECK: &str = r#"
health:
  checks:
    - name: keep-me
      content: "true"
      runOn: [clean-install, ab-update]
"#;

    #[test]
    fn test_enable_appends_both_checks() {
        let hc = HostConfiguration::parse(WITH_CHECK).unwrap();
        let out = configure_forced_rollback(&hc, true);
        let checks = out.health.unwrap().checks.unwrap();
        let names: Vec<_> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["keep-me", SCRIPT_ROLLBACK_CHECK, SYSTEMD_ROLLBACK_CHECK]);
        assert_eq!(checks[2].timeout_seconds, Some(30));
        assert_eq!(checks[1].run_on, Some(vec!["ab-update".to_string()]));
    }

    #[test]
    fn test_enable_twice_does_not_duplicate() {
        let hc = HostConfiguration::parse(WITH_CHECK).unwrap();
        let once = configure_forced_rollback(&hc, true);
        assert_eq!(configure_forced_rollback(&once, true), once);
    }

    #[test]
    fn test_disable_removes_only_rollback_checks() {
        let hc = HostConfiguration::parse(WITH_CHECK).unwrap();
        let enabled = configure_forced_rollback(&hc, true);
        let disabled = configure_forced_rollback(&enabled, false);
        assert_eq!(disabled, hc);

        let bare = HostConfiguration::default();
        assert_eq!(configure_forced_rollback(&bare, false), bare);
    }
}
