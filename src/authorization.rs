//! Permission gate consulted before an interactive merge.

use crate::config::AuthorizationConfig;
use crate::merge::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Permission check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub user_role: String,
    pub required_permission: String,
    pub user_permissions: Vec<String>,
    pub reason: String,
}

pub trait Authorizer: Send + Sync {
    fn check_permission(&self, user_id: &str, permission: &str) -> PermissionCheck;

    /// User must hold ALL of `permissions`; the first denial is returned.
    fn check_permissions(&self, user_id: &str, permissions: &[&str]) -> PermissionCheck {
        let mut last = None;
        for permission in permissions {
            let check = self.check_permission(user_id, permission);
            if !check.allowed {
                return check;
            }
            last = Some(check);
        }

        match last {
            Some(check) => PermissionCheck {
                required_permission: permissions.join(", "),
                reason: "All permissions granted".to_string(),
                ..check
            },
            None => PermissionCheck {
                allowed: true,
                user_role: "none".to_string(),
                required_permission: "none".to_string(),
                user_permissions: Vec::new(),
                reason: "No permissions required".to_string(),
            },
        }
    }
}

/// Role-based authorizer driven by [`AuthorizationConfig`].
///
/// Permissions look like `party:update:individual`. A role may grant `*` for
/// everything or a trailing wildcard such as `party:update:*`.
#[derive(Debug, Clone)]
pub struct RoleAuthorizer {
    enabled: bool,
    role_permissions: HashMap<String, HashSet<String>>,
    user_roles: HashMap<String, String>,
    default_role: String,
    admin_users: HashSet<String>,
}

impl RoleAuthorizer {
    pub fn new(config: &AuthorizationConfig) -> Self {
        let role_permissions: HashMap<String, HashSet<String>> = config
            .roles
            .iter()
            .map(|(role, permissions)| (role.clone(), permissions.iter().cloned().collect()))
            .collect();
        let admin_users: HashSet<String> = config.admin_users.iter().cloned().collect();

        debug!(
            "Initialized authorization with {} roles and {} admin users",
            role_permissions.len(),
            admin_users.len()
        );

        Self {
            enabled: config.enabled,
            role_permissions,
            user_roles: config.user_roles.clone(),
            default_role: config.default_role.clone(),
            admin_users,
        }
    }

    pub fn assign_role(&mut self, user_id: &str, role: &str) -> Result<()> {
        if !self.role_permissions.contains_key(role) {
            return Err(MergeError::Configuration(format!("Role '{role}' does not exist")));
        }
        self.user_roles.insert(user_id.to_string(), role.to_string());
        debug!("Assigned role '{}' to user '{}'", role, user_id);
        Ok(())
    }

    pub fn get_user_role(&self, user_id: &str) -> String {
        self.user_roles
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_role.clone())
    }

    pub fn get_user_permissions(&self, user_id: &str) -> Vec<String> {
        let mut permissions: Vec<String> = self
            .role_permissions
            .get(&self.get_user_role(user_id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        permissions.sort();
        permissions
    }
}

fn grants(granted: &str, permission: &str) -> bool {
    if granted == "*" || granted == permission {
        return true;
    }
    granted
        .strip_suffix('*')
        .is_some_and(|prefix| prefix.ends_with(':') && permission.starts_with(prefix))
}

impl Authorizer for RoleAuthorizer {
    fn check_permission(&self, user_id: &str, permission: &str) -> PermissionCheck {
        if !self.enabled {
            return PermissionCheck {
                allowed: true,
                user_role: "none".to_string(),
                required_permission: permission.to_string(),
                user_permissions: vec!["all".to_string()],
                reason: "Authorization disabled".to_string(),
            };
        }

        if self.admin_users.contains(user_id) {
            return PermissionCheck {
                allowed: true,
                user_role: "admin".to_string(),
                required_permission: permission.to_string(),
                user_permissions: vec!["admin".to_string()],
                reason: "Admin override".to_string(),
            };
        }

        let user_role = self.get_user_role(user_id);
        let user_permissions = self.get_user_permissions(user_id);
        let allowed = user_permissions
            .iter()
            .any(|granted| grants(granted, permission));

        let reason = if allowed {
            "Permission granted".to_string()
        } else {
            format!("Missing required permission: {permission}")
        };

        PermissionCheck {
            allowed,
            user_role,
            required_permission: permission.to_string(),
            user_permissions,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthorizationConfig {
        let mut config = AuthorizationConfig::default();
        config
            .roles
            .insert("org_admin".to_string(), vec!["party:update:*".to_string()]);
        config
            .user_roles
            .insert("alice".to_string(), "party_admin".to_string());
        config.admin_users.push("root".to_string());
        config
    }

    #[test]
    fn test_role_permission_granted() {
        let authorizer = RoleAuthorizer::new(&config());
        let check = authorizer.check_permission("alice", "party:update:individual");
        assert!(check.allowed);
        assert_eq!(check.user_role, "party_admin");
    }

    #[test]
    fn test_default_role_denied() {
        let authorizer = RoleAuthorizer::new(&config());
        let check = authorizer.check_permission("bob", "party:update:individual");
        assert!(!check.allowed);
        assert_eq!(check.user_role, "viewer");
        assert!(check.reason.contains("party:update:individual"));
    }

    #[test]
    fn test_admin_override() {
        let authorizer = RoleAuthorizer::new(&config());
        let check = authorizer.check_permission("root", "party:update:other");
        assert!(check.allowed);
        assert_eq!(check.reason, "Admin override");
    }

    #[test]
    fn test_prefix_wildcard() {
        let mut authorizer = RoleAuthorizer::new(&config());
        authorizer.assign_role("carol", "org_admin").unwrap();
        assert!(authorizer.check_permission("carol", "party:update:organization").allowed);
        assert!(!authorizer.check_permission("carol", "party:delete:organization").allowed);
        assert!(authorizer.assign_role("carol", "missing").is_err());
    }

    #[test]
    fn test_disabled_allows_everything() {
        let config = AuthorizationConfig {
            enabled: false,
            ..config()
        };
        let authorizer = RoleAuthorizer::new(&config);
        assert!(authorizer.check_permission("anyone", "party:update:individual").allowed);
    }

    #[test]
    fn test_check_permissions_requires_all() {
        let authorizer = RoleAuthorizer::new(&config());
        let check = authorizer.check_permissions(
            "alice",
            &["party:update:individual", "party:update:automated_agent"],
        );
        assert!(!check.allowed);
        assert_eq!(check.required_permission, "party:update:automated_agent");

        let check = authorizer.check_permissions(
            "alice",
            &["party:update:individual", "party:update:organization"],
        );
        assert!(check.allowed);
        assert_eq!(
            check.required_permission,
            "party:update:individual, party:update:organization"
        );
    }
}
