//! Peer enrollment helpers

use meshplane_common::{Account, Error, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Request to enroll a device into an account
#[derive(Debug, Clone, Default)]
pub struct PeerEnrollment {
    /// WireGuard public key, unique per account
    pub key: String,
    pub name: String,
    /// Setup key secret used to enroll, exclusive with `user_id`
    pub setup_key: Option<String>,
    /// Enrolling user when no setup key is used
    pub user_id: Option<String>,
}

/// Groups the new peer joins and the user it belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrollment {
    pub auto_groups: Vec<String>,
    pub user_id: Option<String>,
}

/// Check the enrollment credentials and count setup key usage
pub fn authorize_enrollment(account: &mut Account, request: &PeerEnrollment, now: i64) -> Result<Enrollment> {
    if request.key.trim().is_empty() {
        return Err(Error::validation("peer key shouldn't be empty"));
    }
    if account.peers.values().any(|p| p.key == request.key) {
        return Err(Error::AlreadyExists {
            kind: "peer".to_string(),
            id: request.key.clone(),
        });
    }

    if let Some(secret) = request.setup_key.as_deref() {
        let key = account
            .setup_keys
            .values_mut()
            .find(|k| k.key == secret)
            .ok_or_else(|| Error::permission_denied("invalid setup key"))?;
        if !key.is_valid(now) {
            return Err(Error::permission_denied("setup key is no longer valid"));
        }
        key.used_times += 1;
        return Ok(Enrollment {
            auto_groups: key.auto_groups.clone(),
            user_id: None,
        });
    }

    if let Some(user_id) = request.user_id.as_deref() {
        let user = account
            .users
            .get(user_id)
            .ok_or_else(|| Error::permission_denied(format!("user {} is not part of the account", user_id)))?;
        if user.blocked {
            return Err(Error::permission_denied("user is blocked"));
        }
        return Ok(Enrollment {
            auto_groups: user.auto_groups.clone(),
            user_id: Some(user.id.clone()),
        });
    }

    Err(Error::validation("setup key or user is required to add a peer"))
}

/// First address of the account range not held by any peer
pub fn allocate_ip(account: &Account) -> Result<Ipv4Addr> {
    let net = account.network.net;
    let used: HashSet<Ipv4Addr> = account.peers.values().map(|p| p.ip).collect();
    let broadcast = net.broadcast();

    net.iter()
        .skip(1)
        .take_while(|ip| *ip != broadcast)
        .find(|ip| !used.contains(ip))
        .ok_or_else(|| Error::Internal(format!("no free address left in {}", net)))
}

/// DNS label derived from the peer name, unique within the account
pub fn dns_label(account: &Account, name: &str) -> String {
    let mut base: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    base = base.trim_matches('-').to_string();
    if base.is_empty() {
        base = "peer".to_string();
    }

    let taken: HashSet<&str> = account.peers.values().map(|p| p.dns_label.as_str()).collect();
    if !taken.contains(base.as_str()) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{Peer, SetupKey, User, UserRole};

    fn account() -> Account {
        let mut account = Account::new("acc", "owner", "example.com");
        account.setup_keys.insert(
            "k".to_string(),
            SetupKey {
                id: "k".to_string(),
                key: "secret".to_string(),
                auto_groups: vec!["dev".to_string()],
                usage_limit: 1,
                ..Default::default()
            },
        );
        account
    }

    fn request(key: &str) -> PeerEnrollment {
        PeerEnrollment {
            key: key.to_string(),
            name: "laptop".to_string(),
            setup_key: Some("secret".to_string()),
            user_id: None,
        }
    }

    #[test]
    fn test_setup_key_usage_is_counted() {
        let mut account = account();
        let enrollment = authorize_enrollment(&mut account, &request("wg1"), 0).unwrap();
        assert_eq!(enrollment.auto_groups, vec!["dev"]);
        assert_eq!(account.setup_keys["k"].used_times, 1);

        let err = authorize_enrollment(&mut account, &request("wg2"), 0).unwrap_err();
        assert_eq!(err.to_string(), "setup key is no longer valid");
    }

    #[test]
    fn test_unknown_setup_key() {
        let mut account = account();
        let mut req = request("wg1");
        req.setup_key = Some("wrong".to_string());
        let err = authorize_enrollment(&mut account, &req, 0).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_user_enrollment() {
        let mut account = account();
        let mut user = User::new("alice", UserRole::User);
        user.auto_groups = vec!["ops".to_string()];
        account.users.insert("alice".to_string(), user);

        let req = PeerEnrollment {
            key: "wg1".to_string(),
            user_id: Some("alice".to_string()),
            ..Default::default()
        };
        let enrollment = authorize_enrollment(&mut account, &req, 0).unwrap();
        assert_eq!(enrollment.user_id.as_deref(), Some("alice"));
        assert_eq!(enrollment.auto_groups, vec!["ops"]);

        account.users.get_mut("alice").unwrap().blocked = true;
        assert!(authorize_enrollment(&mut account, &req, 0).is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut account = account();
        account
            .peers
            .insert("p1".to_string(), Peer::new("p1", "wg1", Ipv4Addr::new(100, 64, 0, 1)));
        let err = authorize_enrollment(&mut account, &request("wg1"), 0).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_allocate_first_free_address() {
        let mut account = account();
        assert_eq!(allocate_ip(&account).unwrap(), Ipv4Addr::new(100, 64, 0, 1));
        account
            .peers
            .insert("p1".to_string(), Peer::new("p1", "wg1", Ipv4Addr::new(100, 64, 0, 1)));
        assert_eq!(allocate_ip(&account).unwrap(), Ipv4Addr::new(100, 64, 0, 2));
    }

    #[test]
    fn test_dns_label_dedup() {
        let mut account = account();
        assert_eq!(dns_label(&account, "Alice's Laptop"), "alice-s-laptop");
        assert_eq!(dns_label(&account, "!!!"), "peer");

        let mut peer = Peer::new("p1", "wg1", Ipv4Addr::new(100, 64, 0, 1));
        peer.dns_label = "laptop".to_string();
        account.peers.insert("p1".to_string(), peer);
        assert_eq!(dns_label(&account, "laptop"), "laptop-1");
    }
}
