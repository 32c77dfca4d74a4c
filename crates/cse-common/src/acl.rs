//! Access control grants on cluster entities

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Namespace prefix of access level identifiers
pub const ACCESS_LEVEL_URN_PREFIX: &str = "urn:vcloud:accessLevel";

/// Prefix of user subject identifiers
pub const USER_URN_PREFIX: &str = "urn:vcloud:user:";

/// Grant type used for direct user/group membership grants
pub const MEMBERSHIP_GRANT_TYPE: &str = "MembershipAccessControlGrant";

/// Access level of a grant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessLevel {
    /// View the cluster
    ReadOnly,
    /// View and modify the cluster
    ReadWrite,
    /// Modify the cluster and its ACL
    FullControl,
}

impl AccessLevel {
    /// Short name (the last URN segment)
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ReadOnly",
            Self::ReadWrite => "ReadWrite",
            Self::FullControl => "FullControl",
        }
    }

    /// Namespaced identifier, e.g. `urn:vcloud:accessLevel:ReadOnly`
    pub fn urn(&self) -> String {
        format!("{}:{}", ACCESS_LEVEL_URN_PREFIX, self.short_name())
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.urn())
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    /// Accepts full URNs and case-insensitive short names (`readonly`, `ReadWrite`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s
            .strip_prefix(ACCESS_LEVEL_URN_PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(s);
        match short.to_ascii_lowercase().as_str() {
            "readonly" => Ok(Self::ReadOnly),
            "readwrite" => Ok(Self::ReadWrite),
            "fullcontrol" => Ok(Self::FullControl),
            _ => Err(Error::malformed(
                "access level",
                format!("unknown access level '{}'", s),
            )),
        }
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.urn())
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_grant_type() -> String {
    MEMBERSHIP_GRANT_TYPE.to_string()
}

/// One access grant: subject + level
///
/// Wire form is `{grantType, accessLevelId, memberId}`; listings may carry
/// extra read-only fields (`id`, `name`) which are kept but not compared.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclGrant {
    /// Grant type
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
    /// Access level
    #[serde(rename = "accessLevelId")]
    pub access_level: AccessLevel,
    /// Subject (user or group URN)
    pub member_id: String,
    /// Platform id of the grant (listings only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name of the subject (listings only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AclGrant {
    /// Membership grant for a subject
    pub fn membership(member_id: impl Into<String>, access_level: AccessLevel) -> Self {
        Self {
            grant_type: MEMBERSHIP_GRANT_TYPE.to_string(),
            access_level,
            member_id: member_id.into(),
            id: None,
            name: None,
        }
    }

    /// Membership grant for a user id, adding the user URN prefix if missing
    pub fn for_user(user_id: &str, access_level: AccessLevel) -> Self {
        Self::membership(user_urn(user_id), access_level)
    }

    /// Same subject, level and grant type (ignores listing-only fields)
    pub fn same_grant(&self, other: &AclGrant) -> bool {
        self.member_id == other.member_id
            && self.access_level == other.access_level
            && self.grant_type == other.grant_type
    }

    /// Copy with listing-only fields stripped, as sent in a replace request
    pub fn to_setting(&self) -> AclGrant {
        Self {
            id: None,
            name: None,
            ..self.clone()
        }
    }
}

/// Normalize a user id to a user URN
pub fn user_urn(user_id: &str) -> String {
    if user_id.starts_with(USER_URN_PREFIX) {
        user_id.to_string()
    } else {
        format!("{}{}", USER_URN_PREFIX, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("urn:vcloud:accessLevel:ReadOnly", AccessLevel::ReadOnly)]
    #[case("readonly", AccessLevel::ReadOnly)]
    #[case("ReadWrite", AccessLevel::ReadWrite)]
    #[case("FULLCONTROL", AccessLevel::FullControl)]
    #[case("urn:vcloud:accessLevel:FullControl", AccessLevel::FullControl)]
    fn test_access_level_parsing(#[case] input: &str, #[case] expected: AccessLevel) {
        assert_eq!(input.parse::<AccessLevel>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_access_level_is_malformed() {
        let err = "owner".parse::<AccessLevel>().unwrap_err();
        assert!(err.to_string().contains("owner"));
    }

    #[test]
    fn test_grant_wire_format() {
        let grant = AclGrant::for_user("abc", AccessLevel::ReadWrite);
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "grantType": "MembershipAccessControlGrant",
                "accessLevelId": "urn:vcloud:accessLevel:ReadWrite",
                "memberId": "urn:vcloud:user:abc"
            })
        );
    }

    #[test]
    fn test_listing_fields_are_ignored_by_same_grant() {
        let listed: AclGrant = serde_json::from_value(serde_json::json!({
            "id": "urn:vcloud:accessControl:1",
            "grantType": "MembershipAccessControlGrant",
            "accessLevelId": "urn:vcloud:accessLevel:ReadOnly",
            "memberId": "urn:vcloud:user:abc",
            "name": "alice"
        }))
        .unwrap();
        let desired = AclGrant::for_user("urn:vcloud:user:abc", AccessLevel::ReadOnly);

        assert!(listed.same_grant(&desired));
        assert!(listed.to_setting().id.is_none());
    }
}
