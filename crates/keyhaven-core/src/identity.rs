//! Account identifiers and the two identity namespaces (ACI and PNI).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::KeysError;

/// Which identity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityType {
    /// Account identity.
    #[default]
    Aci,
    /// Phone-number identity.
    Pni,
}

impl IdentityType {
    /// Interpret an optional `identity` query parameter.
    ///
    /// Only `pni` (case-insensitive) selects the phone-number identity; anything
    /// else, including absence, means ACI.
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some(p) if p.eq_ignore_ascii_case("pni") => Self::Pni,
            _ => Self::Aci,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aci => "aci",
            Self::Pni => "pni",
        }
    }
}

impl fmt::Display for IdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 128-bit account identifier, rendered as a hyphenated lowercase UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Generate a random (version 4) identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for AccountId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for AccountId {
    type Err = KeysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|e| KeysError::Validation(format!("malformed identifier {s}: {e}")))
    }
}

/// An account identifier qualified by its namespace.
///
/// The textual form is the bare identifier for ACI and `PNI:<identifier>` for
/// PNI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceIdentifier {
    pub identity_type: IdentityType,
    pub id: AccountId,
}

impl ServiceIdentifier {
    pub fn aci(id: AccountId) -> Self {
        Self {
            identity_type: IdentityType::Aci,
            id,
        }
    }

    pub fn pni(id: AccountId) -> Self {
        Self {
            identity_type: IdentityType::Pni,
            id,
        }
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity_type {
            IdentityType::Aci => write!(f, "{}", self.id),
            IdentityType::Pni => write!(f, "PNI:{}", self.id),
        }
    }
}

impl FromStr for ServiceIdentifier {
    type Err = KeysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("PNI:") {
            Some(rest) => Ok(Self::pni(rest.parse()?)),
            None => Ok(Self::aci(s.parse()?)),
        }
    }
}

impl Serialize for ServiceIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_param_defaults_to_aci() {
        assert_eq!(IdentityType::from_param(None), IdentityType::Aci);
        assert_eq!(IdentityType::from_param(Some("aci")), IdentityType::Aci);
        assert_eq!(IdentityType::from_param(Some("PNI")), IdentityType::Pni);
        assert_eq!(IdentityType::from_param(Some("bogus")), IdentityType::Aci);
    }

    #[test]
    fn account_id_text_form() {
        let id: AccountId = "0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0ff".parse().unwrap();
        assert_eq!(id.to_string(), "0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0ff");

        let compact: AccountId = "0f1e2d3c4b5a49788695a4b3c2d1e0ff".parse().unwrap();
        assert_eq!(id, compact);
    }

    #[test]
    fn account_id_rejects_garbage() {
        assert!("not-an-id".parse::<AccountId>().is_err());
        assert!("0f1e2d3c-4b5a-4978-8695a-4b3c2d1e0ff".parse::<AccountId>().is_err());
        assert!("zz1e2d3c4b5a49788695a4b3c2d1e0ff".parse::<AccountId>().is_err());
    }

    #[test]
    fn random_ids_are_distinct_v4() {
        let id = AccountId::random();
        assert_ne!(id, AccountId::random());
        assert_eq!(id.as_bytes()[6] >> 4, 4);
    }

    #[test]
    fn account_id_serializes_as_text() {
        let id: AccountId = "0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0ff".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0ff""#);
        assert_eq!(serde_json::from_str::<AccountId>(&json).unwrap(), id);
    }

    #[test]
    fn service_identifier_prefix_selects_namespace() {
        let id = AccountId::random();

        let aci: ServiceIdentifier = id.to_string().parse().unwrap();
        assert_eq!(aci, ServiceIdentifier::aci(id));

        let pni: ServiceIdentifier = format!("PNI:{id}").parse().unwrap();
        assert_eq!(pni, ServiceIdentifier::pni(id));
        assert_eq!(pni.to_string(), format!("PNI:{id}"));
    }
}
