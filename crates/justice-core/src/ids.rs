use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// A case id doubles as the id of the room bound to that case.
branded_id!(CaseId, "case");
branded_id!(ConnectionId, "conn");
branded_id!(MessageId, "msg");
branded_id!(ParticipantId, "user");

impl ParticipantId {
    /// Sender identity used for server-authored messages.
    pub fn system() -> Self {
        Self::from_raw("system")
    }

    pub fn is_system(&self) -> bool {
        self.0 == "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_id_has_prefix() {
        let id = CaseId::new();
        assert!(id.as_str().starts_with("case_"), "got: {id}");
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = CaseId::new();
        let parsed: CaseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ParticipantId::from_raw("0xabc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0xabc\"");
    }

    #[test]
    fn system_sender() {
        assert!(ParticipantId::system().is_system());
        assert!(!ParticipantId::from_raw("0xabc").is_system());
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
