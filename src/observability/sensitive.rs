use std::fmt::{self, Debug, Display, Formatter};

use resql_sql::connection_url::parse_store_url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const UNPARSEABLE: &str = "[REDACTED]";

/// A store DSN whose password never reaches logs or serialized settings.
///
/// Formatting shows the DSN with its password masked; a DSN that does not
/// parse is hidden entirely. `.expose()` returns the real value for
/// connecting.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretUrl(String);

impl SecretUrl {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self(dsn.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn redacted(&self) -> String {
        parse_store_url(&self.0)
            .map(|url| url.redacted)
            .unwrap_or_else(|_| UNPARSEABLE.to_string())
    }
}

impl Debug for SecretUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretUrl").field(&self.redacted()).finish()
    }
}

impl Display for SecretUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl Serialize for SecretUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.redacted())
    }
}

impl<'de> Deserialize<'de> for SecretUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretUrl)
    }
}
