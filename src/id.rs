//! Snowflake identifiers exchanged with the node and the voice gateway.
//!
//! The node encodes them as decimal strings; numbers are accepted too.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Repr {
                    Str(String),
                    Num(u64),
                }

                match Repr::deserialize(deserializer)? {
                    Repr::Str(s) => s.parse().map(Self).map_err(de::Error::custom),
                    Repr::Num(n) => Ok(Self(n)),
                }
            }
        }
    };
}

snowflake!(
    /// Guild (server) owning a playback session.
    GuildId
);
snowflake!(
    /// Voice channel inside a guild.
    ChannelId
);
snowflake!(
    /// The bot user; sent as the caller identity on node connect.
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_guild_id_accepts_string_and_number() {
        let from_str: GuildId = serde_json::from_str("\"81384788765712384\"").unwrap();
        let from_num: GuildId = serde_json::from_str("81384788765712384").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(
            serde_json::to_string(&from_str).unwrap(),
            "\"81384788765712384\""
        );
    }

    #[test]
    fn test_guild_id_rejects_garbage() {
        assert!(serde_json::from_str::<GuildId>("\"abc\"").is_err());
    }
}
