use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    User,
    Mechanic,
    Admin,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::User => "user",
            ClientType::Mechanic => "mechanic",
            ClientType::Admin => "admin",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ClientType::User),
            "mechanic" => Ok(ClientType::Mechanic),
            "admin" => Ok(ClientType::Admin),
            other => Err(format!("unknown client type: {other}")),
        }
    }
}

/// Identity of the caller as reported by the token verifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Claims {
    pub client_type: ClientType,
    pub client_id: i64,
}

impl Claims {
    pub fn new(client_type: ClientType, client_id: i64) -> Self {
        Self {
            client_type,
            client_id,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.client_type == ClientType::Admin
    }
}
