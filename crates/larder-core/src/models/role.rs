//! Application roles as stored in `user_roles.role`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role assigned to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppRole {
    Admin,
    Manager,
    Hr,
    Supervisor,
    Employee,
}

impl AppRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Hr => "hr",
            Self::Supervisor => "supervisor",
            Self::Employee => "employee",
        }
    }

    pub const fn can_delete_users(self) -> bool {
        matches!(self, Self::Admin | Self::Manager)
    }

    pub const fn can_set_passwords(self) -> bool {
        matches!(self, Self::Admin)
    }

    pub const fn can_sign_out_users(self) -> bool {
        matches!(self, Self::Admin | Self::Manager | Self::Hr)
    }

    pub const fn can_create_employee_users(self) -> bool {
        matches!(self, Self::Admin | Self::Manager)
    }
}

impl fmt::Display for AppRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppRole {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "hr" => Ok(Self::Hr),
            "supervisor" => Ok(Self::Supervisor),
            "employee" => Ok(Self::Employee),
            other => Err(Error::InvalidInput(format!("unknown role `{other}`"))),
        }
    }
}
