use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::errors::UserError;
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Blocked
}

/// The owner of an account. Only the fields the pipeline reads are modelled.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub document: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>
}

impl User {
    pub fn new(name: &str, email: &str, document: &str, role: Role) -> Result<Self, UserError> {
        Ok(Self {
            id: 0,
            name: non_blank(name, "name")?,
            email: non_blank(email, "email")?,
            document: non_blank(document, "document")?,
            role,
            status: UserStatus::Active,
            created_at: Utc::now()
        })
    }

    pub fn block(&mut self) {
        self.status = UserStatus::Blocked;
    }

    pub fn activate(&mut self) {
        self.status = UserStatus::Active;
    }
}

fn non_blank(value: &str, field: &'static str) -> Result<String, UserError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(UserError::BlankField(field))
    }

    Ok(value.to_string())
}
