use serde::{Deserialize, Serialize};

/// The owning party of gifts and recurring plans. Identity is the email
/// address; donors are found-or-created at first gift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donor {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: i64,
}
