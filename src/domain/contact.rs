use serde::{Deserialize, Serialize};

/// A snapshot of the contact fields needed to fill the upstream form
/// (§3, §6). Taken at request-submission time rather than looked up live
/// from the user/profile store, since that store is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
}
