use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Profile;
use crate::services::grading::ProfileConfig;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProfileCreate {
    #[validate(length(min = 1, max = 200, message = "name must be 1..=200 characters"))]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub(crate) config: ProfileConfig,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProfileUpdate {
    #[serde(default)]
    #[validate(length(min = 1, max = 200, message = "name must be 1..=200 characters"))]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub(crate) config: Option<ProfileConfig>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProfileCloneRequest {
    #[validate(length(min = 1, max = 200, message = "new_name must be 1..=200 characters"))]
    pub(crate) new_name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProfileResponse {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) config: ProfileConfig,
    pub(crate) is_default: bool,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl ProfileResponse {
    pub(crate) fn from_db(profile: Profile) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            description: profile.description,
            config: profile.config_json.0,
            is_default: profile.is_default,
            created_at: format_primitive(profile.created_at),
            updated_at: format_primitive(profile.updated_at),
        }
    }
}
