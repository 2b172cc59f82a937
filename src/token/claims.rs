//! JWT claim set carried by every bearer token this fabric issues.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub dev: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_uuid: Uuid, device_id: String, ttl_secs: i64) -> Self {
        let iat = chrono::Utc::now().timestamp();
        Self {
            sub: user_uuid,
            dev: device_id,
            iat,
            exp: iat + ttl_secs,
        }
    }
}
