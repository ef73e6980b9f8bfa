use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Body returned by the rate limited `/api` endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub msg: String,
    pub time: u64,
    pub instance_id: String,
}

impl ApiResponse {
    pub fn hit(instance_id: &str) -> Self {
        Self {
            msg: "Successfully Hit".to_string(),
            time: unix_timestamp(),
            instance_id: instance_id.to_string(),
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_serialization() {
        let json = serde_json::to_value(ApiResponse::hit("node-1")).unwrap();
        assert_eq!(json["msg"], "Successfully Hit");
        assert_eq!(json["instanceId"], "node-1");
        assert!(json["time"].as_u64().unwrap() > 0);
    }
}
