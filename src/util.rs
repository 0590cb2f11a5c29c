//! Small helpers shared across modules.

use chrono::Utc;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All `timestamp` fields on wire frames use this representation.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a correlation id for a cloud→device request:
/// `req_<ms epoch>_<6 random hex chars>`.
pub fn new_request_id() -> String {
    let rand6 = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("req_{}_{}", now_ms(), rand6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert!(id.starts_with("req_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
