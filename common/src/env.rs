//! Helpers for the serialized `KEY=VALUE` environment lists carried on
//! deployment rows and job payloads.

pub const DEFAULT_SERVICE_PORT: u16 = 8080;

const PORT_KEY: &str = "APP_PORT=";

/// Serialize an environment list into the stored JSON form.
pub fn build_envs_payload(envs: &[String]) -> serde_json::Result<String> {
    serde_json::to_string(envs)
}

/// Parse the stored form back into a list. Malformed input yields an
/// empty list rather than failing the rollout.
pub fn parse_env_string(envs: &str) -> Vec<String> {
    serde_json::from_str(envs).unwrap_or_default()
}

/// Port the service listens on, taken from the first `APP_PORT=<int>`
/// entry, falling back to the default when absent or unparseable.
pub fn extract_port(envs: &[String]) -> u16 {
    for env in envs {
        if let Some(value) = env.strip_prefix(PORT_KEY) {
            if let Ok(port) = value.parse() {
                return port;
            }
        }
    }

    DEFAULT_SERVICE_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_taken_from_app_port_entry() {
        let envs = vec!["LOG=1".to_string(), "APP_PORT=9090".to_string()];
        assert_eq!(extract_port(&envs), 9090);
    }

    #[test]
    fn port_falls_back_to_default() {
        let envs = vec!["LOG=1".to_string()];
        assert_eq!(extract_port(&envs), 8080);

        let unparseable = vec!["APP_PORT=ninety".to_string()];
        assert_eq!(extract_port(&unparseable), 8080);
    }

    #[test]
    fn envs_round_trip_through_the_stored_form() {
        let envs = vec!["APP_PORT=8080".to_string(), "LOG=1".to_string()];
        let payload = build_envs_payload(&envs).unwrap();

        assert_eq!(parse_env_string(&payload), envs);
    }

    #[test]
    fn malformed_env_payload_yields_empty_list() {
        assert!(parse_env_string("not json").is_empty());
    }
}
