/// Rescue system activation
use tracing::{debug, info, warn};

use super::client::{form, RobotClient};
use super::error::Result;
use super::models::{RescueCredentials, RescueEnvelope};

impl RobotClient {
    /// Activate the rescue system for the next boot.
    ///
    /// `authorized_keys` are SSH key fingerprints known to Robot.
    pub async fn enable_rescue(
        &self,
        id: u64,
        os: &str,
        authorized_keys: &[String],
    ) -> Result<RescueCredentials> {
        let mut body = form([("os", os)]);
        body.extend(
            authorized_keys
                .iter()
                .map(|key| ("authorized_key[]".to_string(), key.clone())),
        );

        let envelope: RescueEnvelope = self
            .post_form(&format!("/boot/{id}/rescue"), &body)
            .await?;
        let rescue = envelope.rescue;
        if !rescue.active {
            warn!(server_id = id, "Robot reports the rescue system as inactive");
        }
        info!(
            server_id = id,
            os = %rescue.os_name(),
            ipv6_net = rescue.server_ipv6_net.as_deref().unwrap_or("-"),
            "Rescue system enabled"
        );
        RescueCredentials::try_from(rescue)
    }

    /// Deactivate the rescue system. Returns false when none was active.
    pub async fn disable_rescue(&self, id: u64) -> Result<bool> {
        match self.delete(&format!("/boot/{id}/rescue"), None).await {
            Ok(()) => {
                info!(server_id = id, "Rescue system disabled");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(server_id = id, "no rescue system to disable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::test_support::{form_pairs, setup};
    use super::super::error::RobotError;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[tokio::test]
    async fn test_enable_rescue_sends_keys_and_returns_password() {
        let (mock_server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/boot/321/rescue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rescue": {
                    "server_ip": "123.123.123.123",
                    "server_ipv6_net": "2a01:4f8:111:4221::",
                    "server_number": 321,
                    "os": "linux",
                    "active": true,
                    "password": "jEt0dtUvomJ6",
                    "authorized_key": [],
                    "host_key": []
                }
            })))
            .mount(&mock_server)
            .await;

        let keys = vec!["15:28:b0:03:95:f0:77:b3:10:56:15:6b:77:22:a5:bb".to_string()];
        let rescue = client.enable_rescue(321, "linux", &keys).await.unwrap();
        assert_eq!(rescue.server_ip, "123.123.123.123");
        assert_eq!(rescue.password.expose_secret(), "jEt0dtUvomJ6");

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(
            form_pairs(&requests[0]),
            vec![
                ("os".to_string(), "linux".to_string()),
                ("authorized_key[]".to_string(), keys[0].clone()),
            ]
        );
    }

    #[tokio::test]
    async fn test_disable_rescue_treats_404_as_noop() {
        let (mock_server, client) = setup().await;
        Mock::given(method("DELETE"))
            .and(path("/boot/321/rescue"))
            .respond_with(ResponseTemplate::new(404).set_body_string("NOT_FOUND"))
            .mount(&mock_server)
            .await;

        assert!(!client.disable_rescue(321).await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_rescue_propagates_other_errors() {
        let (mock_server, client) = setup().await;
        Mock::given(method("DELETE"))
            .and(path("/boot/321/rescue"))
            .respond_with(ResponseTemplate::new(409).set_body_string("BOOT_BLOCKED"))
            .mount(&mock_server)
            .await;

        let result = client.disable_rescue(321).await;
        assert!(matches!(result, Err(RobotError::Api { status: 409, .. })));
    }
}
