use std::time::Duration;

use tracing::{debug, warn};

use skein_core::types::ActivationStatus;

/// Best-effort POST of the terminal result to a caller-registered URL.
/// The query string is augmented with the status. Delivery failure is
/// logged and never alters the already-decided terminal result.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    status: ActivationStatus,
    response: &serde_json::Value,
    timeout: Duration,
) {
    let body = serde_json::json!({
        "status": status,
        "response": response,
    });

    let result = client
        .post(url)
        .query(&[("status", status.to_string())])
        .json(&body)
        .timeout(timeout)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            debug!(url, status = %status, "Callback delivered");
        }
        Ok(resp) => {
            warn!(url, http_status = %resp.status(), "Callback returned non-success");
        }
        Err(e) => {
            warn!(url, error = %e, "Callback delivery failed");
        }
    }
}
