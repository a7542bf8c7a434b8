use anyhow::{Context, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::TokenProvider;
use crate::error::ApiError;

/// HTTP client for the Onecta resource API with retry logic
pub struct OnectaClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Source of the bearer token, consulted before every request
    tokens: Arc<dyn TokenProvider>,

    /// API prefix, e.g. https://api.onecta.daikineurope.com/v1
    api_url: String,

    /// Gateway device id for PATCH calls; discovered from the first gateway when unset
    device: Mutex<Option<String>>,

    /// Maximum number of retries for transport errors and 5xx
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl OnectaClient {
    /// Create a new API client
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        api_url: impl Into<String>,
        device: Option<String>,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            tokens,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            device: Mutex::new(device),
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// GET an API leaf such as `gateway-devices` and decode the JSON body
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.api_url, path.trim_start_matches('/'));
        let response = self.send(Method::GET, &url, None).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(format!("{url}: {e}")))
    }

    /// Gateway device id, configured or discovered
    pub fn device(&self) -> Option<String> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// PATCH a characteristic of a management point on the gateway device
    pub async fn patch(&self, name: &str, payload: &Value) -> Result<(), ApiError> {
        let device = match self.device() {
            Some(device) => device,
            None => {
                self.management_points().await?;
                self.device().ok_or_else(|| {
                    ApiError::Config("first gateway device has no id".to_string())
                })?
            }
        };
        let url = format!(
            "{}/gateway-devices/{}/management-points/{}",
            self.api_url,
            device,
            name.trim_start_matches('/')
        );
        self.send(Method::PATCH, &url, Some(payload)).await?;
        Ok(())
    }

    /// Management points of the first gateway device, keyed by `embeddedId`
    pub async fn management_points(&self) -> Result<Map<String, Value>, ApiError> {
        let gateways = self.get("gateway-devices").await?;
        let first = gateways
            .as_array()
            .and_then(|list| list.first())
            .ok_or_else(|| ApiError::Decode("no gateway devices returned".to_string()))?;

        {
            let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
            if device.is_none() {
                if let Some(id) = first.get("id").and_then(Value::as_str) {
                    tracing::info!(device = id, "Gateway device id");
                    *device = Some(id.to_string());
                }
            }
        }

        let points = first
            .get("managementPoints")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Decode("gateway has no managementPoints".to_string()))?;

        Ok(points
            .iter()
            .filter_map(|point| {
                let id = point.get("embeddedId")?.as_str()?;
                Some((id.to_string(), point.clone()))
            })
            .collect())
    }

    /// Patch a heating setpoint such as `roomTemperature` or `leavingWaterOffset`
    pub async fn set_temperature_control(&self, name: &str, value: Value) -> Result<(), ApiError> {
        self.patch(
            "climateControl/characteristics/temperatureControl",
            &json!({
                "path": format!("/operationModes/heating/setpoints/{name}"),
                "value": value,
            }),
        )
        .await
    }

    /// Set the heating room-temperature setpoint
    pub async fn set_room_temperature(&self, value: f64) -> Result<(), ApiError> {
        self.set_temperature_control("roomTemperature", json!(value)).await
    }

    /// Set the leaving-water temperature offset
    pub async fn set_leaving_water_offset(&self, value: i64) -> Result<(), ApiError> {
        self.set_temperature_control("leavingWaterOffset", json!(value)).await
    }

    /// Turn the hot-water tank's powerful mode (immersion heater) on or off
    pub async fn set_powerful_mode(&self, on: bool) -> Result<(), ApiError> {
        self.patch(
            "domesticHotWaterTank/characteristics/powerfulMode",
            &json!({ "value": if on { "on" } else { "off" } }),
        )
        .await
    }

    /// Current temperatures of the first gateway
    pub async fn sensors(&self) -> Result<SensorSummary, ApiError> {
        let points = self.management_points().await?;
        SensorSummary::from_management_points(&points)
    }

    /// Execute a request with retry logic
    /// Automatically handles:
    /// - 401: forces one token refresh and retries once
    /// - 5xx and transport errors on GET: exponential backoff
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        // Only idempotent requests are retried on 5xx and transport errors
        let max_retries = if method == Method::GET { self.max_retries } else { 0 };
        let mut attempt = 0;
        let mut reauthenticated = false;
        let mut force_refresh = false;

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        loop {
            // Token is fetched right before dispatch, never cached here
            let token = if std::mem::take(&mut force_refresh) {
                self.tokens.refreshed_bearer_token().await?
            } else {
                self.tokens.bearer_token().await?
            };

            let mut request = self.client.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED if !reauthenticated => {
                            tracing::warn!("Received 401, refreshing token and retrying once");
                            reauthenticated = true;
                            force_refresh = true;
                            continue;
                        }
                        s if s.is_server_error() && attempt < max_retries => {
                            let delay = self.calculate_backoff_delay(attempt);
                            tracing::warn!(
                                "Received {}, retrying after {}ms (attempt {}/{})",
                                status,
                                delay,
                                attempt + 1,
                                max_retries
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                            continue;
                        }
                        _ => {}
                    }

                    // Non-retryable error or max retries exceeded
                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    // Categorize the error for better debugging
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else {
                        "unknown"
                    };

                    if attempt < max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            url = %url,
                            "Request failed, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(ApiError::Transport(e));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // Exponential backoff: base_delay * 2^attempt
        // With jitter so the monitor and CLI runs do not retry in lockstep
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::random()) as u64;
        delay.saturating_add(jitter)
    }
}

/// Temperature summary: outdoor, room and target, hot water, leaving water
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSummary {
    pub outdoor: Value,
    pub room: Value,
    pub target: Value,
    pub hot_water: Value,
    pub leaving_water: Value,
}

impl SensorSummary {
    /// Extract readings from management points keyed by `embeddedId`
    pub fn from_management_points(points: &Map<String, Value>) -> Result<Self, ApiError> {
        let zone = points
            .get("climateControlMainZone")
            .or_else(|| points.get("climateControl"))
            .ok_or_else(|| ApiError::Decode("no climate control management point".to_string()))?;
        let tank = points
            .get("domesticHotWaterTank")
            .ok_or_else(|| ApiError::Decode("no domesticHotWaterTank management point".to_string()))?;

        Ok(Self {
            outdoor: reading(zone, "/sensoryData/value/outdoorTemperature/value")?,
            room: reading(zone, "/sensoryData/value/roomTemperature/value")?,
            target: reading(
                zone,
                "/temperatureControl/value/operationModes/auto/setpoints/roomTemperature/value",
            )?,
            hot_water: reading(tank, "/sensoryData/value/tankTemperature/value")?,
            leaving_water: reading(zone, "/sensoryData/value/leavingWaterTemperature/value")?,
        })
    }
}

fn reading(point: &Value, pointer: &str) -> Result<Value, ApiError> {
    point
        .pointer(pointer)
        .cloned()
        .ok_or_else(|| ApiError::Decode(format!("management point has no {pointer}")))
}

impl fmt::Display for SensorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outdoor={}, room={} / {}, hw={}, lwt={}",
            self.outdoor, self.room, self.target, self.hot_water, self.leaving_water
        )
    }
}

// Simple random number generation for jitter
mod rand {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use async_trait::async_trait;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubTokens {
        plain: AtomicUsize,
        forced: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for StubTokens {
        async fn bearer_token(&self) -> crate::error::Result<String> {
            self.plain.fetch_add(1, Ordering::SeqCst);
            Ok("tok-1".to_string())
        }

        async fn refreshed_bearer_token(&self) -> crate::error::Result<String> {
            self.forced.fetch_add(1, Ordering::SeqCst);
            Ok("tok-2".to_string())
        }
    }

    struct NoTokens;

    #[async_trait]
    impl TokenProvider for NoTokens {
        async fn bearer_token(&self) -> crate::error::Result<String> {
            Err(AuthError::NotBootstrapped {
                path: "/tmp/daikin_key.json".to_string(),
            })
        }

        async fn refreshed_bearer_token(&self) -> crate::error::Result<String> {
            self.bearer_token().await
        }
    }

    fn client(url: &str, tokens: Arc<dyn TokenProvider>, device: Option<&str>) -> OnectaClient {
        OnectaClient::new(tokens, url, device.map(str::to_string), 5, 5, 2)
            .unwrap()
            .with_base_delay_ms(1)
    }

    #[test]
    fn test_backoff_calculation() {
        let client = OnectaClient::new(Arc::new(StubTokens::default()), "http://x", None, 30, 30, 3)
            .unwrap();

        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        // Each delay should be roughly double the previous (with jitter)
        assert!((1000..=1100).contains(&delay0));
        assert!((2000..=2200).contains(&delay1));
        assert!((4000..=4400).contains(&delay2));

        // Large retry counts saturate instead of overflowing
        assert!(client.calculate_backoff_delay(200) >= u64::MAX / 2);
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/info")
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let tokens = Arc::new(StubTokens::default());
        let api = client(&format!("{}/v1", server.url()), tokens.clone(), None);

        assert_eq!(api.get("info").await.unwrap(), json!({"ok": true}));
        assert_eq!(tokens.plain.load(Ordering::SeqCst), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_forces_one_refresh() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/info")
            .match_header("authorization", "Bearer tok-1")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/info")
            .match_header("authorization", "Bearer tok-2")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let tokens = Arc::new(StubTokens::default());
        let api = client(&server.url(), tokens.clone(), None);

        assert_eq!(api.get("info").await.unwrap(), json!([]));
        assert_eq!(tokens.forced.load(Ordering::SeqCst), 1);
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let tokens = Arc::new(StubTokens::default());
        let api = client(&server.url(), tokens.clone(), None);

        assert!(matches!(
            api.get("info").await,
            Err(ApiError::Status { status: 401, .. })
        ));
        assert_eq!(tokens.forced.load(Ordering::SeqCst), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);

        assert!(matches!(
            api.get("info").await,
            Err(ApiError::Status { status: 502, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/info")
            .with_status(429)
            .with_body("daily limit reached")
            .expect(1)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);

        match api.get("info").await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "daily limit reached");
            }
            other => panic!("expected 429, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_credentials_stop_before_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/info").expect(0).create_async().await;

        let api = client(&server.url(), Arc::new(NoTokens), None);

        assert!(matches!(
            api.get("info").await,
            Err(ApiError::Auth(AuthError::NotBootstrapped { .. }))
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_management_points_keyed_by_embedded_id() {
        let mut server = mockito::Server::new_async().await;
        let _gateways = server
            .mock("GET", "/gateway-devices")
            .with_status(200)
            .with_body(
                json!([{
                    "id": "gw-1",
                    "managementPoints": [
                        {"embeddedId": "gateway", "ipAddress": {"value": "10.0.0.2"}},
                        {"embeddedId": "climateControl", "onOffMode": {"value": "on"}},
                        {"noId": true}
                    ]
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);
        let points = api.management_points().await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points["climateControl"]["onOffMode"]["value"], "on");
    }

    #[tokio::test]
    async fn test_set_room_temperature_patches_device() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "PATCH",
                "/gateway-devices/dev-1/management-points/climateControl/characteristics/temperatureControl",
            )
            .match_body(Matcher::Json(json!({
                "path": "/operationModes/heating/setpoints/roomTemperature",
                "value": 21.5
            })))
            .with_status(204)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), Some("dev-1"));
        api.set_room_temperature(21.5).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_patch_without_device_uses_discovered_gateway() {
        let mut server = mockito::Server::new_async().await;
        let gateways = server
            .mock("GET", "/gateway-devices")
            .with_status(200)
            .with_body(r#"[{"id":"gw-9","managementPoints":[]}]"#)
            .expect(1)
            .create_async()
            .await;
        let offset = server
            .mock(
                "PATCH",
                "/gateway-devices/gw-9/management-points/climateControl/characteristics/temperatureControl",
            )
            .match_body(Matcher::Json(json!({
                "path": "/operationModes/heating/setpoints/leavingWaterOffset",
                "value": -2
            })))
            .with_status(204)
            .expect(2)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);
        api.set_leaving_water_offset(-2).await.unwrap();
        assert_eq!(api.device().as_deref(), Some("gw-9"));

        // Discovery happens once; the id is reused afterwards
        api.set_leaving_water_offset(-2).await.unwrap();
        gateways.assert_async().await;
        offset.assert_async().await;
    }

    #[tokio::test]
    async fn test_gateway_without_id_is_config_error() {
        let mut server = mockito::Server::new_async().await;
        let _gateways = server
            .mock("GET", "/gateway-devices")
            .with_status(200)
            .with_body(r#"[{"managementPoints":[]}]"#)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);
        assert!(matches!(
            api.set_room_temperature(20.0).await,
            Err(ApiError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_powerful_mode_patches_hot_water_tank() {
        let mut server = mockito::Server::new_async().await;
        let on = server
            .mock(
                "PATCH",
                "/gateway-devices/dev-1/management-points/domesticHotWaterTank/characteristics/powerfulMode",
            )
            .match_body(Matcher::Json(json!({"value": "on"})))
            .with_status(204)
            .create_async()
            .await;
        let off = server
            .mock(
                "PATCH",
                "/gateway-devices/dev-1/management-points/domesticHotWaterTank/characteristics/powerfulMode",
            )
            .match_body(Matcher::Json(json!({"value": "off"})))
            .with_status(204)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), Some("dev-1"));
        api.set_powerful_mode(true).await.unwrap();
        api.set_powerful_mode(false).await.unwrap();
        on.assert_async().await;
        off.assert_async().await;
    }

    #[tokio::test]
    async fn test_patch_server_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "PATCH",
                "/gateway-devices/dev-1/management-points/domesticHotWaterTank/characteristics/powerfulMode",
            )
            .with_status(502)
            .expect(1)
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), Some("dev-1"));
        assert!(matches!(
            api.set_powerful_mode(true).await,
            Err(ApiError::Status { status: 502, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sensors_summarise_first_gateway() {
        let mut server = mockito::Server::new_async().await;
        let _gateways = server
            .mock("GET", "/gateway-devices")
            .with_status(200)
            .with_body(
                json!([{
                    "id": "gw-1",
                    "managementPoints": [
                        {
                            "embeddedId": "climateControlMainZone",
                            "sensoryData": {"value": {
                                "outdoorTemperature": {"value": 7},
                                "roomTemperature": {"value": 20.5},
                                "leavingWaterTemperature": {"value": 35}
                            }},
                            "temperatureControl": {"value": {"operationModes": {"auto": {
                                "setpoints": {"roomTemperature": {"value": 21}}
                            }}}}
                        },
                        {
                            "embeddedId": "domesticHotWaterTank",
                            "sensoryData": {"value": {"tankTemperature": {"value": 48}}}
                        }
                    ]
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let api = client(&server.url(), Arc::new(StubTokens::default()), None);
        let summary = api.sensors().await.unwrap();

        assert_eq!(summary.room, json!(20.5));
        assert_eq!(
            summary.to_string(),
            "outdoor=7, room=20.5 / 21, hw=48, lwt=35"
        );
    }

    #[test]
    fn test_sensors_missing_tank_is_decode_error() {
        let mut points = Map::new();
        points.insert("climateControl".to_string(), json!({}));
        assert!(matches!(
            SensorSummary::from_management_points(&points),
            Err(ApiError::Decode(_))
        ));
    }
}
