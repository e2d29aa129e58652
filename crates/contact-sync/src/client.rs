use crate::model::DatasourceRef;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

/// Credentials for one organization's Grafana instance.
#[derive(Debug, Clone)]
pub struct BackendCredentials {
    pub base_url: url::Url,
    pub api_token: String,
}

/// Alerting configuration of one datasource's alertmanager, as returned by
/// the config endpoint. Only the parts the sync touches are modeled; the
/// rest round-trips opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub alertmanager_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_files: Option<Value>,
}

/// A named notification destination created in the alerting backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub name: String,
}

/// Error descriptor of a failed backend call, carrying an HTTP-status-like
/// code when the backend produced one.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("datasource {datasource:?} cannot be addressed by a {version:?} backend")]
    Unaddressable {
        datasource: DatasourceRef,
        version: GrafanaVersion,
    },
}

impl ApiError {
    /// The HTTP-status-like code of this error, when one exists. Transport
    /// failures carry no code and classify as ambiguous (retryable).
    /// Addressing mismatches are reported as BAD_REQUEST, as the backend
    /// itself would reject the call, and are never retried.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            Self::Unaddressable { .. } => Some(400),
        }
    }
}

/// Grafana's alertmanager addressing differs by backend version, and the
/// sync core must not care: it depends only on the two-outcome contract of
/// [`AlertingBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrafanaVersion {
    /// Grafana 8: datasource alertmanagers are addressed by numeric id.
    Legacy,
    /// Grafana 9+ unified alerting: addressed by datasource uid.
    Unified,
}

/// The versioned, multi-step protocol against the alerting backend.
pub trait AlertingBackend: Send + Sync + 'static {
    /// Fetch the alerting configuration of `ds`.
    fn fetch_alerting_config<'s>(
        &'s self,
        creds: &'s BackendCredentials,
        ds: &'s DatasourceRef,
    ) -> impl std::future::Future<Output = Result<AlertingConfig, ApiError>> + Send + 's;

    /// Ask the alertmanager of `ds` for its status. For a datasource whose
    /// alerting is uninitialized, this call initializes default config.
    fn initialize_alertmanager<'s>(
        &'s self,
        creds: &'s BackendCredentials,
        ds: &'s DatasourceRef,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send + 's;

    /// Create a contact point named `name` for `ds`. Returns None when the
    /// backend did not produce one, for any reason.
    fn create_contact_point<'s>(
        &'s self,
        creds: &'s BackendCredentials,
        ds: &'s DatasourceRef,
        name: &'s str,
    ) -> impl std::future::Future<Output = Option<ContactPoint>> + Send + 's;
}

/// AlertingBackend implementation over the Grafana HTTP API.
#[derive(Clone)]
pub struct GrafanaClient {
    http: reqwest::Client,
    version: GrafanaVersion,
}

impl GrafanaClient {
    pub fn new(version: GrafanaVersion) -> Self {
        let http = reqwest::ClientBuilder::new()
            .user_agent(concat!("contact-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build http client");

        Self { http, version }
    }

    /// Alertmanager recipient for `ds`: the builtin datasource is addressed
    /// as `grafana` in every version; others by id or uid per the version.
    fn recipient(&self, ds: &DatasourceRef) -> Result<String, ApiError> {
        if ds.is_builtin() {
            return Ok("grafana".to_string());
        }
        match self.version {
            GrafanaVersion::Legacy => ds.id.map(|id| id.to_string()),
            GrafanaVersion::Unified => ds.uid.clone(),
        }
        .ok_or_else(|| ApiError::Unaddressable {
            datasource: ds.clone(),
            version: self.version,
        })
    }

    async fn api_get<T: DeserializeOwned>(
        &self,
        creds: &BackendCredentials,
        path: &str,
    ) -> Result<T, ApiError> {
        let url = creds
            .base_url
            .join(path)
            .expect("path must be valid to join");

        let response = self
            .http
            .get(url)
            .bearer_auth(&creds.api_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn api_post<B: Serialize>(
        &self,
        creds: &BackendCredentials,
        path: &str,
        body: &B,
    ) -> Result<(), ApiError> {
        let url = creds
            .base_url
            .join(path)
            .expect("path must be valid to join");

        let response = self
            .http
            .post(url)
            .bearer_auth(&creds.api_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn try_create_contact_point(
        &self,
        creds: &BackendCredentials,
        ds: &DatasourceRef,
        name: &str,
    ) -> Result<ContactPoint, ApiError> {
        let recipient = self.recipient(ds)?;
        let path = config_path(&recipient);

        // Contact points are created by round-tripping the alertmanager
        // config with the receiver and its route merged in.
        let mut config: AlertingConfig = self.api_get(creds, &path).await?;
        merge_contact_point(&mut config, name);
        self.api_post(creds, &path, &config).await?;

        Ok(ContactPoint {
            name: name.to_string(),
        })
    }
}

impl AlertingBackend for GrafanaClient {
    async fn fetch_alerting_config(
        &self,
        creds: &BackendCredentials,
        ds: &DatasourceRef,
    ) -> Result<AlertingConfig, ApiError> {
        let recipient = self.recipient(ds)?;
        self.api_get(creds, &config_path(&recipient)).await
    }

    async fn initialize_alertmanager(
        &self,
        creds: &BackendCredentials,
        ds: &DatasourceRef,
    ) -> Result<(), ApiError> {
        let recipient = self.recipient(ds)?;
        let _status: Value = self
            .api_get(creds, &format!("/api/alertmanager/{recipient}/api/v2/status"))
            .await?;
        Ok(())
    }

    async fn create_contact_point(
        &self,
        creds: &BackendCredentials,
        ds: &DatasourceRef,
        name: &str,
    ) -> Option<ContactPoint> {
        match self.try_create_contact_point(creds, ds, name).await {
            Ok(contact_point) => Some(contact_point),
            Err(error) => {
                tracing::warn!(?ds, %error, "failed to create contact point");
                None
            }
        }
    }
}

fn config_path(recipient: &str) -> String {
    format!("/api/alertmanager/{recipient}/config/api/v1/alerts")
}

/// Merge a receiver named `name`, and a route delivering to it, into the
/// alertmanager config. Merging is idempotent: an existing receiver or
/// route of the same name is left alone.
fn merge_contact_point(config: &mut AlertingConfig, name: &str) {
    if !config.alertmanager_config.is_object() {
        config.alertmanager_config = json!({});
    }
    let root = config.alertmanager_config.as_object_mut().unwrap();

    let receivers = root
        .entry("receivers")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(receivers) = receivers.as_array_mut() {
        let exists = receivers
            .iter()
            .any(|r| r.get("name").and_then(Value::as_str) == Some(name));
        if !exists {
            receivers.push(json!({ "name": name }));
        }
    }

    let route = root
        .entry("route")
        .or_insert_with(|| json!({ "receiver": name }));
    if let Some(route) = route.as_object_mut() {
        let children = route
            .entry("routes")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(children) = children.as_array_mut() {
            let exists = children
                .iter()
                .any(|r| r.get("receiver").and_then(Value::as_str) == Some(name));
            if !exists {
                children.push(json!({ "receiver": name, "continue": true }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_dispatches_on_version_and_datasource() {
        let legacy = GrafanaClient::new(GrafanaVersion::Legacy);
        let unified = GrafanaClient::new(GrafanaVersion::Unified);

        let builtin = DatasourceRef::builtin();
        assert_eq!(legacy.recipient(&builtin).unwrap(), "grafana");
        assert_eq!(unified.recipient(&builtin).unwrap(), "grafana");

        assert_eq!(legacy.recipient(&DatasourceRef::by_id(10)).unwrap(), "10");
        assert_eq!(
            unified.recipient(&DatasourceRef::by_uid("ds-a")).unwrap(),
            "ds-a"
        );
    }

    #[test]
    fn unaddressable_datasources_report_bad_request() {
        let legacy = GrafanaClient::new(GrafanaVersion::Legacy);

        let err = legacy
            .recipient(&DatasourceRef::by_uid("ds-a"))
            .unwrap_err();
        assert_eq!(err.status(), Some(400));

        let err = GrafanaClient::new(GrafanaVersion::Unified)
            .recipient(&DatasourceRef::by_id(10))
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn merge_contact_point_is_idempotent() {
        let mut config = AlertingConfig {
            alertmanager_config: Value::Null,
            template_files: None,
        };

        merge_contact_point(&mut config, "contact-point-42");
        let once = config.alertmanager_config.clone();
        merge_contact_point(&mut config, "contact-point-42");
        assert_eq!(config.alertmanager_config, once);

        let receivers = config.alertmanager_config["receivers"].as_array().unwrap();
        assert_eq!(receivers.len(), 1);
        assert_eq!(receivers[0]["name"], "contact-point-42");

        let routes = config.alertmanager_config["route"]["routes"]
            .as_array()
            .unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0]["receiver"], "contact-point-42");
    }

    #[test]
    fn status_codes_surface_through_api_error() {
        let err = ApiError::Status {
            status: 404,
            message: "no alertmanager".to_string(),
        };
        assert_eq!(err.status(), Some(404));
    }
}
