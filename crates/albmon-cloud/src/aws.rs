//! Signed HTTPS client for the ELBv2 directory API and the CloudWatch
//! statistics API.

use crate::error::{AlbError, Result};
use crate::{
    AlbAccountConfig, Datapoint, LoadBalancerDirectory, LoadBalancerRecord, MetricStatistics,
    StatisticQuery,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const ELB_SERVICE: &str = "elasticloadbalancing";
const ELB_VERSION: &str = "2015-12-01";
const MONITORING_SERVICE: &str = "monitoring";
const GET_METRIC_STATISTICS_TARGET: &str = "GraniteServiceVersion20100801.GetMetricStatistics";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const IMDS_ENDPOINT: &str = "http://169.254.169.254";

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl AwsCredentials {
    /// Resolve credentials the way the AWS default chain does: static keys
    /// from the config, the standard environment variables, the shared
    /// credentials file, then the EC2 instance role.
    ///
    /// # Errors
    ///
    /// Returns [`AlbError::MissingCredentials`] when no source has a key pair.
    pub async fn resolve(config: &AlbAccountConfig) -> Result<Self> {
        if let Some(creds) = Self::from_config(config) {
            return Ok(creds);
        }
        if let Some(creds) = Self::from_env() {
            return Ok(creds);
        }
        if let Some(creds) = Self::from_shared_file() {
            return Ok(creds);
        }

        match instance_role_credentials().await {
            Ok(creds) => Ok(creds),
            Err(e) => {
                tracing::warn!(error = %e, "Instance role credential lookup failed");
                Err(AlbError::MissingCredentials)
            }
        }
    }

    fn from_config(config: &AlbAccountConfig) -> Option<Self> {
        let id = non_empty(config.access_key_id.as_deref())?;
        let secret = non_empty(config.secret_access_key.as_deref())?;
        Some(Self {
            access_key_id: id.to_string(),
            secret_access_key: secret.to_string(),
            session_token: None,
        })
    }

    fn from_env() -> Option<Self> {
        let id = std::env::var("AWS_ACCESS_KEY_ID").ok();
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
        let (id, secret) = (non_empty(id.as_deref())?, non_empty(secret.as_deref())?);
        Some(Self {
            access_key_id: id.to_string(),
            secret_access_key: secret.to_string(),
            session_token: std::env::var("AWS_SESSION_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        })
    }

    /// `AWS_SHARED_CREDENTIALS_FILE` or `~/.aws/credentials`, profile from
    /// `AWS_PROFILE` (default `default`).
    fn from_shared_file() -> Option<Self> {
        let path = match std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
            _ => PathBuf::from(std::env::var_os("HOME")?)
                .join(".aws")
                .join("credentials"),
        };
        let profile = std::env::var("AWS_PROFILE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "default".to_string());

        let content = std::fs::read_to_string(&path).ok()?;
        let creds = parse_shared_credentials(&content, profile.trim());
        if creds.is_none() {
            tracing::debug!(
                path = %path.display(),
                profile = %profile,
                "No keys for profile in shared credentials file"
            );
        }
        creds
    }
}

/// Keys of `profile` in an INI-style shared credentials file.
pub fn parse_shared_credentials(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut id = None;
    let mut secret = None;
    let mut token = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "aws_access_key_id" => id = Some(value),
            "aws_secret_access_key" => secret = Some(value),
            "aws_session_token" => token = Some(value),
            _ => {}
        }
    }

    Some(AwsCredentials {
        access_key_id: id.filter(|v| !v.is_empty())?,
        secret_access_key: secret.filter(|v| !v.is_empty())?,
        session_token: token.filter(|v| !v.is_empty()),
    })
}

/// Credentials document served by IMDS under
/// `iam/security-credentials/<role>`.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRoleDocument {
    code: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    token: Option<String>,
}

/// Parse an instance role credentials document.
///
/// # Errors
///
/// Returns an API error when `Code` is not `Success` and
/// [`AlbError::MissingCredentials`] when the key pair is absent.
pub fn parse_instance_credentials(body: &str) -> Result<AwsCredentials> {
    let doc: InstanceRoleDocument = serde_json::from_str(body)?;
    if let Some(code) = doc.code.as_deref().filter(|c| *c != "Success") {
        return Err(AlbError::ApiResponseError {
            service: "imds".to_string(),
            code: code.to_string(),
            message: "instance role credentials unavailable".to_string(),
        });
    }

    match (
        non_empty(doc.access_key_id.as_deref()),
        non_empty(doc.secret_access_key.as_deref()),
    ) {
        (Some(id), Some(secret)) => Ok(AwsCredentials {
            access_key_id: id.to_string(),
            secret_access_key: secret.to_string(),
            session_token: doc.token.filter(|t| !t.is_empty()),
        }),
        _ => Err(AlbError::MissingCredentials),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Headers produced by SigV4 signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

pub struct AwsClient {
    region: String,
    credentials: AwsCredentials,
    client: Client,
}

impl AwsClient {
    /// Build a client from config, resolving credentials and region.
    ///
    /// # Errors
    ///
    /// Any error here is a setup failure and should abort the run.
    pub async fn new(config: &AlbAccountConfig) -> Result<Self> {
        let credentials = AwsCredentials::resolve(config).await?;
        let region = resolve_region(config.region.as_deref()).await?;
        Self::with_region(region, credentials)
    }

    pub fn with_region(region: impl Into<String>, credentials: AwsCredentials) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AlbError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            region: region.into(),
            credentials,
            client,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn host(&self, service: &str) -> String {
        format!("{}.{}.amazonaws.com", service, self.region)
    }

    /// AWS Signature Version 4 for a `POST /` request.
    pub fn sign_v4(
        &self,
        service: &str,
        host: &str,
        content_type: &str,
        amz_target: Option<&str>,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        // Step 1: Build canonical request
        let mut headers = BTreeMap::new();
        headers.insert("content-type", content_type.to_string());
        headers.insert("host", host.to_string());
        headers.insert("x-amz-date", amz_date.clone());
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token", token.clone());
        }
        if let Some(target) = amz_target {
            headers.insert("x-amz-target", target.to_string());
        }
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers = headers.keys().copied().collect::<Vec<_>>().join(";");

        let hashed_payload = format!("{:x}", Sha256::digest(payload.as_bytes()));
        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers, signed_headers, hashed_payload
        );
        let hashed_canonical_request = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        // Step 2: Build string to sign
        let credential_scope = format!("{}/{}/{}/aws4_request", date, self.region, service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date, credential_scope, hashed_canonical_request
        );

        // Step 3: Calculate signature
        let key = signing_key(&self.credentials.secret_access_key, &date, &self.region, service)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        // Step 4: Build authorization header
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        Ok(SignedHeaders {
            amz_date,
            authorization,
        })
    }

    async fn post_signed(
        &self,
        service: &str,
        content_type: &str,
        amz_target: Option<&str>,
        payload: String,
    ) -> Result<(reqwest::StatusCode, String)> {
        let host = self.host(service);
        let signed = self.sign_v4(service, &host, content_type, amz_target, &payload, Utc::now())?;

        let mut request = self
            .client
            .post(format!("https://{}/", host))
            .header("Content-Type", content_type)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization);
        if let Some(token) = &self.credentials.session_token {
            request = request.header("X-Amz-Security-Token", token);
        }
        if let Some(target) = amz_target {
            request = request.header("X-Amz-Target", target);
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Call an ELBv2 query-protocol action and return the XML body.
    async fn call_elb(&self, action: &str, params: BTreeMap<String, String>) -> Result<String> {
        let mut form = BTreeMap::new();
        form.insert("Action".to_string(), action.to_string());
        form.insert("Version".to_string(), ELB_VERSION.to_string());
        form.extend(params);
        let payload = form
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let (status, body) = self
            .post_signed(ELB_SERVICE, FORM_CONTENT_TYPE, None, payload)
            .await?;

        // Error documents come back with a 4xx/5xx status
        if body.contains("<Error>") {
            let code = xml_elements(&body, "Code")
                .into_iter()
                .next()
                .unwrap_or_else(|| "Unknown".to_string());
            let message = xml_elements(&body, "Message")
                .into_iter()
                .next()
                .unwrap_or_else(|| "Unknown".to_string());
            return Err(AlbError::ApiResponseError {
                service: ELB_SERVICE.to_string(),
                code,
                message,
            });
        }
        if !status.is_success() {
            return Err(AlbError::HttpError {
                service: ELB_SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    /// Call a CloudWatch JSON-protocol action.
    async fn call_monitoring(&self, target: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let (status, body) = self
            .post_signed(
                MONITORING_SERVICE,
                JSON_CONTENT_TYPE,
                Some(target),
                payload.to_string(),
            )
            .await?;

        if !status.is_success() {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
                if let Some(kind) = json.get("__type").and_then(|t| t.as_str()) {
                    let code = kind.rsplit('#').next().unwrap_or(kind).to_string();
                    let message = json
                        .get("message")
                        .or_else(|| json.get("Message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("Unknown")
                        .to_string();
                    return Err(AlbError::ApiResponseError {
                        service: MONITORING_SERVICE.to_string(),
                        code,
                        message,
                    });
                }
            }
            return Err(AlbError::HttpError {
                service: MONITORING_SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl LoadBalancerDirectory for AwsClient {
    async fn describe_load_balancers(&self, name: &str) -> Result<Vec<LoadBalancerRecord>> {
        let mut params = BTreeMap::new();
        params.insert("Names.member.1".to_string(), name.to_string());

        let body = match self.call_elb("DescribeLoadBalancers", params).await {
            Ok(body) => body,
            Err(AlbError::ApiResponseError { code, .. }) if code == "LoadBalancerNotFound" => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let arns = xml_elements(&body, "LoadBalancerArn");
        let names = xml_elements(&body, "LoadBalancerName");
        Ok(arns
            .into_iter()
            .zip(names)
            .map(|(arn, name)| LoadBalancerRecord { arn, name })
            .collect())
    }

    async fn describe_target_groups(&self, load_balancer_arn: &str) -> Result<Vec<String>> {
        let mut all_arns = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = BTreeMap::new();
            params.insert("LoadBalancerArn".to_string(), load_balancer_arn.to_string());
            if let Some(m) = &marker {
                params.insert("Marker".to_string(), m.clone());
            }

            let body = self.call_elb("DescribeTargetGroups", params).await?;
            all_arns.extend(xml_elements(&body, "TargetGroupArn"));

            marker = xml_elements(&body, "NextMarker")
                .into_iter()
                .next()
                .filter(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }

        Ok(all_arns)
    }
}

#[async_trait::async_trait]
impl MetricStatistics for AwsClient {
    async fn get_metric_statistics(&self, query: &StatisticQuery) -> Result<Vec<Datapoint>> {
        let payload = serde_json::json!({
            "Namespace": query.namespace,
            "MetricName": query.metric_name,
            "Dimensions": query.dimensions,
            "StartTime": query.start.timestamp(),
            "EndTime": query.end.timestamp(),
            "Period": query.period_secs,
            "Statistics": [query.aggregation.to_string()],
        });

        let response = self
            .call_monitoring(GET_METRIC_STATISTICS_TARGET, &payload)
            .await?;
        Ok(parse_datapoints(&response))
    }
}

/// Read `Datapoints` from a `GetMetricStatistics` JSON response.
///
/// Points without a usable timestamp are dropped.
pub fn parse_datapoints(response: &serde_json::Value) -> Vec<Datapoint> {
    let Some(points) = response.get("Datapoints").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    points
        .iter()
        .filter_map(|dp| {
            let timestamp = match dp.get("Timestamp")? {
                serde_json::Value::Number(n) => {
                    let secs = n.as_f64()?;
                    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)?
                }
                serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .ok()?
                    .with_timezone(&Utc),
                _ => return None,
            };
            Some(Datapoint {
                timestamp,
                sum: dp.get("Sum").and_then(|v| v.as_f64()),
                average: dp.get("Average").and_then(|v| v.as_f64()),
            })
        })
        .collect()
}

/// Text of every `<tag>...</tag>` element, in document order.
pub fn xml_elements(body: &str, tag: &str) -> Vec<String> {
    let pattern = format!(r"<{0}>([^<]*)</{0}>", regex::escape(tag));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| xml_unescape(m.as_str().trim()))
        .collect()
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Region from config, then `AWS_REGION`/`AWS_DEFAULT_REGION`, then instance metadata.
///
/// # Errors
///
/// Returns [`AlbError::MissingRegion`] when no source answers.
pub async fn resolve_region(configured: Option<&str>) -> Result<String> {
    if let Some(region) = non_empty(configured) {
        return Ok(region.to_string());
    }
    for var in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
        if let Ok(region) = std::env::var(var) {
            if !region.trim().is_empty() {
                return Ok(region.trim().to_string());
            }
        }
    }

    match instance_metadata_region().await {
        Ok(region) => Ok(region),
        Err(e) => {
            tracing::warn!(error = %e, "Instance metadata region lookup failed");
            Err(AlbError::MissingRegion)
        }
    }
}

fn imds_client() -> Result<Client> {
    Ok(Client::builder().timeout(Duration::from_secs(2)).build()?)
}

/// IMDSv2 session token.
async fn imds_token(client: &Client) -> Result<String> {
    Ok(client
        .put(format!("{IMDS_ENDPOINT}/latest/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

async fn imds_get(client: &Client, token: &str, path: &str) -> Result<String> {
    Ok(client
        .get(format!("{IMDS_ENDPOINT}/latest/meta-data/{path}"))
        .header("X-aws-ec2-metadata-token", token)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

async fn instance_metadata_region() -> Result<String> {
    let client = imds_client()?;
    let token = imds_token(&client).await?;
    let region = imds_get(&client, &token, "placement/region").await?;

    non_empty(Some(region.as_str()))
        .map(str::to_string)
        .ok_or(AlbError::MissingRegion)
}

/// Credentials of the first role attached to the instance profile.
async fn instance_role_credentials() -> Result<AwsCredentials> {
    let client = imds_client()?;
    let token = imds_token(&client).await?;

    let roles = imds_get(&client, &token, "iam/security-credentials/").await?;
    let role = roles
        .lines()
        .map(str::trim)
        .find(|r| !r.is_empty())
        .ok_or(AlbError::MissingCredentials)?;

    let body = imds_get(&client, &token, &format!("iam/security-credentials/{role}")).await?;
    let creds = parse_instance_credentials(&body)?;
    tracing::debug!(role, "Using instance role credentials");
    Ok(creds)
}

/// SigV4 signing key: `AWS4<secret>` -> date -> region -> service -> `aws4_request`.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// HMAC-SHA256 helper function
fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| AlbError::HmacError(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
