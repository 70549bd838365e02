//! EC2 API client implementation.
//!
//! Speaks the EC2 Query API: form-encoded `POST /` requests signed with
//! Signature Version 4, XML responses.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials::Credentials;
use super::models::{DescribeInstancesResponse, ErrorResponse, RunInstancesResponse};
use super::signing::{self, CONTENT_TYPE};
use crate::providers::traits::{
    Filter, Instance, InstanceApi, InstanceState, ProviderError, WaitConfig,
};
use crate::tags::Tag;
use crate::template::LaunchSpec;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// EC2 API version.
const API_VERSION: &str = "2016-11-15";

/// Signing name of the service.
const SERVICE: &str = "ec2";

/// Error code the provider returns while a new instance id is propagating.
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// Query parameters of one request.
type Params = Vec<(String, String)>;

/// EC2 instance API.
#[derive(Clone)]
pub struct Ec2 {
    /// HTTP client.
    client: Client,
    /// Signing credentials.
    credentials: Credentials,
    /// Endpoint override (tests, VPC endpoints).
    endpoint: Option<String>,
}

impl Ec2 {
    /// Create a new EC2 client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(credentials: Credentials) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            credentials,
            endpoint: None,
        })
    }

    /// Send every request to `endpoint` instead of the regional endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Get EC2 API endpoint for a region.
    fn endpoint(&self, region: &str) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ec2.{region}.amazonaws.com"))
    }

    /// Sign and execute a Query API action.
    async fn call<T: DeserializeOwned>(
        &self,
        region: &str,
        action: &str,
        params: Params,
    ) -> Result<T, ProviderError> {
        let endpoint = self.endpoint(region);
        let url = Url::parse(&endpoint)
            .map_err(|e| ProviderError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ProviderError::Config(format!(
                    "endpoint {endpoint} has no host"
                )))
            }
        };

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", action)
            .append_pair("Version", API_VERSION)
            .extend_pairs(params.iter())
            .finish();

        let signed = signing::sign(
            &self.credentials,
            region,
            SERVICE,
            &host,
            &body,
            chrono::Utc::now(),
        )?;

        debug!(action = %action, region = %region, endpoint = %endpoint, "EC2 request");

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            quick_xml::de::from_str(&text).map_err(|e| {
                warn!(action = %action, error = %e, body = %text, "Failed to parse response");
                ProviderError::Decode(e.to_string())
            })
        } else {
            Err(Self::api_error(status.as_u16(), &text))
        }
    }

    /// Map an error document to [`ProviderError::Api`].
    fn api_error(status: u16, body: &str) -> ProviderError {
        match quick_xml::de::from_str::<ErrorResponse>(body) {
            Ok(doc) => {
                let first = doc.errors.error.into_iter().next();
                ProviderError::Api {
                    status,
                    code: first
                        .as_ref()
                        .map_or_else(|| "Unknown".to_string(), |e| e.code.clone()),
                    message: first.map(|e| e.message).unwrap_or_default(),
                }
            }
            Err(_) => ProviderError::Api {
                status,
                code: "Unknown".to_string(),
                message: body.to_string(),
            },
        }
    }

    /// Describe instances, following pagination.
    async fn describe(
        &self,
        region: &str,
        filters: &[Filter],
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params = filter_params(filters);
            if let Some(token) = next_token.take() {
                params.push(("NextToken".to_string(), token));
            }

            let page: DescribeInstancesResponse =
                self.call(region, "DescribeInstances", params).await?;
            for reservation in page.reservation_set.items {
                for ec2 in reservation.instances_set.items {
                    instances.push(ec2.into_instance()?);
                }
            }

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => return Ok(instances),
            }
        }
    }
}

/// States from which `target` can no longer be reached.
fn unreachable_states(target: InstanceState) -> &'static [InstanceState] {
    match target {
        InstanceState::Running => &[
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
            InstanceState::Stopping,
        ],
        InstanceState::Stopped => &[InstanceState::Pending, InstanceState::Terminated],
        InstanceState::Terminated => &[InstanceState::Pending, InstanceState::Stopping],
        _ => &[],
    }
}

/// `Filter.N.Name` / `Filter.N.Value.M` parameters.
fn filter_params(filters: &[Filter]) -> Params {
    let mut params = Vec::new();
    for (i, filter) in filters.iter().enumerate() {
        let n = i + 1;
        params.push((format!("Filter.{n}.Name"), filter.name.clone()));
        for (j, value) in filter.values.iter().enumerate() {
            params.push((format!("Filter.{n}.Value.{}", j + 1), value.clone()));
        }
    }
    params
}

/// `{prefix}.N` parameters for a list of instance ids.
fn id_params(prefix: &str, ids: &[String]) -> Params {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (format!("{prefix}.{}", i + 1), id.clone()))
        .collect()
}

/// `{prefix}.N.Key` / `{prefix}.N.Value` parameters.
fn tag_params(prefix: &str, tags: &[Tag]) -> Params {
    let mut params = Vec::new();
    for (i, tag) in tags.iter().enumerate() {
        let n = i + 1;
        params.push((format!("{prefix}.{n}.Key"), tag.key.clone()));
        params.push((format!("{prefix}.{n}.Value"), tag.value.clone()));
    }
    params
}

/// `RunInstances` parameters for a launch spec.
fn launch_params(spec: &LaunchSpec) -> Params {
    let mut params = Vec::new();
    let mut push = |key: String, value: String| params.push((key, value));

    if let Some(image_id) = &spec.image_id {
        push("ImageId".into(), image_id.clone());
    }
    if let Some(instance_type) = &spec.instance_type {
        push("InstanceType".into(), instance_type.clone());
    }
    if let Some(key_name) = &spec.key_name {
        push("KeyName".into(), key_name.clone());
    }
    push("MinCount".into(), spec.min_count.to_string());
    push("MaxCount".into(), spec.max_count.to_string());
    if let Some(subnet_id) = &spec.subnet_id {
        push("SubnetId".into(), subnet_id.clone());
    }
    for (i, sg) in spec.security_group_ids.iter().enumerate() {
        push(format!("SecurityGroupId.{}", i + 1), sg.clone());
    }

    for (i, ni) in spec.network_interfaces.iter().enumerate() {
        let p = format!("NetworkInterface.{}", i + 1);
        push(format!("{p}.DeviceIndex"), ni.device_index.to_string());
        if let Some(subnet_id) = &ni.subnet_id {
            push(format!("{p}.SubnetId"), subnet_id.clone());
        }
        for (j, group) in ni.groups.iter().enumerate() {
            push(format!("{p}.SecurityGroupId.{}", j + 1), group.clone());
        }
        if let Some(public) = ni.associate_public_ip_address {
            push(format!("{p}.AssociatePublicIpAddress"), public.to_string());
        }
        if let Some(delete) = ni.delete_on_termination {
            push(format!("{p}.DeleteOnTermination"), delete.to_string());
        }
    }

    for (i, bdm) in spec.block_device_mappings.iter().enumerate() {
        let p = format!("BlockDeviceMapping.{}", i + 1);
        push(format!("{p}.DeviceName"), bdm.device_name.clone());
        if let Some(ebs) = &bdm.ebs {
            if let Some(size) = ebs.volume_size {
                push(format!("{p}.Ebs.VolumeSize"), size.to_string());
            }
            if let Some(volume_type) = &ebs.volume_type {
                push(format!("{p}.Ebs.VolumeType"), volume_type.clone());
            }
            if let Some(iops) = ebs.iops {
                push(format!("{p}.Ebs.Iops"), iops.to_string());
            }
            if let Some(delete) = ebs.delete_on_termination {
                push(format!("{p}.Ebs.DeleteOnTermination"), delete.to_string());
            }
            if let Some(encrypted) = ebs.encrypted {
                push(format!("{p}.Ebs.Encrypted"), encrypted.to_string());
            }
        }
    }

    if let Some(profile) = &spec.iam_instance_profile {
        if let Some(arn) = &profile.arn {
            push("IamInstanceProfile.Arn".into(), arn.clone());
        }
        if let Some(name) = &profile.name {
            push("IamInstanceProfile.Name".into(), name.clone());
        }
    }

    if let Some(user_data) = &spec.user_data {
        push(
            "UserData".into(),
            base64::engine::general_purpose::STANDARD.encode(user_data),
        );
    }

    if let Some(market) = &spec.instance_market_options {
        push("InstanceMarketOptions.MarketType".into(), market.market_type.clone());
        if let Some(spot) = &market.spot_options {
            let p = "InstanceMarketOptions.SpotOptions";
            if let Some(price) = &spot.max_price {
                push(format!("{p}.MaxPrice"), price.clone());
            }
            if let Some(kind) = &spot.spot_instance_type {
                push(format!("{p}.SpotInstanceType"), kind.clone());
            }
            if let Some(behavior) = &spot.instance_interruption_behavior {
                push(format!("{p}.InstanceInterruptionBehavior"), behavior.clone());
            }
        }
    }

    for (i, ts) in spec.tag_specifications.iter().enumerate() {
        let p = format!("TagSpecification.{}", i + 1);
        push(format!("{p}.ResourceType"), ts.resource_type.clone());
        for (key, value) in tag_params(&format!("{p}.Tag"), &ts.tags) {
            push(key, value);
        }
    }

    params
}

#[async_trait]
impl InstanceApi for Ec2 {
    async fn list_instances(
        &self,
        region: &str,
        filters: &[Filter],
    ) -> Result<Vec<Instance>, ProviderError> {
        self.describe(region, filters).await
    }

    async fn create_instances(
        &self,
        region: &str,
        spec: LaunchSpec,
    ) -> Result<Vec<Instance>, ProviderError> {
        info!(
            region = %region,
            instance_type = spec.instance_type.as_deref().unwrap_or("-"),
            subnet_id = spec.subnet_id.as_deref().unwrap_or("-"),
            count = spec.max_count,
            "Creating EC2 instances"
        );

        let response: RunInstancesResponse = self
            .call(region, "RunInstances", launch_params(&spec))
            .await?;

        response
            .instances_set
            .items
            .into_iter()
            .map(super::models::Ec2Instance::into_instance)
            .collect()
    }

    async fn start_instances(&self, region: &str, ids: &[String]) -> Result<(), ProviderError> {
        self.call::<serde::de::IgnoredAny>(region, "StartInstances", id_params("InstanceId", ids))
            .await?;
        info!(instance_ids = ?ids, "Instance start initiated");
        Ok(())
    }

    async fn stop_instances(&self, region: &str, ids: &[String]) -> Result<(), ProviderError> {
        self.call::<serde::de::IgnoredAny>(region, "StopInstances", id_params("InstanceId", ids))
            .await?;
        info!(instance_ids = ?ids, "Instance stop initiated");
        Ok(())
    }

    async fn terminate_instances(
        &self,
        region: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        self.call::<serde::de::IgnoredAny>(
            region,
            "TerminateInstances",
            id_params("InstanceId", ids),
        )
        .await?;
        info!(instance_ids = ?ids, "Instance termination initiated");
        Ok(())
    }

    async fn create_tags(
        &self,
        region: &str,
        ids: &[String],
        tags: &[Tag],
    ) -> Result<(), ProviderError> {
        let mut params = id_params("ResourceId", ids);
        params.extend(tag_params("Tag", tags));
        self.call::<serde::de::IgnoredAny>(region, "CreateTags", params)
            .await?;
        Ok(())
    }

    async fn wait_until(
        &self,
        region: &str,
        filters: &[Filter],
        target: InstanceState,
        config: WaitConfig,
    ) -> Result<(), ProviderError> {
        let unreachable = unreachable_states(target);

        for attempt in 1..=config.max_attempts {
            match self.describe(region, filters).await {
                Ok(instances) => {
                    if let Some(bad) = instances.iter().find(|i| unreachable.contains(&i.state)) {
                        return Err(ProviderError::WaiterFailed {
                            target,
                            instance_id: bad.id.clone(),
                            observed: bad.state,
                        });
                    }
                    if !instances.is_empty() && instances.iter().all(|i| i.state == target) {
                        return Ok(());
                    }
                    debug!(
                        target = %target,
                        attempt,
                        matched = instances.len(),
                        "Polling instance states"
                    );
                }
                Err(ProviderError::Api { code, .. }) if code == INSTANCE_NOT_FOUND => {
                    debug!(attempt, "Instance ids not yet visible");
                }
                Err(e) => return Err(e),
            }

            if attempt < config.max_attempts {
                tokio::time::sleep(config.delay).await;
            }
        }

        Err(ProviderError::Timeout {
            target,
            attempts: config.max_attempts,
        })
    }
}
