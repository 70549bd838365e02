//! Cluster instance provisioning.
//!
//! The [`Provisioner`] keeps no state of its own: every call rediscovers the
//! cluster's instances by filtering on [`TagKey::ClusterName`].

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::providers::{Filter, Instance, InstanceApi, InstanceState, WaitConfig};
use crate::ssh::{self, SshWaitConfig};
use crate::tags::{format_tags, merge_tag_specs, TagKey, TagSpecification};
use crate::template::NodeTemplate;

/// Minimum number of launch attempts before giving up.
pub const DEFAULT_MIN_CREATE_ATTEMPTS: usize = 5;

/// Instances keyed by provider id.
pub type InstanceMap = BTreeMap<String, Instance>;

/// Provisioner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Floor of the launch attempt budget; the budget is raised to the number
    /// of candidate subnets so every subnet is tried at least once.
    pub min_create_attempts: usize,
    /// Polling cadence for lifecycle waits.
    pub wait: WaitConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            min_create_attempts: DEFAULT_MIN_CREATE_ATTEMPTS,
            wait: WaitConfig::default(),
        }
    }
}

/// Network addresses of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceAddresses {
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

/// Converges a cluster's instances on a provider.
#[derive(Debug, Clone)]
pub struct Provisioner<A> {
    api: A,
    config: ProvisionerConfig,
}

fn cluster_filter(cluster_name: &str) -> Filter {
    Filter::tag(TagKey::ClusterName, [cluster_name])
}

fn ids_of(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|i| i.id.clone()).collect()
}

fn into_map(instances: Vec<Instance>) -> InstanceMap {
    instances.into_iter().map(|i| (i.id.clone(), i)).collect()
}

impl<A: InstanceApi> Provisioner<A> {
    /// Create a provisioner with default settings.
    pub fn new(api: A) -> Self {
        Self::with_config(api, ProvisionerConfig::default())
    }

    /// Create a provisioner with explicit settings.
    pub fn with_config(api: A, config: ProvisionerConfig) -> Self {
        Self { api, config }
    }

    /// The underlying provider API.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Launch `count` new instances for `cluster_name`.
    ///
    /// Each attempt pins one subnet from the template's `SubnetIds`, rotating
    /// through them when the provider rejects a launch (capacity is often
    /// exhausted in a single availability zone). The attempt budget is
    /// `max(min_create_attempts, subnet count)`.
    ///
    /// # Errors
    /// - [`ProvisionError::InvalidTemplate`] if the template lists no subnets.
    /// - [`ProvisionError::ProvisioningExhausted`] if every attempt was rejected.
    /// - [`ProvisionError::Provider`] for any other provider failure; these are
    ///   not retried because the launch may have gone through.
    pub async fn create_instances(
        &self,
        region: &str,
        cluster_name: &str,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
        count: usize,
    ) -> Result<InstanceMap, ProvisionError> {
        if count == 0 {
            return Ok(InstanceMap::new());
        }

        let subnet_ids = &template.subnet_ids;
        if subnet_ids.is_empty() {
            return Err(ProvisionError::InvalidTemplate(
                "SubnetIds must list at least one subnet".to_string(),
            ));
        }

        let mut all_tags = BTreeMap::from([
            (TagKey::Name.as_str().to_string(), cluster_name.to_string()),
            (TagKey::ClusterName.as_str().to_string(), cluster_name.to_string()),
        ]);
        all_tags.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut tag_specs = vec![TagSpecification::instance(format_tags(&all_tags))];
        merge_tag_specs(&mut tag_specs, &template.tag_specifications);

        let mut spec = template.launch_spec();
        spec.min_count = count;
        spec.max_count = count;
        spec.tag_specifications = tag_specs;
        if !spec.network_interfaces.is_empty() {
            // The provider rejects SecurityGroupIds alongside NetworkInterfaces.
            spec.security_group_ids.clear();
        }

        let max_attempts = self.config.min_create_attempts.max(subnet_ids.len());
        let mut attempt = 0;

        loop {
            if spec.network_interfaces.is_empty() {
                spec.subnet_id = Some(subnet_ids[attempt % subnet_ids.len()].clone());
            }

            info!(
                cluster_name = %cluster_name,
                region = %region,
                count,
                attempt = attempt + 1,
                max_attempts,
                subnet_id = spec.subnet_id.as_deref().unwrap_or("-"),
                "Launching instances"
            );

            match self.api.create_instances(region, spec.clone()).await {
                Ok(created) => {
                    info!(
                        cluster_name = %cluster_name,
                        instance_ids = ?ids_of(&created),
                        "Instances launched"
                    );
                    return Ok(into_map(created));
                }
                Err(e) if e.is_client_error() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(ProvisionError::ProvisioningExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!(
                        cluster_name = %cluster_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Launch attempt failed, retrying in next subnet"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Start previously stopped instances of `cluster_name`.
    ///
    /// Considers at most `max_count` stopped or stopping instances (any of them,
    /// in provider order). Stopping instances are waited on until stopped
    /// before the start request. Non-empty `tags` are applied to every resumed
    /// instance.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Provider`] if any provider call fails.
    pub async fn resume_instances(
        &self,
        region: &str,
        cluster_name: &str,
        tags: &BTreeMap<String, String>,
        max_count: Option<usize>,
    ) -> Result<InstanceMap, ProvisionError> {
        let filters = [
            Filter::states(&[InstanceState::Stopped, InstanceState::Stopping]),
            cluster_filter(cluster_name),
        ];
        let mut candidates = self.api.list_instances(region, &filters).await?;
        if let Some(max_count) = max_count {
            candidates.truncate(max_count);
        }
        if candidates.is_empty() {
            debug!(cluster_name = %cluster_name, "No stopped instances to resume");
            return Ok(InstanceMap::new());
        }

        let ids = ids_of(&candidates);
        let stopping: Vec<String> = candidates
            .iter()
            .filter(|i| i.state == InstanceState::Stopping)
            .map(|i| i.id.clone())
            .collect();

        if !stopping.is_empty() {
            info!(instance_ids = ?stopping, "Waiting for stopping instances before resume");
            self.api
                .wait_until(
                    region,
                    &[Filter::instance_ids(&stopping)],
                    InstanceState::Stopped,
                    self.config.wait,
                )
                .await?;
        }

        info!(cluster_name = %cluster_name, instance_ids = ?ids, "Resuming stopped instances");
        self.api.start_instances(region, &ids).await?;

        // The provider rejects a tag update with no tags.
        if !tags.is_empty() {
            self.api.create_tags(region, &ids, &format_tags(tags)).await?;
        }

        Ok(into_map(candidates))
    }

    /// Bring `cluster_name` up to `count` new or resumed instances.
    ///
    /// Resumes stopped instances first when `resume_stopped` is set, then
    /// launches enough new ones to cover the shortfall. Instances of the
    /// cluster that are already running are not counted.
    ///
    /// # Errors
    /// Propagates errors from [`Self::resume_instances`] and
    /// [`Self::create_instances`].
    pub async fn ensure_count(
        &self,
        region: &str,
        cluster_name: &str,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
        count: usize,
        resume_stopped: bool,
    ) -> Result<InstanceMap, ProvisionError> {
        let mut nodes = if resume_stopped {
            self.resume_instances(region, cluster_name, tags, Some(count))
                .await?
        } else {
            InstanceMap::new()
        };

        let remaining = count.saturating_sub(nodes.len());
        info!(
            cluster_name = %cluster_name,
            resumed = nodes.len(),
            to_create = remaining,
            "Converging instance count"
        );

        if remaining > 0 {
            let created = self
                .create_instances(region, cluster_name, template, tags, remaining)
                .await?;
            nodes.extend(created);
        }

        Ok(nodes)
    }

    /// Stop the pending and running instances of `cluster_name`.
    ///
    /// Returns the ids asked to stop.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Provider`] if any provider call fails.
    pub async fn stop_instances(
        &self,
        region: &str,
        cluster_name: &str,
    ) -> Result<Vec<String>, ProvisionError> {
        let filters = [
            Filter::states(&[InstanceState::Pending, InstanceState::Running]),
            cluster_filter(cluster_name),
        ];
        let ids = ids_of(&self.api.list_instances(region, &filters).await?);
        if !ids.is_empty() {
            info!(cluster_name = %cluster_name, instance_ids = ?ids, "Stopping instances");
            self.api.stop_instances(region, &ids).await?;
        }
        Ok(ids)
    }

    /// Terminate every instance of `cluster_name` that is not already
    /// shutting down or terminated.
    ///
    /// Returns the ids asked to terminate.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Provider`] if any provider call fails.
    pub async fn terminate_instances(
        &self,
        region: &str,
        cluster_name: &str,
    ) -> Result<Vec<String>, ProvisionError> {
        let filters = [
            Filter::states(&[
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::Stopping,
                InstanceState::Stopped,
            ]),
            cluster_filter(cluster_name),
        ];
        let ids = ids_of(&self.api.list_instances(region, &filters).await?);
        if !ids.is_empty() {
            info!(cluster_name = %cluster_name, instance_ids = ?ids, "Terminating instances");
            self.api.terminate_instances(region, &ids).await?;
        }
        Ok(ids)
    }

    /// Block until every instance of `cluster_name` reaches `state`.
    ///
    /// Only running, stopped and terminated can be waited for. Unless waiting
    /// for termination, terminated instances are excluded: an old cluster with
    /// the same name would otherwise make the wait unsatisfiable.
    ///
    /// # Errors
    /// - [`ProvisionError::UnsupportedState`] for any other target, before any
    ///   provider call.
    /// - [`ProvisionError::Provider`] if the provider wait fails.
    pub async fn wait_instances(
        &self,
        region: &str,
        cluster_name: &str,
        state: InstanceState,
    ) -> Result<(), ProvisionError> {
        if !matches!(
            state,
            InstanceState::Running | InstanceState::Stopped | InstanceState::Terminated
        ) {
            return Err(ProvisionError::UnsupportedState(state));
        }

        let mut filters = vec![cluster_filter(cluster_name)];
        if state != InstanceState::Terminated {
            filters.push(Filter::states(&[
                InstanceState::Pending,
                InstanceState::Running,
                InstanceState::ShuttingDown,
                InstanceState::Stopping,
                InstanceState::Stopped,
            ]));
        }

        info!(cluster_name = %cluster_name, region = %region, state = %state, "Waiting for instances");
        self.api
            .wait_until(region, &filters, state, self.config.wait)
            .await?;
        Ok(())
    }

    /// Addresses of the running instances of `cluster_name`, by instance id.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Provider`] if the listing fails.
    pub async fn instance_ips(
        &self,
        region: &str,
        cluster_name: &str,
    ) -> Result<BTreeMap<String, InstanceAddresses>, ProvisionError> {
        let filters = [
            Filter::states(&[InstanceState::Running]),
            cluster_filter(cluster_name),
        ];
        let instances = self.api.list_instances(region, &filters).await?;
        Ok(instances
            .into_iter()
            .map(|i| {
                (
                    i.id,
                    InstanceAddresses {
                        private_ip: i.private_ip,
                        public_ip: i.public_ip,
                    },
                )
            })
            .collect())
    }

    /// Block until every running instance of `cluster_name` serves SSH.
    ///
    /// Public addresses are probed; with `use_private` the private ones are,
    /// for callers inside the VPC. Instances without such an address are
    /// skipped. Returns the probed addresses.
    ///
    /// # Errors
    /// - [`ProvisionError::Provider`] if the listing fails.
    /// - [`ProvisionError::SshTimeout`] if the configured deadline passes.
    pub async fn wait_for_ssh(
        &self,
        region: &str,
        cluster_name: &str,
        use_private: bool,
        config: SshWaitConfig,
    ) -> Result<Vec<String>, ProvisionError> {
        let addresses: Vec<String> = self
            .instance_ips(region, cluster_name)
            .await?
            .into_iter()
            .filter_map(|(id, ips)| {
                let address = if use_private { ips.private_ip } else { ips.public_ip };
                if address.is_none() {
                    warn!(instance_id = %id, use_private, "Instance has no address to probe");
                }
                address
            })
            .collect();

        info!(cluster_name = %cluster_name, addresses = ?addresses, "Waiting for SSH");
        ssh::wait_for_ssh(&addresses, config).await?;
        Ok(addresses)
    }

    /// Every instance in `region`.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Provider`] if the listing fails.
    pub async fn describe_instances(&self, region: &str) -> Result<Vec<Instance>, ProvisionError> {
        Ok(self.api.list_instances(region, &[]).await?)
    }
}
