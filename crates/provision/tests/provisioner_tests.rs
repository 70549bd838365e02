//! Provisioner behaviour against an in-memory provider.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cto_provision::template::NetworkInterface;
use cto_provision::{
    Filter, Instance, InstanceApi, InstanceState, LaunchSpec, NodeTemplate, ProviderError,
    ProvisionError, Provisioner, Tag, TagSpecification, WaitConfig,
};

// ============================================================================
// In-memory provider
// ============================================================================

#[derive(Default)]
struct State {
    instances: Vec<Instance>,
    next_id: u32,
    /// Number of upcoming launches to reject with a capacity error.
    reject_launches: usize,
    list_calls: Vec<Vec<Filter>>,
    launches: Vec<LaunchSpec>,
    starts: Vec<Vec<String>>,
    tag_updates: Vec<(Vec<String>, Vec<Tag>)>,
    waits: Vec<(Vec<Filter>, InstanceState)>,
    /// Order in which mutating calls were made.
    calls: Vec<&'static str>,
}

#[derive(Default)]
struct FakeEc2 {
    state: Mutex<State>,
}

impl FakeEc2 {
    fn with_instances(instances: Vec<Instance>) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().instances = instances;
        fake
    }

    fn rejecting(self, launches: usize) -> Self {
        self.state.lock().unwrap().reject_launches = launches;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

fn matches_filter(instance: &Instance, filter: &Filter) -> bool {
    let attr = match filter.name.as_str() {
        "instance-state-name" => Some(instance.state.as_str().to_string()),
        "instance-id" => Some(instance.id.clone()),
        name => name
            .strip_prefix("tag:")
            .and_then(|key| instance.tags.get(key).cloned()),
    };
    attr.is_some_and(|a| filter.values.contains(&a))
}

#[async_trait]
impl InstanceApi for FakeEc2 {
    async fn list_instances(
        &self,
        _region: &str,
        filters: &[Filter],
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut state = self.state();
        state.list_calls.push(filters.to_vec());
        Ok(state
            .instances
            .iter()
            .filter(|i| filters.iter().all(|f| matches_filter(i, f)))
            .cloned()
            .collect())
    }

    async fn create_instances(
        &self,
        _region: &str,
        spec: LaunchSpec,
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut state = self.state();
        state.calls.push("create");
        state.launches.push(spec.clone());

        if state.reject_launches > 0 {
            state.reject_launches -= 1;
            return Err(ProviderError::Api {
                status: 500,
                code: "InsufficientInstanceCapacity".to_string(),
                message: "We currently do not have sufficient capacity".to_string(),
            });
        }

        let tags: BTreeMap<String, String> = spec
            .tag_specifications
            .iter()
            .filter(|ts| ts.resource_type == "instance")
            .flat_map(|ts| ts.tags.iter().map(|t| (t.key.clone(), t.value.clone())))
            .collect();

        let mut created = Vec::new();
        for _ in 0..spec.max_count {
            state.next_id += 1;
            created.push(Instance {
                id: format!("i-new{:04}", state.next_id),
                state: InstanceState::Pending,
                instance_type: spec.instance_type.clone(),
                private_ip: None,
                public_ip: None,
                tags: tags.clone(),
            });
        }
        state.instances.extend(created.iter().cloned());
        Ok(created)
    }

    async fn start_instances(&self, _region: &str, ids: &[String]) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push("start");
        state.starts.push(ids.to_vec());
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = InstanceState::Pending;
        }
        Ok(())
    }

    async fn stop_instances(&self, _region: &str, ids: &[String]) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push("stop");
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = InstanceState::Stopping;
        }
        Ok(())
    }

    async fn terminate_instances(
        &self,
        _region: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push("terminate");
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = InstanceState::ShuttingDown;
        }
        Ok(())
    }

    async fn create_tags(
        &self,
        _region: &str,
        ids: &[String],
        tags: &[Tag],
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push("tag");
        state.tag_updates.push((ids.to_vec(), tags.to_vec()));
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            for tag in tags {
                instance.tags.insert(tag.key.clone(), tag.value.clone());
            }
        }
        Ok(())
    }

    async fn wait_until(
        &self,
        _region: &str,
        filters: &[Filter],
        target: InstanceState,
        _config: WaitConfig,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push("wait");
        state.waits.push((filters.to_vec(), target));
        for instance in state
            .instances
            .iter_mut()
            .filter(|i| filters.iter().all(|f| matches_filter(i, f)))
        {
            instance.state = target;
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const REGION: &str = "us-east-1";

fn node(id: &str, cluster: &str, state: InstanceState) -> Instance {
    Instance {
        id: id.to_string(),
        state,
        instance_type: Some("m6i.large".to_string()),
        private_ip: Some("10.0.0.10".to_string()),
        public_ip: None,
        tags: BTreeMap::from([("ray-cluster-name".to_string(), cluster.to_string())]),
    }
}

fn template(subnets: &[&str]) -> NodeTemplate {
    NodeTemplate {
        image_id: Some("ami-0123456789abcdef0".to_string()),
        instance_type: Some("m6i.large".to_string()),
        subnet_ids: subnets.iter().map(ToString::to_string).collect(),
        security_group_ids: vec!["sg-1".to_string()],
        ..NodeTemplate::default()
    }
}

fn no_tags() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn launched_subnets(fake: &FakeEc2) -> Vec<String> {
    fake.state()
        .launches
        .iter()
        .map(|l| l.subnet_id.clone().unwrap_or_default())
        .collect()
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_exhausts_minimum_budget_rotating_subnets() {
    let provisioner = Provisioner::new(FakeEc2::default().rejecting(usize::MAX));

    let err = provisioner
        .create_instances(REGION, "c1", &template(&["subnet-a", "subnet-b"]), &no_tags(), 2)
        .await
        .unwrap_err();

    match err {
        ProvisionError::ProvisioningExhausted { attempts, source } => {
            assert_eq!(attempts, 5);
            assert!(source.is_client_error());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        launched_subnets(provisioner.api()),
        vec!["subnet-a", "subnet-b", "subnet-a", "subnet-b", "subnet-a"]
    );
}

#[tokio::test]
async fn test_create_budget_covers_every_subnet() {
    let subnets = ["s-1", "s-2", "s-3", "s-4", "s-5", "s-6", "s-7"];
    let provisioner = Provisioner::new(FakeEc2::default().rejecting(usize::MAX));

    let err = provisioner
        .create_instances(REGION, "c1", &template(&subnets), &no_tags(), 1)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::ProvisioningExhausted { attempts: 7, .. }
    ));
    assert_eq!(launched_subnets(provisioner.api()), subnets);
}

#[tokio::test]
async fn test_create_stops_at_first_success() {
    let provisioner = Provisioner::new(FakeEc2::default().rejecting(2));

    let created = provisioner
        .create_instances(REGION, "c1", &template(&["subnet-a", "subnet-b"]), &no_tags(), 3)
        .await
        .unwrap();

    assert_eq!(created.len(), 3);
    let fake = provisioner.api();
    assert_eq!(fake.state().launches.len(), 3);
    assert_eq!(launched_subnets(fake), vec!["subnet-a", "subnet-b", "subnet-a"]);

    let state = fake.state();
    let launch = &state.launches[2];
    assert_eq!(launch.min_count, 3);
    assert_eq!(launch.max_count, 3);
    assert_eq!(launch.security_group_ids, vec!["sg-1"]);
}

#[tokio::test]
async fn test_create_with_network_interfaces_pins_no_subnet() {
    let mut tmpl = template(&["subnet-a", "subnet-b"]);
    tmpl.network_interfaces = vec![NetworkInterface {
        device_index: 0,
        subnet_id: Some("subnet-z".to_string()),
        groups: vec!["sg-9".to_string()],
        associate_public_ip_address: Some(true),
        delete_on_termination: None,
    }];
    let provisioner = Provisioner::new(FakeEc2::default().rejecting(1));

    provisioner
        .create_instances(REGION, "c1", &tmpl, &no_tags(), 1)
        .await
        .unwrap();

    let state = provisioner.api().state();
    assert_eq!(state.launches.len(), 2);
    for launch in &state.launches {
        assert_eq!(launch.subnet_id, None);
        assert!(launch.security_group_ids.is_empty());
        assert_eq!(launch.network_interfaces.len(), 1);
    }
}

#[tokio::test]
async fn test_create_tags_and_user_tag_specs() {
    let mut tmpl = template(&["subnet-a"]);
    tmpl.tag_specifications = vec![
        TagSpecification {
            resource_type: "volume".to_string(),
            tags: vec![Tag::new("backup", "daily")],
        },
        TagSpecification::instance(vec![Tag::new("Name", "head"), Tag::new("team", "infra")]),
    ];
    let tags = BTreeMap::from([("ray-node-status".to_string(), "uninitialized".to_string())]);
    let provisioner = Provisioner::new(FakeEc2::default());

    let created = provisioner
        .create_instances(REGION, "c1", &tmpl, &tags, 1)
        .await
        .unwrap();

    let instance = created.values().next().unwrap();
    assert_eq!(instance.tags["ray-cluster-name"], "c1");
    assert_eq!(instance.tags["Name"], "head");
    assert_eq!(instance.tags["team"], "infra");
    assert_eq!(instance.tags["ray-node-status"], "uninitialized");

    let state = provisioner.api().state();
    let specs = &state.launches[0].tag_specifications;
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].resource_type, "instance");
    assert_eq!(specs[1].resource_type, "volume");
    assert_eq!(specs[1].tags, vec![Tag::new("backup", "daily")]);
}

#[tokio::test]
async fn test_caller_tags_override_identity_tags() {
    let tags = BTreeMap::from([("Name".to_string(), "c1-worker".to_string())]);
    let provisioner = Provisioner::new(FakeEc2::default());

    let created = provisioner
        .create_instances(REGION, "c1", &template(&["subnet-a"]), &tags, 1)
        .await
        .unwrap();

    let instance = created.values().next().unwrap();
    assert_eq!(instance.tags["Name"], "c1-worker");
    assert_eq!(instance.tags["ray-cluster-name"], "c1");
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_resume_without_tags_skips_tag_update() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Stopped),
        node("i-2", "other", InstanceState::Stopped),
        node("i-3", "c1", InstanceState::Running),
    ]);
    let provisioner = Provisioner::new(fake);

    let resumed = provisioner
        .resume_instances(REGION, "c1", &no_tags(), None)
        .await
        .unwrap();

    assert_eq!(resumed.keys().collect::<Vec<_>>(), vec!["i-1"]);
    let state = provisioner.api().state();
    assert_eq!(state.starts, vec![vec!["i-1".to_string()]]);
    assert!(state.tag_updates.is_empty());
    assert!(!state.calls.contains(&"tag"));
}

#[tokio::test]
async fn test_resume_applies_tags_in_one_batch() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Stopped),
        node("i-2", "c1", InstanceState::Stopped),
    ]);
    let provisioner = Provisioner::new(fake);
    let tags = BTreeMap::from([("ray-runtime-config".to_string(), "abc123".to_string())]);

    provisioner
        .resume_instances(REGION, "c1", &tags, None)
        .await
        .unwrap();

    let state = provisioner.api().state();
    assert_eq!(state.starts.len(), 1);
    assert_eq!(state.tag_updates.len(), 1);
    let (ids, tags) = &state.tag_updates[0];
    assert_eq!(ids, &vec!["i-1".to_string(), "i-2".to_string()]);
    assert_eq!(tags, &vec![Tag::new("ray-runtime-config", "abc123")]);
}

#[tokio::test]
async fn test_resume_waits_for_stopping_instances_before_start() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Stopped),
        node("i-2", "c1", InstanceState::Stopping),
    ]);
    let provisioner = Provisioner::new(fake);

    let resumed = provisioner
        .resume_instances(REGION, "c1", &no_tags(), None)
        .await
        .unwrap();

    assert_eq!(resumed.len(), 2);
    let state = provisioner.api().state();
    assert_eq!(state.calls, vec!["wait", "start"]);
    let (filters, target) = &state.waits[0];
    assert_eq!(target, &InstanceState::Stopped);
    assert_eq!(filters, &vec![Filter::instance_ids(&["i-2".to_string()])]);
    assert_eq!(state.starts[0], vec!["i-1".to_string(), "i-2".to_string()]);
}

#[tokio::test]
async fn test_resume_respects_max_count() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Stopped),
        node("i-2", "c1", InstanceState::Stopped),
        node("i-3", "c1", InstanceState::Stopped),
    ]);
    let provisioner = Provisioner::new(fake);

    let resumed = provisioner
        .resume_instances(REGION, "c1", &no_tags(), Some(2))
        .await
        .unwrap();

    assert_eq!(resumed.len(), 2);
    assert_eq!(provisioner.api().state().starts[0].len(), 2);
}

#[tokio::test]
async fn test_resume_nothing_to_resume_makes_no_mutations() {
    let provisioner = Provisioner::new(FakeEc2::default());

    let resumed = provisioner
        .resume_instances(REGION, "c1", &no_tags(), Some(3))
        .await
        .unwrap();

    assert!(resumed.is_empty());
    assert!(provisioner.api().state().calls.is_empty());
}

// ============================================================================
// Ensure count
// ============================================================================

#[tokio::test]
async fn test_ensure_count_resumes_then_creates_shortfall() {
    let fake = FakeEc2::with_instances(vec![node("i-stopped", "c1", InstanceState::Stopped)]);
    let provisioner = Provisioner::new(fake);

    let nodes = provisioner
        .ensure_count(REGION, "c1", &template(&["subnet-a"]), &no_tags(), 3, true)
        .await
        .unwrap();

    assert_eq!(nodes.len(), 3);
    assert!(nodes.contains_key("i-stopped"));

    let state = provisioner.api().state();
    assert_eq!(state.launches.len(), 1);
    assert_eq!(state.launches[0].max_count, 2);
    assert_eq!(state.launches[0].min_count, 2);
    assert!(state
        .instances
        .iter()
        .all(|i| i.tags.get("ray-cluster-name").map(String::as_str) == Some("c1")));
}

#[tokio::test]
async fn test_ensure_count_enough_stopped_creates_nothing() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Stopped),
        node("i-2", "c1", InstanceState::Stopped),
        node("i-3", "c1", InstanceState::Stopped),
        node("i-4", "c1", InstanceState::Stopped),
    ]);
    let provisioner = Provisioner::new(fake);

    let nodes = provisioner
        .ensure_count(REGION, "c1", &template(&["subnet-a"]), &no_tags(), 2, true)
        .await
        .unwrap();

    assert_eq!(nodes.len(), 2);
    let state = provisioner.api().state();
    assert!(state.launches.is_empty());
    assert_eq!(state.starts[0].len(), 2);
}

#[tokio::test]
async fn test_ensure_count_without_resume_only_creates() {
    let fake = FakeEc2::with_instances(vec![node("i-1", "c1", InstanceState::Stopped)]);
    let provisioner = Provisioner::new(fake);

    let nodes = provisioner
        .ensure_count(REGION, "c1", &template(&["subnet-a"]), &no_tags(), 2, false)
        .await
        .unwrap();

    assert_eq!(nodes.len(), 2);
    assert!(!nodes.contains_key("i-1"));
    let state = provisioner.api().state();
    assert!(state.list_calls.is_empty());
    assert!(state.starts.is_empty());
    assert_eq!(state.launches[0].max_count, 2);
}

#[tokio::test]
async fn test_ensure_count_does_not_count_running_instances() {
    // Running capacity is not subtracted: callers must pre-filter or they
    // over-provision.
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Running),
        node("i-2", "c1", InstanceState::Running),
    ]);
    let provisioner = Provisioner::new(fake);

    let nodes = provisioner
        .ensure_count(REGION, "c1", &template(&["subnet-a"]), &no_tags(), 2, true)
        .await
        .unwrap();

    assert_eq!(nodes.len(), 2);
    assert!(nodes.keys().all(|id| id.starts_with("i-new")));
    assert_eq!(provisioner.api().state().instances.len(), 4);
}

#[tokio::test]
async fn test_ensure_count_propagates_exhaustion() {
    let provisioner = Provisioner::new(FakeEc2::default().rejecting(usize::MAX));

    let err = provisioner
        .ensure_count(REGION, "c1", &template(&["subnet-a"]), &no_tags(), 1, true)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::ProvisioningExhausted { .. }));
}

// ============================================================================
// Stop / terminate / wait
// ============================================================================

#[tokio::test]
async fn test_stop_then_terminate_cluster() {
    let fake = FakeEc2::with_instances(vec![
        node("i-1", "c1", InstanceState::Running),
        node("i-2", "c1", InstanceState::Pending),
        node("i-3", "c1", InstanceState::Terminated),
        node("i-4", "other", InstanceState::Running),
    ]);
    let provisioner = Provisioner::new(fake);

    let stopped = provisioner.stop_instances(REGION, "c1").await.unwrap();
    assert_eq!(stopped, vec!["i-1".to_string(), "i-2".to_string()]);

    let terminated = provisioner.terminate_instances(REGION, "c1").await.unwrap();
    assert_eq!(terminated, vec!["i-1".to_string(), "i-2".to_string()]);

    let state = provisioner.api().state();
    assert_eq!(state.calls, vec!["stop", "terminate"]);
    let other = state.instances.iter().find(|i| i.id == "i-4").unwrap();
    assert_eq!(other.state, InstanceState::Running);
}

#[tokio::test]
async fn test_wait_stopped_excludes_terminated_instances() {
    let provisioner = Provisioner::new(FakeEc2::default());

    provisioner
        .wait_instances(REGION, "c1", InstanceState::Stopped)
        .await
        .unwrap();

    let state = provisioner.api().state();
    let (filters, target) = &state.waits[0];
    assert_eq!(target, &InstanceState::Stopped);
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0].name, "tag:ray-cluster-name");
    assert_eq!(
        filters[1].values,
        vec!["pending", "running", "shutting-down", "stopping", "stopped"]
    );
}

#[tokio::test]
async fn test_wait_unsupported_state_makes_no_call() {
    let provisioner = Provisioner::new(FakeEc2::default());

    let err = provisioner
        .wait_instances(REGION, "c1", InstanceState::Pending)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::UnsupportedState(InstanceState::Pending)
    ));
    assert!(provisioner.api().state().calls.is_empty());
    assert!("paused".parse::<InstanceState>().is_err());
}
