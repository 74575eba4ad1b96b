//! AWS Auto Scaling adapter
//!
//! Keeps a periodically refreshed cache of the account's auto-scaling groups
//! (filtered by configured tags) and of each instance's launch
//! configuration, and answers the scheduler's provider operations from it.
//! Mutations go straight to the AWS API: detach without decrementing desired
//! capacity, and shutdown-behavior=terminate ahead of a drain.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::types::{AttributeValue, Filter};
use k8s_openapi::api::core::v1::Node;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use culler_common::{Error, Result};

use super::CloudProvider;
use crate::settings::Settings;

/// One cached auto-scaling group
#[derive(Debug, Clone)]
struct AsgRecord {
    /// Display name: the configured name tag's value, or the ASG name
    name: String,
    /// The real AutoScalingGroupName, used for mutations
    asg_name: String,
    desired_capacity: i64,
    /// Canonical launch version: a launch configuration name or
    /// `<template-id>-<default-version>`
    launch_version: String,
}

#[derive(Debug, Default)]
struct Cache {
    groups: Vec<AsgRecord>,
    /// Instance id to its launch version. `None` marks an instance whose
    /// configuration no longer exists (necessarily out of date) or that
    /// runs outside any auto-scaling group.
    instance_templates: HashMap<String, Option<String>>,
}

/// AWS Auto Scaling implementation of [`CloudProvider`]
pub struct AwsProvider {
    asg: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
    filters: HashMap<String, String>,
    name_tag: Option<String>,
    instance_group_label: Option<String>,
    poll_period: Duration,
    cache: Mutex<Cache>,
}

impl AwsProvider {
    /// Create the adapter from ambient AWS credentials and the controller
    /// settings
    pub async fn new(settings: &Settings) -> Result<Self> {
        let shared = aws_config::load_from_env().await;
        Ok(Self {
            asg: aws_sdk_autoscaling::Client::new(&shared),
            ec2: aws_sdk_ec2::Client::new(&shared),
            filters: settings.asg_filter_map(),
            name_tag: settings.asg_name_tag.clone(),
            instance_group_label: settings.instance_group_label.clone(),
            poll_period: settings.provider_poll_period()?,
            cache: Mutex::new(Cache::default()),
        })
    }

    async fn sync(&self) {
        trace!("Syncing AWS auto-scaling cache");
        let (groups, mut instance_templates) = match self.fetch_groups().await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(error = %e, "Could not update AWS auto-scaling cache");
                return;
            }
        };

        // Running instances with no ASG membership: their configuration is
        // unconditionally out of date.
        match self.fetch_detached_instances().await {
            Ok(detached) => {
                for id in detached {
                    instance_templates.insert(id, None);
                }
            }
            Err(e) => error!(error = %e, "Could not list detached instances"),
        }

        let mut cache = self.cache.lock().await;
        cache.groups = groups;
        // Merge rather than replace: a node detached by us earlier this
        // cycle keeps its (now absent) membership marked.
        cache.instance_templates.extend(instance_templates);
        trace!("Finished syncing AWS auto-scaling cache");
    }

    async fn fetch_groups(&self) -> Result<(Vec<AsgRecord>, HashMap<String, Option<String>>)> {
        let mut raw_groups = Vec::new();
        let mut pages = self.asg.describe_auto_scaling_groups().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page
                .map_err(|e| Error::provider(format!("DescribeAutoScalingGroups: {}", e)))?;
            raw_groups.extend(page.auto_scaling_groups().iter().cloned());
        }

        // Tag-filter and name the groups
        let mut kept = Vec::new();
        'groups: for group in raw_groups {
            let tags: HashMap<String, String> = group
                .tags()
                .iter()
                .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                .collect();
            for (fk, fv) in &self.filters {
                if tags.get(fk) != Some(fv) {
                    continue 'groups;
                }
            }
            let asg_name = group.auto_scaling_group_name().unwrap_or_default().to_string();
            let name = self
                .name_tag
                .as_ref()
                .and_then(|tag| tags.get(tag).cloned())
                .unwrap_or_else(|| asg_name.clone());
            kept.push((group, asg_name, name));
        }

        // Resolve launch template ids to their default versions
        let mut template_ids = Vec::new();
        for (group, _, _) in &kept {
            if let Some(id) = group
                .mixed_instances_policy()
                .and_then(|p| p.launch_template())
                .and_then(|lt| lt.launch_template_specification())
                .and_then(|s| s.launch_template_id())
            {
                template_ids.push(id.to_string());
            }
            if let Some(id) = group.launch_template().and_then(|lt| lt.launch_template_id()) {
                template_ids.push(id.to_string());
            }
        }
        let canonical = self.fetch_canonical_templates(template_ids).await?;

        let mut records = Vec::new();
        let mut instance_templates = HashMap::new();
        for (group, asg_name, name) in kept {
            let launch_version = if let Some(lc) = group.launch_configuration_name() {
                lc.to_string()
            } else if let Some(id) = group
                .mixed_instances_policy()
                .and_then(|p| p.launch_template())
                .and_then(|lt| lt.launch_template_specification())
                .and_then(|s| s.launch_template_id())
            {
                canonical.get(id).cloned().unwrap_or_default()
            } else if let Some(id) =
                group.launch_template().and_then(|lt| lt.launch_template_id())
            {
                canonical.get(id).cloned().unwrap_or_default()
            } else {
                String::new()
            };

            for instance in group.instances() {
                let Some(id) = instance.instance_id() else {
                    continue;
                };
                if let Some(lc) = instance.launch_configuration_name() {
                    instance_templates.insert(id.to_string(), Some(lc.to_string()));
                } else if let Some(lt) = instance.launch_template() {
                    if let (Some(lt_id), Some(version)) =
                        (lt.launch_template_id(), lt.version())
                    {
                        instance_templates
                            .insert(id.to_string(), Some(canonical_template(lt_id, version)));
                    }
                }
            }

            records.push(AsgRecord {
                name,
                asg_name,
                desired_capacity: i64::from(group.desired_capacity().unwrap_or_default()),
                launch_version,
            });
        }

        Ok((records, instance_templates))
    }

    async fn fetch_canonical_templates(
        &self,
        template_ids: Vec<String>,
    ) -> Result<HashMap<String, String>> {
        let mut canonical = HashMap::new();
        if template_ids.is_empty() {
            return Ok(canonical);
        }

        let mut pages = self
            .ec2
            .describe_launch_templates()
            .set_launch_template_ids(Some(template_ids))
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|e| Error::provider(format!("DescribeLaunchTemplates: {}", e)))?;
            for template in page.launch_templates() {
                if let (Some(id), Some(version)) = (
                    template.launch_template_id(),
                    template.default_version_number(),
                ) {
                    canonical.insert(id.to_string(), canonical_template(id, version));
                }
            }
        }
        Ok(canonical)
    }

    async fn fetch_detached_instances(&self) -> Result<Vec<String>> {
        let mut request = self.ec2.describe_instances().filters(
            Filter::builder()
                .name("instance-state-name")
                .values("running")
                .build(),
        );
        for (fk, fv) in &self.filters {
            request = request.filters(
                Filter::builder()
                    .name(format!("tag:{}", fk))
                    .values(fv)
                    .build(),
            );
        }

        let mut detached = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Error::provider(format!("DescribeInstances: {}", e)))?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    let in_asg = instance
                        .tags()
                        .iter()
                        .any(|t| t.key() == Some("aws:autoscaling:groupName"));
                    if in_asg {
                        continue;
                    }
                    if let Some(id) = instance.instance_id() {
                        detached.push(id.to_string());
                    }
                }
            }
        }
        Ok(detached)
    }

    fn node_group_name(&self, node: &Node) -> String {
        self.instance_group_label
            .as_ref()
            .and_then(|label| node.metadata.labels.as_ref()?.get(label))
            .cloned()
            .unwrap_or_default()
    }

    async fn group_for(&self, node: &Node) -> Result<AsgRecord> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let group_name = self.node_group_name(node);
        let cache = self.cache.lock().await;
        cache
            .groups
            .iter()
            .find(|g| g.name == group_name)
            .cloned()
            .ok_or_else(|| {
                Error::provider_for(
                    name,
                    format!("no auto-scaling group named '{}'", group_name),
                )
            })
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn desired_size(&self, group: &str) -> Result<i64> {
        let cache = self.cache.lock().await;
        cache
            .groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.desired_capacity)
            .ok_or_else(|| Error::provider_for(group, "no auto-scaling group with that name"))
    }

    async fn outdated_template(&self, node: &Node) -> Result<bool> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let group_name = self.node_group_name(node);
        if group_name.is_empty() {
            return Ok(false);
        }

        let id = instance_id(node)?;
        let cache = self.cache.lock().await;
        let group_version = cache
            .groups
            .iter()
            .find(|g| g.name == group_name)
            .map(|g| g.launch_version.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::provider_for(
                    name,
                    format!("no auto-scaling group named '{}'", group_name),
                )
            })?;

        match cache.instance_templates.get(&id) {
            // The instance's launch config is gone entirely, so it is
            // definitely out of sync
            Some(None) => Ok(true),
            Some(Some(current)) => Ok(*current != group_version),
            None => Err(Error::provider_for(
                name,
                format!("configuration for instance {} not found", id),
            )),
        }
    }

    async fn pre_drain(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let id = instance_id(node)?;

        // Make sure that when the node agent powers the host off, the
        // instance terminates instead of merely stopping
        self.ec2
            .modify_instance_attribute()
            .instance_id(&id)
            .instance_initiated_shutdown_behavior(
                AttributeValue::builder().value("terminate").build(),
            )
            .send()
            .await
            .map_err(|e| {
                Error::provider_for(name, format!("setting shutdown behavior for {}: {}", id, e))
            })?;
        info!(node = name, instance = %id, "Set shutdown behavior to terminate");
        Ok(())
    }

    async fn detach(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let id = instance_id(node)?;
        let group = self.group_for(node).await?;

        // Detaching without decrementing desired capacity makes the
        // auto-scaler spin up a replacement right away
        self.asg
            .detach_instances()
            .auto_scaling_group_name(&group.asg_name)
            .instance_ids(&id)
            .should_decrement_desired_capacity(false)
            .send()
            .await
            .map_err(|e| {
                Error::provider_for(
                    name,
                    format!("detaching {} from {}: {}", id, group.asg_name, e),
                )
            })?;
        info!(node = name, instance = %id, group = %group.asg_name, "Detached node from its auto-scaling group");
        Ok(())
    }

    async fn run(&self, stop: CancellationToken) {
        self.sync().await;
        let mut interval = tokio::time::interval(self.poll_period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.sync().await;
        }
    }
}

fn canonical_template(id: &str, version: impl std::fmt::Display) -> String {
    format!("{}-{}", id, version)
}

// providerID has the form aws:///us-west-2a/i-0123456789abcdef0
fn instance_id(node: &Node) -> Result<String> {
    let name = node.metadata.name.as_deref().unwrap_or_default();
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default();
    let parts: Vec<&str> = provider_id.split('/').collect();
    if parts.len() != 5 || parts[0] != "aws:" {
        return Err(Error::provider_permanent(
            name,
            format!("could not parse providerID '{}'", provider_id),
        ));
    }
    Ok(parts[4].to_string())
}
